//! Drone photogrammetry pipeline: stage orchestration, DEM tiling, GSD
//! capping and multispectral band alignment around external SfM, MVS,
//! PDAL and GDAL tools.
pub mod bounds;
pub mod cancel;
pub mod config;
pub mod constants;
pub mod cropper;
pub mod dem;
pub mod error;
pub mod gcp;
pub mod geometry;
pub mod georef;
pub mod gsd;
pub mod mesh;
pub mod multispectral;
pub mod photo;
pub mod pipeline;
pub mod point_cloud;
pub mod reconstruction;
pub mod retry;
pub mod runner;
pub mod sfm;
pub mod stages;
pub mod utm;

pub use cancel::CancelToken;
pub use config::{PipelineConfig, ProjectTree};
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunSummary};
pub use stages::StageId;
