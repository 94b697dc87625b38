//! Pipeline stages.
//!
//! Each stage is a value implementing [`Stage`]; the orchestrator runs them in
//! [`StageId`] order against a shared [`StageContext`]. Whether a stage can be
//! skipped is decided from the files it leaves on disk, so an interrupted run
//! resumes where it stopped.
pub mod dataset;
pub mod dem;
pub mod filter;
pub mod georef;
pub mod mesh;
pub mod openmvs;
pub mod opensfm;
pub mod ortho;
pub mod report;
pub mod texture;

use crate::cancel::CancelToken;
use crate::config::{PipelineConfig, ProjectTree};
use crate::error::Result;
use crate::georef::Georef;
use crate::multispectral::AlignmentInfo;
use crate::reconstruction::Reconstruction;
use crate::runner::{RunLog, Toolkit};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Ordered pipeline phases; the order drives both execution and re-run checks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Dataset,
    #[value(name = "opensfm")]
    OpenSfm,
    #[value(name = "openmvs")]
    OpenMvs,
    Filter,
    Mesh,
    Texture,
    Georeference,
    Dem,
    Orthophoto,
    Report,
}

impl StageId {
    pub const ALL: [StageId; 10] = [
        StageId::Dataset,
        StageId::OpenSfm,
        StageId::OpenMvs,
        StageId::Filter,
        StageId::Mesh,
        StageId::Texture,
        StageId::Georeference,
        StageId::Dem,
        StageId::Orthophoto,
        StageId::Report,
    ];

    /// Display name, also the benchmark log key.
    pub fn name(self) -> &'static str {
        match self {
            StageId::Dataset => "Load Dataset",
            StageId::OpenSfm => "OpenSFM",
            StageId::OpenMvs => "OpenMVS",
            StageId::Filter => "Filter Points",
            StageId::Mesh => "Mesh",
            StageId::Texture => "Texture",
            StageId::Georeference => "Georeference",
            StageId::Dem => "DEM",
            StageId::Orthophoto => "Orthophoto",
            StageId::Report => "Report",
        }
    }
}

/// Everything a stage reads or updates while running.
pub struct StageContext<'a> {
    pub config: &'a PipelineConfig,
    pub tree: &'a ProjectTree,
    pub tools: Toolkit<'a>,
    pub run_log: &'a RunLog,
    pub cancel: &'a CancelToken,
    pub reconstruction: Reconstruction,
    /// Band alignment, set by the SfM stage for multi-camera captures.
    pub alignment: Option<AlignmentInfo>,
    /// Crop buffer for this run; cleared when crop bounds cannot be computed.
    pub crop: f64,
}

impl<'a> StageContext<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        tree: &'a ProjectTree,
        tools: Toolkit<'a>,
        run_log: &'a RunLog,
        cancel: &'a CancelToken,
        reconstruction: Reconstruction,
    ) -> Self {
        Self {
            config,
            tree,
            tools,
            run_log,
            cancel,
            reconstruction,
            alignment: None,
            crop: config.crop,
        }
    }

    pub fn rerun(&self, stage: StageId) -> bool {
        self.config.rerun(stage)
    }

    /// True when `output` is missing or `stage` is forced to re-run.
    pub fn needs_run(&self, stage: StageId, output: &Path, label: &str) -> bool {
        if !output.exists() || self.rerun(stage) {
            return true;
        }
        info!("Found existing {}: '{}'", label, output.display());
        false
    }

    pub fn georef(&self) -> Georef {
        Georef::read(&self.tree.georef_coords)
    }

    pub fn is_georef(&self) -> bool {
        self.reconstruction.is_georef(self.tree)
    }

    pub fn has_gcp(&self) -> bool {
        self.reconstruction.has_gcp(self.tree)
    }

    pub fn image_count(&self) -> usize {
        self.reconstruction.photos.len()
    }
}

/// One pipeline phase.
pub trait Stage {
    fn id(&self) -> StageId;

    /// Whether the stage's final artefacts are already on disk.
    fn outputs_exist(&self, ctx: &StageContext) -> bool;

    fn run(&self, ctx: &mut StageContext) -> Result<()>;
}

/// Every stage, in execution order.
pub fn pipeline_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(dataset::DatasetStage),
        Box::new(opensfm::OpenSfmStage),
        Box::new(openmvs::OpenMvsStage),
        Box::new(filter::FilterStage),
        Box::new(mesh::MeshStage),
        Box::new(texture::TextureStage),
        Box::new(georef::GeorefStage),
        Box::new(dem::DemStage),
        Box::new(ortho::OrthoStage),
        Box::new(report::ReportStage),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_listed_in_id_order() {
        let ids: Vec<StageId> = pipeline_stages().iter().map(|s| s.id()).collect();
        assert_eq!(ids, StageId::ALL.to_vec());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn names_match_benchmark_keys() {
        assert_eq!(StageId::Dataset.name(), "Load Dataset");
        assert_eq!(StageId::Filter.name(), "Filter Points");
        assert_eq!(StageId::OpenSfm.name(), "OpenSFM");
    }

    #[test]
    fn stage_ids_deserialize_lowercase() {
        let id: StageId = serde_json::from_str("\"opensfm\"").unwrap();
        assert_eq!(id, StageId::OpenSfm);
        let id: StageId = serde_json::from_str("\"georeference\"").unwrap();
        assert_eq!(id, StageId::Georeference);
    }
}
