/// Immutable pipeline configuration, tool locations and the output path tree
use crate::error::Result;
use crate::multispectral::AlignmentScorePolicy;
use crate::stages::StageId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Point cloud density preset driving depth map resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PcQuality {
    Ultra,
    High,
    Medium,
    Low,
    Lowest,
}

impl PcQuality {
    /// Fraction of the largest photo side used for depth maps.
    pub fn scale(self) -> f64 {
        match self {
            PcQuality::Ultra => 0.5,
            PcQuality::High => 0.25,
            PcQuality::Medium => 0.125,
            PcQuality::Low => 0.0675,
            PcQuality::Lowest => 0.03375,
        }
    }
}

/// All user-facing pipeline parameters.
/// Built once at startup and shared read-only with every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Requested DEM resolution in cm/pixel.
    pub dem_resolution: f64,
    /// Requested orthophoto resolution in cm/pixel.
    pub ortho_resolution: f64,
    /// Number of radius steps used for DEM gap filling (0 disables gap fill).
    pub dem_gapfill_steps: usize,
    /// Keep every n-th point when rasterising.
    pub dem_decimation: u32,
    /// Keep an unfilled DEM copy alongside the gap-filled one.
    pub dem_euclidean_map: bool,
    pub dsm: bool,
    pub dtm: bool,
    pub max_concurrency: usize,
    pub octree_depth: u32,
    pub mesh_size: u32,
    /// Crop buffer in metres (0 disables cropping).
    pub crop: f64,
    /// Standard deviation threshold for outlier removal.
    pub pc_filter: f64,
    /// Sampling radius in metres (0 disables sampling).
    pub pc_sample: f64,
    pub pc_quality: PcQuality,
    pub fast_orthophoto: bool,
    pub use_3dmesh: bool,
    pub skip_3dmodel: bool,
    pub skip_orthophoto: bool,
    pub ignore_gsd: bool,
    /// Primary band name for multispectral alignment, or "auto".
    pub primary_band: String,
    pub max_alignment_samples: usize,
    pub alignment_score: AlignmentScorePolicy,
    pub undistorted_image_max_size: u32,
    /// Optional ground control point file.
    pub gcp_file: Option<PathBuf>,
    /// First stage forced to re-run; earlier stages reuse existing outputs.
    pub rerun_from: Option<StageId>,
    pub tools: ToolPaths,
    /// Directory prepended to bare tool names.
    pub tools_dir: Option<PathBuf>,
    /// Environment overlay applied to every external invocation.
    pub tool_env: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dem_resolution: 5.0,
            ortho_resolution: 5.0,
            dem_gapfill_steps: 3,
            dem_decimation: 1,
            dem_euclidean_map: false,
            dsm: false,
            dtm: false,
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            octree_depth: 11,
            mesh_size: 200_000,
            crop: 3.0,
            pc_filter: 2.5,
            pc_sample: 0.0,
            pc_quality: PcQuality::Medium,
            fast_orthophoto: false,
            use_3dmesh: false,
            skip_3dmodel: false,
            skip_orthophoto: false,
            ignore_gsd: false,
            primary_band: "auto".to_string(),
            max_alignment_samples: 30,
            alignment_score: AlignmentScorePolicy::default(),
            undistorted_image_max_size: crate::constants::UNDISTORTED_IMAGE_MAX_SIZE,
            gcp_file: None,
            rerun_from: None,
            tools: ToolPaths::default(),
            tools_dir: None,
            tool_env: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from JSON, falling back to defaults for absent keys.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        load_json_file(path)
    }

    /// Whether a stage must execute even when its outputs exist.
    pub fn rerun(&self, stage: StageId) -> bool {
        self.rerun_from.is_some_and(|first| stage >= first)
    }

    /// Tool table with `tools_dir` applied to bare program names.
    pub fn resolved_tools(&self) -> ToolPaths {
        match &self.tools_dir {
            Some(dir) => self.tools.rooted_at(dir),
            None => self.tools.clone(),
        }
    }
}

/// External program locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub opensfm: PathBuf,
    pub densify: PathBuf,
    pub filter: PathBuf,
    pub pdal: PathBuf,
    pub poisson: PathBuf,
    pub recon_mesh: PathBuf,
    pub recon_tex: PathBuf,
    pub gdal_addo: PathBuf,
    pub gdal_buildvrt: PathBuf,
    pub gdal_translate: PathBuf,
    pub gdal_warp: PathBuf,
    pub gdal_fillnodata: PathBuf,
    pub dem2mesh: PathBuf,
    pub dem2points: PathBuf,
    pub odm_orthophoto: PathBuf,
    pub ogr2ogr: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            opensfm: "opensfm".into(),
            densify: "DensifyPointCloud".into(),
            filter: "FPCFilter".into(),
            pdal: "pdal".into(),
            poisson: "PoissonRecon".into(),
            recon_mesh: "ReconstructMesh".into(),
            recon_tex: "texrecon".into(),
            gdal_addo: "gdaladdo".into(),
            gdal_buildvrt: "gdalbuildvrt".into(),
            gdal_translate: "gdal_translate".into(),
            gdal_warp: "gdalwarp".into(),
            gdal_fillnodata: "gdal_fillnodata.py".into(),
            dem2mesh: "dem2mesh".into(),
            dem2points: "dem2points".into(),
            odm_orthophoto: "odm_orthophoto".into(),
            ogr2ogr: "ogr2ogr".into(),
        }
    }
}

impl ToolPaths {
    /// Prefix every relative program path with `dir`.
    pub fn rooted_at(&self, dir: &Path) -> Self {
        let root = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                dir.join(p)
            }
        };
        Self {
            opensfm: root(&self.opensfm),
            densify: root(&self.densify),
            filter: root(&self.filter),
            pdal: root(&self.pdal),
            poisson: root(&self.poisson),
            recon_mesh: root(&self.recon_mesh),
            recon_tex: root(&self.recon_tex),
            gdal_addo: root(&self.gdal_addo),
            gdal_buildvrt: root(&self.gdal_buildvrt),
            gdal_translate: root(&self.gdal_translate),
            gdal_warp: root(&self.gdal_warp),
            gdal_fillnodata: root(&self.gdal_fillnodata),
            dem2mesh: root(&self.dem2mesh),
            dem2points: root(&self.dem2points),
            odm_orthophoto: root(&self.odm_orthophoto),
            ogr2ogr: root(&self.ogr2ogr),
        }
    }
}

/// Every path the pipeline reads or writes, derived from the output root.
#[derive(Debug, Clone)]
pub struct ProjectTree {
    pub root: PathBuf,
    pub run_log: PathBuf,
    pub benchmark_log: PathBuf,
    pub img_list: PathBuf,
    pub images_json: PathBuf,
    pub cameras_json: PathBuf,

    pub opensfm: PathBuf,
    pub opensfm_reconstruction: PathBuf,
    pub opensfm_reconstruction_nvm: PathBuf,
    pub opensfm_geocoords_reconstruction: PathBuf,
    pub opensfm_stats: PathBuf,
    pub band_alignment: PathBuf,

    pub openmvs: PathBuf,
    pub openmvs_model: PathBuf,

    pub filter_path: PathBuf,
    pub filtered_point_cloud: PathBuf,
    pub filtered_point_cloud_stats: PathBuf,

    pub mesh_path: PathBuf,
    pub mesh_file: PathBuf,
    pub mesh_file_25d: PathBuf,

    pub texture_path: PathBuf,
    pub texture_path_25d: PathBuf,
    pub textured_model_obj: String,

    pub georef_path: PathBuf,
    pub georef_coords: PathBuf,
    pub georef_proj: PathBuf,
    pub georef_model_laz: PathBuf,
    pub georef_gcp: PathBuf,
    pub georef_bounds_gpkg: PathBuf,

    pub dem_path: PathBuf,

    pub ortho_path: PathBuf,
    pub orthophoto_tif: PathBuf,
    pub orthophoto_render: PathBuf,
    pub orthophoto_log: PathBuf,
    pub orthophoto_corners: PathBuf,

    pub report_path: PathBuf,
    pub report_json: PathBuf,
}

impl ProjectTree {
    pub fn new(root: &Path) -> Self {
        let root = root.to_path_buf();
        let opensfm = root.join("opensfm");
        let openmvs = opensfm.join("undistorted").join("openmvs");
        let filter_path = root.join("odm_filterpoints");
        let mesh_path = root.join("odm_meshing");
        let georef_path = root.join("odm_georeferencing");
        let ortho_path = root.join("odm_orthophoto");
        let report_path = root.join("report");

        Self {
            run_log: root.join(crate::constants::RUN_LOG),
            benchmark_log: root.join(crate::constants::BENCHMARK_LOG),
            img_list: root.join("img_list.txt"),
            images_json: root.join("images.json"),
            cameras_json: root.join("cameras.json"),

            opensfm_reconstruction: opensfm.join("reconstruction.json"),
            opensfm_reconstruction_nvm: opensfm.join("undistorted").join("reconstruction.nvm"),
            opensfm_geocoords_reconstruction: opensfm.join("reconstruction.geocoords.json"),
            opensfm_stats: opensfm.join("stats").join("stats.json"),
            band_alignment: opensfm.join("band_alignment.json"),
            opensfm,

            openmvs_model: openmvs.join("scene_dense_dense_filtered.ply"),
            openmvs,

            filtered_point_cloud: filter_path.join("point_cloud.ply"),
            filtered_point_cloud_stats: filter_path.join("point_cloud_stats.json"),
            filter_path,

            mesh_file: mesh_path.join("odm_mesh.ply"),
            mesh_file_25d: mesh_path.join("odm_25dmesh.ply"),
            mesh_path,

            texture_path: root.join("mvs_texturing"),
            texture_path_25d: root.join("odm_texturing_25d"),
            textured_model_obj: "textured_model_geo.obj".to_string(),

            georef_coords: georef_path.join("coords.txt"),
            georef_proj: georef_path.join("proj.txt"),
            georef_model_laz: georef_path.join("odm_georeferenced_model.laz"),
            georef_gcp: georef_path.join("gcp_list.txt"),
            georef_bounds_gpkg: georef_path.join("odm_georeferenced_model.bounds.gpkg"),
            georef_path,

            dem_path: root.join("odm_dem"),

            orthophoto_tif: ortho_path.join("odm_orthophoto.tif"),
            orthophoto_render: ortho_path.join("odm_orthophoto_render.tif"),
            orthophoto_log: ortho_path.join("odm_orthophoto_log.txt"),
            orthophoto_corners: ortho_path.join("odm_orthophoto_corners.txt"),
            ortho_path,

            report_json: report_path.join("report.json"),
            report_path,

            root,
        }
    }
}

/// Deserialize a JSON document from disk.
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path)?;
    let value = serde_json::from_str(&data)?;
    Ok(value)
}

/// Serialize a value to pretty JSON on disk.
pub fn write_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}
