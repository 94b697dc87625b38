//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use drone_pipeline::config::{PipelineConfig, ProjectTree};
use drone_pipeline::photo::{GpsPosition, Photo};
use drone_pipeline::runner::{CommandRunner, ExternalToolSpec, ToolStatus};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Runner that records every command line and fakes the files a tool would write.
///
/// Any absolute argument under `root` that has an extension and does not exist
/// yet is created empty; `pdal pipeline -i` also creates its writers' outputs,
/// and captured stdout receives a canned `pdal info` document.
pub struct RecordingRunner {
    pub root: PathBuf,
    pub status: ToolStatus,
    pub commands: Mutex<Vec<String>>,
    pub extent: [f64; 4],
}

impl RecordingRunner {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            status: ToolStatus::Success,
            commands: Mutex::new(Vec::new()),
            extent: [0.0, 100.0, 0.0, 50.0],
        }
    }

    pub fn failing(root: &Path) -> Self {
        Self {
            status: ToolStatus::Abnormal,
            ..Self::new(root)
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    fn pdal_info(&self) -> Value {
        let [minx, maxx, miny, maxy] = self.extent;
        let bounds = json!({
            "minx": minx, "maxx": maxx, "miny": miny, "maxy": maxy, "minz": 0.0, "maxz": 10.0
        });
        json!({
            "summary": { "bounds": bounds },
            "stats": { "bbox": { "native": { "bbox": bounds } } }
        })
    }

    fn create_pipeline_outputs(&self, pipeline_file: &Path) {
        let Ok(text) = fs::read_to_string(pipeline_file) else {
            return;
        };
        let Ok(Value::Array(stages)) = serde_json::from_str::<Value>(&text) else {
            return;
        };
        for stage in stages {
            if let Some(filename) = stage.get("filename").and_then(Value::as_str) {
                touch(Path::new(filename));
            }
        }
    }
}

impl CommandRunner for RecordingRunner {
    fn execute(&self, spec: &ExternalToolSpec) -> ToolStatus {
        let line = format!("{} {}", spec.program_name(), spec.args.join(" "));
        self.commands.lock().unwrap().push(line);

        if self.status != ToolStatus::Success {
            return self.status;
        }

        if let Some(capture) = &spec.capture_stdout {
            fs::write(capture, self.pdal_info().to_string()).unwrap();
        }
        if spec.args.first().map(String::as_str) == Some("pipeline") {
            if let Some(file) = spec.args.get(2) {
                self.create_pipeline_outputs(Path::new(file));
            }
        }
        for arg in &spec.args {
            let path = Path::new(arg);
            if path.starts_with(&self.root) && path.extension().is_some() && !path.exists() {
                touch(path);
            }
        }
        ToolStatus::Success
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, "").unwrap();
}

/// Photos over northern Italy (UTM zone 32N).
pub fn gps_photos(count: usize) -> Vec<Photo> {
    (0..count)
        .map(|i| Photo {
            path: PathBuf::from(format!("/data/images/IMG_{i:04}.JPG")),
            width: 4000,
            height: 3000,
            camera_make: "DJI".into(),
            camera_model: "FC6310".into(),
            band_name: "RGB".into(),
            gps: Some(GpsPosition {
                latitude: 46.5 + i as f64 * 1e-4,
                longitude: 9.0,
                altitude: 120.0,
            }),
            capture_epoch: 1_600_000_000.0 + i as f64,
            ..Photo::default()
        })
        .collect()
}

/// Photos of a four band rig, captured together in groups of four.
pub fn multispectral_photos(captures: usize) -> Vec<Photo> {
    let bands = ["Blue", "Green", "Red", "NIR"];
    let mut photos = Vec::new();
    for capture in 0..captures {
        for (index, band) in bands.iter().enumerate() {
            photos.push(Photo {
                path: PathBuf::from(format!("/data/IMG_{capture:04}_{}.tif", index + 1)),
                width: 1280,
                height: 960,
                band_name: band.to_string(),
                band_index: index as u32,
                capture_uuid: Some(format!("capture-{capture}")),
                ..Photo::default()
            });
        }
    }
    photos
}

/// Configuration with cropping off and GSD capping skipped.
pub fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        crop: 0.0,
        ignore_gsd: true,
        max_concurrency: 2,
        ..PipelineConfig::default()
    }
}

/// Lay down every final artefact so each stage finds its outputs.
pub fn complete_project(tree: &ProjectTree, photos: &[Photo]) {
    fs::create_dir_all(&tree.georef_path).unwrap();
    drone_pipeline::stages::dataset::write_coordinates(photos, &tree.georef_coords, &tree.georef_proj)
        .unwrap();
    for path in [
        &tree.images_json,
        &tree.opensfm_reconstruction,
        &tree.openmvs_model,
        &tree.filtered_point_cloud,
        &tree.mesh_file,
        &tree.mesh_file_25d,
        &tree.georef_model_laz,
        &tree.orthophoto_tif,
        &tree.report_json,
    ] {
        touch(path);
    }
    touch(&tree.texture_path.join(&tree.textured_model_obj));
    touch(&tree.texture_path_25d.join(&tree.textured_model_obj));
}
