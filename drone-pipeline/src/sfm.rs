/// Sparse reconstruction model read from OpenSfM output
use crate::config::load_json_file;
use crate::error::{PipelineError, Result};
use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Sparse 3D point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfmPoint {
    pub coordinates: [f64; 3],
}

/// Camera pose as an axis-angle rotation and translation (world to camera).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfmShot {
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
    #[serde(default)]
    pub gps_dop: Option<f64>,
    #[serde(default)]
    pub camera: Option<String>,
}

impl SfmShot {
    /// Camera centre in world coordinates.
    pub fn origin(&self) -> Vector3<f64> {
        shot_origin(self.rotation, self.translation)
    }
}

/// First reconstruction of a `reconstruction.json` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SfmReconstruction {
    #[serde(default)]
    pub points: BTreeMap<String, SfmPoint>,
    #[serde(default)]
    pub shots: BTreeMap<String, SfmShot>,
}

impl SfmReconstruction {
    /// Load the first reconstruction from an OpenSfM JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::missing("reconstruction", path));
        }
        let reconstructions: Vec<SfmReconstruction> = load_json_file(path)?;
        reconstructions
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::malformed("reconstruction", "no reconstruction in file"))
    }

    pub fn point_heights(&self) -> Vec<f64> {
        self.points.values().map(|p| p.coordinates[2]).collect()
    }
}

/// Rotation matrix from an axis-angle (Rodrigues) vector.
pub fn rotation_matrix(axis_angle: [f64; 3]) -> Matrix3<f64> {
    Rotation3::from_scaled_axis(Vector3::from(axis_angle)).into_inner()
}

/// Camera origin `-Rᵀ·t`.
pub fn shot_origin(rotation: [f64; 3], translation: [f64; 3]) -> Vector3<f64> {
    let r = rotation_matrix(rotation);
    -(r.transpose() * Vector3::from(translation))
}
