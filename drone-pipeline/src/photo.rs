/// Input photo metadata and camera derivations
use crate::constants::{DEFAULT_BAND_NAME, DEFAULT_FOCAL_RATIO};
use crate::error::{PipelineError, Result};
use chrono::NaiveDateTime;
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// GPS position from EXIF.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// One input image. Constructed at dataset load and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Photo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub exif_width: u32,
    pub exif_height: u32,
    pub camera_make: String,
    pub camera_model: String,
    pub band_name: String,
    pub band_index: u32,
    pub gps: Option<GpsPosition>,
    pub focal_ratio: f64,
    /// Seconds since the Unix epoch.
    pub capture_epoch: f64,
    pub capture_uuid: Option<String>,
}

impl Default for Photo {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            width: 0,
            height: 0,
            exif_width: 0,
            exif_height: 0,
            camera_make: String::new(),
            camera_model: String::new(),
            band_name: DEFAULT_BAND_NAME.to_string(),
            band_index: 0,
            gps: None,
            focal_ratio: DEFAULT_FOCAL_RATIO,
            capture_epoch: 0.0,
            capture_uuid: None,
        }
    }
}

impl Photo {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Camera identifier shared by photos from the same sensor.
    pub fn camera_string(&self, opensfm: bool) -> String {
        let id = format!(
            "{} {} {} {} brown {:.4}",
            self.camera_make, self.camera_model, self.width, self.height, self.focal_ratio
        )
        .to_lowercase();
        if opensfm { format!("v2 {id}") } else { id }
    }
}

/// Load a photo manifest (a JSON array of photo records).
pub fn load_photos(path: &Path) -> Result<Vec<Photo>> {
    if !path.exists() {
        return Err(PipelineError::missing("photo manifest", path));
    }
    let mut photos: Vec<Photo> = crate::config::load_json_file(path)?;
    for photo in &mut photos {
        if photo.band_name.trim().is_empty() {
            photo.band_name = DEFAULT_BAND_NAME.to_string();
            photo.band_index = 0;
        }
    }
    Ok(photos)
}

/// Millimetres per EXIF focal plane resolution unit.
fn mm_per_unit(resolution_unit: u16) -> Option<f64> {
    match resolution_unit {
        2 => Some(25.4),
        3 => Some(10.0),
        4 => Some(1.0),
        5 => Some(0.001),
        _ => None,
    }
}

/// Focal length over sensor width from EXIF tags.
/// Falls back to the default ratio when the sensor width cannot be derived.
pub fn focal_ratio_from_exif(
    focal_length_mm: f64,
    image_width: u32,
    focal_plane_x_resolution: f64,
    focal_plane_y_resolution: f64,
    resolution_unit: u16,
) -> f64 {
    let Some(mm) = mm_per_unit(resolution_unit) else {
        warn!("Unknown EXIF resolution unit {resolution_unit}, using default focal ratio");
        return DEFAULT_FOCAL_RATIO;
    };

    let pixels_per_unit = if focal_plane_x_resolution > 0.0 {
        focal_plane_x_resolution
    } else {
        focal_plane_y_resolution
    };
    if pixels_per_unit <= 0.0 || image_width == 0 || focal_length_mm <= 0.0 {
        return DEFAULT_FOCAL_RATIO;
    }

    let sensor_width = image_width as f64 / pixels_per_unit * mm;
    if sensor_width <= 0.0 {
        return DEFAULT_FOCAL_RATIO;
    }
    focal_length_mm / sensor_width
}

/// Seconds since the Unix epoch for an EXIF `YYYY:MM:DD HH:MM:SS` stamp, read as UTC.
pub fn capture_epoch(datetime: &str) -> f64 {
    NaiveDateTime::parse_from_str(datetime.trim(), "%Y:%m:%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp() as f64)
        .unwrap_or(0.0)
}

/// Largest photo by pixel area, as (width, height).
pub fn find_largest_photo_dims(photos: &[Photo]) -> Option<(u32, u32)> {
    photos
        .iter()
        .filter(|p| p.width > 0 && p.height > 0)
        .max_by_key(|p| p.width as u64 * p.height as u64)
        .map(|p| (p.width, p.height))
}

/// Largest single side over all photos.
pub fn find_largest_photo_dim(photos: &[Photo]) -> Option<u32> {
    photos
        .iter()
        .filter(|p| p.width > 0 && p.height > 0)
        .map(|p| p.width.max(p.height))
        .max()
}
