/// Band grouping of the photo collection and reconstruction-level queries
use crate::config::{PcQuality, ProjectTree};
use crate::constants::{
    DEFAULT_DEPTHMAP_RESOLUTION, MAX_BANDS, MIN_BANDS, MIN_DEPTHMAP_RESOLUTION,
};
use crate::gcp::GcpFile;
use crate::georef::Georef;
use crate::photo::{Photo, find_largest_photo_dims};
use log::{info, warn};
use std::collections::BTreeMap;

/// Photos sharing one spectral band.
#[derive(Debug, Clone, PartialEq)]
pub struct Band {
    pub name: String,
    pub band_index: u32,
    pub photos: Vec<Photo>,
}

/// Photo collection grouped into bands, plus an optional GCP file.
#[derive(Debug, Clone, Default)]
pub struct Reconstruction {
    pub photos: Vec<Photo>,
    /// Set only for valid multi-camera captures.
    pub multi_camera: Option<Vec<Band>>,
    pub gcp: Option<GcpFile>,
}

impl Reconstruction {
    pub fn new(photos: Vec<Photo>) -> Self {
        let multi_camera = detect_multi_camera(&photos);
        Self {
            photos,
            multi_camera,
            gcp: None,
        }
    }

    pub fn with_gcp(mut self, gcp: GcpFile) -> Self {
        self.gcp = Some(gcp);
        self
    }

    pub fn is_multi(&self) -> bool {
        self.multi_camera.is_some()
    }

    /// Bands for the capture; single-band sets report one band holding every photo.
    pub fn bands(&self) -> Vec<Band> {
        match &self.multi_camera {
            Some(bands) => bands.clone(),
            None => {
                let first = self.photos.first();
                vec![Band {
                    name: first
                        .map(|p| p.band_name.clone())
                        .unwrap_or_else(|| crate::constants::DEFAULT_BAND_NAME.to_string()),
                    band_index: first.map(|p| p.band_index).unwrap_or(0),
                    photos: self.photos.clone(),
                }]
            }
        }
    }

    /// Georeferenced when the coordinate file parses.
    pub fn is_georef(&self, tree: &ProjectTree) -> bool {
        Georef::read(&tree.georef_coords).is_valid
    }

    pub fn has_gcp(&self, tree: &ProjectTree) -> bool {
        self.is_georef(tree) && (self.gcp.is_some() || tree.georef_gcp.exists())
    }
}

/// Group photos by band name.
/// A multi-camera set needs 2..=8 bands with equal photo counts; anything else
/// is treated as single-band. Bands are ordered by band index, then name.
pub fn detect_multi_camera(photos: &[Photo]) -> Option<Vec<Band>> {
    let mut by_name: BTreeMap<&str, Band> = BTreeMap::new();
    for photo in photos {
        by_name
            .entry(photo.band_name.as_str())
            .or_insert_with(|| Band {
                name: photo.band_name.clone(),
                band_index: photo.band_index,
                photos: Vec::new(),
            })
            .photos
            .push(photo.clone());
    }

    if !(MIN_BANDS..=MAX_BANDS).contains(&by_name.len()) {
        return None;
    }

    let mut bands: Vec<Band> = by_name.into_values().collect();
    let count = bands[0].photos.len();
    if bands.iter().any(|b| b.photos.len() != count) {
        warn!("Multi-camera setup detected but band photo counts differ; treating as single band");
        return None;
    }

    bands.sort_by(|a, b| a.band_index.cmp(&b.band_index).then_with(|| a.name.cmp(&b.name)));
    info!(
        "Multi-camera setup detected: {}",
        bands.iter().map(|b| b.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    Some(bands)
}

/// Depth map resolution for the dense matcher.
pub fn depthmap_resolution(photos: &[Photo], quality: PcQuality) -> u32 {
    let Some((w, h)) = find_largest_photo_dims(photos) else {
        return DEFAULT_DEPTHMAP_RESOLUTION;
    };

    let megapixels = (w as f64 * h as f64) / 1e6;
    let multiplier = if megapixels < 6.0 {
        2.0
    } else if megapixels > 42.0 {
        0.5
    } else {
        1.0
    };

    let max_dim = w.max(h) as f64;
    let resolution = (max_dim * quality.scale() * multiplier) as u32;
    resolution.max(MIN_DEPTHMAP_RESOLUTION)
}
