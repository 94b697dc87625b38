/// Dataset loading: coordinate file, image lists and the reconstruction model
use super::{Stage, StageContext, StageId};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::gcp::GcpFile;
use crate::georef::Georef;
use crate::photo::Photo;
use crate::reconstruction::Reconstruction;
use crate::utm::{self, Hemisphere};
use log::{info, warn};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

/// GCP entries must reference at least this many available images.
const MIN_GCP_IMAGES: usize = 3;

pub struct DatasetStage;

impl Stage for DatasetStage {
    fn id(&self) -> StageId {
        StageId::Dataset
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        ctx.tree.images_json.exists() && ctx.tree.georef_coords.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Load dataset");

        let photos = &ctx.reconstruction.photos;
        fs::create_dir_all(&ctx.tree.georef_path)?;

        write_coordinates(photos, &ctx.tree.georef_coords, &ctx.tree.georef_proj)?;
        write_image_list(photos, &ctx.tree.img_list)?;
        write_image_json(photos, &ctx.tree.images_json)?;

        if let Some(gcp) = &ctx.reconstruction.gcp {
            if let Some(images_dir) = photos.first().and_then(|p| p.path.parent()) {
                gcp.make_filtered_copy(&ctx.tree.georef_gcp, images_dir, MIN_GCP_IMAGES)?;
            }
        }
        Ok(())
    }
}

/// Group the photos into bands and attach the configured GCP file.
/// A GCP file that cannot be read is logged and left out.
pub fn load_reconstruction(config: &PipelineConfig, photos: &[Photo]) -> Result<Reconstruction> {
    if photos.is_empty() {
        return Err(PipelineError::missing("dataset", "photo list"));
    }

    let mut reconstruction = Reconstruction::new(photos.to_vec());
    if let Some(path) = &config.gcp_file {
        match GcpFile::read(path) {
            Ok(gcp) => {
                info!("Using {} GCP entries from {}", gcp.entries_count(), path.display());
                gcp.check_entries();
                reconstruction = reconstruction.with_gcp(gcp);
            }
            Err(e) => warn!("Cannot load GCP file, continuing without it: {e}"),
        }
    }
    Ok(reconstruction)
}

/// Coordinate file from photo GPS: zone and hemisphere from the first tagged
/// photo, integer offsets at the floor of the mean position.
pub fn write_coordinates(photos: &[Photo], coords_file: &Path, proj_file: &Path) -> Result<Georef> {
    let Some(first) = photos.iter().find_map(|p| p.gps) else {
        warn!("No images seem to have GPS information");
        return Err(PipelineError::missing("GPS position", coords_file));
    };
    let zone = utm::utm_zone(first.longitude);
    let hemisphere = Hemisphere::from_latitude(first.latitude);

    let mut coords = Vec::with_capacity(photos.len());
    for photo in photos {
        match photo.gps {
            Some(gps) => {
                let (x, y) = utm::to_utm(gps.latitude, gps.longitude, zone, hemisphere);
                coords.push((x, y, gps.altitude));
            }
            None => warn!("GPS position not available for {}", photo.file_name()),
        }
    }

    let n = coords.len() as f64;
    let dx = (coords.iter().map(|c| c.0).sum::<f64>() / n).floor();
    let dy = (coords.iter().map(|c| c.1).sum::<f64>() / n).floor();
    let local: Vec<(f64, f64, f64)> = coords.iter().map(|&(x, y, z)| (x - dx, y - dy, z)).collect();

    Georef::write_coords(coords_file, zone, hemisphere, dx, dy, &local)?;
    fs::write(proj_file, utm::proj_string(zone, hemisphere))?;
    info!("Wrote {} ({}{})", coords_file.display(), zone, hemisphere.as_char());

    Ok(Georef {
        utm_zone: zone,
        utm_hemisphere: hemisphere,
        utm_east_offset: dx,
        utm_north_offset: dy,
        is_valid: true,
    })
}

fn write_image_list(photos: &[Photo], path: &Path) -> Result<()> {
    let mut text = String::new();
    for photo in photos {
        text.push_str(&photo.file_name());
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

fn image_record(photo: &Photo) -> Value {
    let (latitude, longitude, altitude) = match photo.gps {
        Some(gps) => (json!(gps.latitude), json!(gps.longitude), json!(gps.altitude)),
        None => (Value::Null, Value::Null, Value::Null),
    };
    json!({
        "filename": photo.file_name(),
        "mask": null,
        "width": photo.width,
        "height": photo.height,
        "camera_make": photo.camera_make,
        "camera_model": photo.camera_model,
        "orientation": 1,
        "latitude": latitude,
        "longitude": longitude,
        "altitude": altitude,
        "band_name": photo.band_name,
        "band_index": photo.band_index,
        "capture_uuid": photo.capture_uuid,
        "utc_time": photo.capture_epoch * 1000.0,
        "exif_width": photo.exif_width,
        "exif_height": photo.exif_height,
        "camera_projection": "brown",
        "focal_ratio": photo.focal_ratio,
    })
}

fn write_image_json(photos: &[Photo], path: &Path) -> Result<()> {
    let records: Vec<Value> = photos.iter().map(image_record).collect();
    crate::config::write_json_file(path, &records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::GpsPosition;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn photo(name: &str, lat: f64, lon: f64) -> Photo {
        Photo {
            path: PathBuf::from(format!("/data/images/{name}")),
            width: 4000,
            height: 3000,
            gps: Some(GpsPosition {
                latitude: lat,
                longitude: lon,
                altitude: 120.0,
            }),
            ..Photo::default()
        }
    }

    #[test]
    fn coordinate_file_is_readable() {
        let dir = tempdir().unwrap();
        let coords = dir.path().join("coords.txt");
        let proj = dir.path().join("proj.txt");
        let photos = vec![
            photo("a.jpg", 46.55, 9.01),
            photo("b.jpg", 46.551, 9.012),
            Photo {
                gps: None,
                ..photo("c.jpg", 0.0, 0.0)
            },
        ];

        let written = write_coordinates(&photos, &coords, &proj).unwrap();
        let read = Georef::read(&coords);
        assert_eq!(read, written);
        assert_eq!(read.utm_zone, 32);
        assert_eq!(read.utm_hemisphere, Hemisphere::North);
        assert_eq!(read.utm_east_offset, read.utm_east_offset.floor());

        // header, offsets and one line per tagged photo
        let text = fs::read_to_string(&coords).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert!(fs::read_to_string(&proj).unwrap().contains("+zone=32"));
    }

    #[test]
    fn southern_photos_get_south_hemisphere() {
        let dir = tempdir().unwrap();
        let georef = write_coordinates(
            &[photo("a.jpg", -33.9, 18.4)],
            &dir.path().join("coords.txt"),
            &dir.path().join("proj.txt"),
        )
        .unwrap();
        assert_eq!(georef.utm_zone, 34);
        assert_eq!(georef.utm_hemisphere, Hemisphere::South);
    }

    #[test]
    fn no_gps_is_missing_input() {
        let dir = tempdir().unwrap();
        let photos = vec![Photo {
            gps: None,
            ..photo("a.jpg", 0.0, 0.0)
        }];
        let result = write_coordinates(
            &photos,
            &dir.path().join("coords.txt"),
            &dir.path().join("proj.txt"),
        );
        assert!(matches!(result, Err(PipelineError::MissingInput { .. })));
    }

    #[test]
    fn image_json_lists_every_photo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("images.json");
        write_image_json(&[photo("a.jpg", 1.0, 2.0), photo("b.jpg", 1.0, 2.0)], &path).unwrap();

        let records: Vec<Value> = crate::config::load_json_file(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["filename"], "b.jpg");
        assert_eq!(records[0]["band_name"], "RGB");
    }

    #[test]
    fn empty_photo_list_is_rejected() {
        let result = load_reconstruction(&PipelineConfig::default(), &[]);
        assert!(matches!(result, Err(PipelineError::MissingInput { .. })));
    }
}
