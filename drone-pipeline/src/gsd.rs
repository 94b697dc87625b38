/// Ground sampling distance estimation and resolution capping
use crate::photo::Photo;
use crate::sfm::SfmReconstruction;
use log::{info, warn};
use std::path::Path;

/// Caller switches for [`cap_resolution`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapOptions {
    /// Fraction of estimated GSD error used to lower the bound.
    pub gsd_error_estimate: f64,
    pub gsd_scaling: f64,
    /// Return the requested resolution unchanged.
    pub ignore_gsd: bool,
    /// Return the GSD-derived value even when the request is coarser.
    pub ignore_resolution: bool,
    pub has_gcp: bool,
}

impl CapOptions {
    pub fn new(gsd_error_estimate: f64, gsd_scaling: f64) -> Self {
        Self {
            gsd_error_estimate,
            gsd_scaling,
            ignore_gsd: false,
            ignore_resolution: false,
            has_gcp: false,
        }
    }
}

/// Median of `values`; the two middle values are averaged for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// GSD in cm/pixel for a focal ratio (focal length / sensor width).
pub fn calculate_gsd_from_focal_ratio(
    focal_ratio: f64,
    flight_height: f64,
    image_width: u32,
) -> Option<f64> {
    if focal_ratio == 0.0 || image_width == 0 {
        return None;
    }
    Some(((flight_height * 100.0) / image_width as f64) / focal_ratio)
}

/// GSD in cm/pixel from sensor width and focal length, both in millimetres.
pub fn calculate_gsd(
    sensor_width: f64,
    flight_height: f64,
    focal_length: f64,
    image_width: u32,
) -> Option<f64> {
    if sensor_width == 0.0 {
        return None;
    }
    calculate_gsd_from_focal_ratio(focal_length / sensor_width, flight_height, image_width)
}

/// Mean GSD over the shots of a sparse reconstruction.
/// Shots count when they carry a GPS dilution estimate, or always with `use_all_shots`.
pub fn reconstruction_average_gsd(
    reconstruction: &SfmReconstruction,
    photos: &[Photo],
    use_all_shots: bool,
) -> Option<f64> {
    let ground_height = median(&reconstruction.point_heights())?;

    // One-camera assumption: the first photo describes every shot.
    let camera = photos.first()?;

    let gsds: Vec<f64> = reconstruction
        .shots
        .values()
        .filter(|shot| use_all_shots || shot.gps_dop.is_some())
        .filter_map(|shot| {
            let height = shot.origin()[2] - ground_height;
            calculate_gsd_from_focal_ratio(camera.focal_ratio, height, camera.width)
        })
        .collect();

    let gsd = mean(&gsds)?;
    if gsd < 0.0 {
        warn!("Negative GSD estimated, this might indicate a flipped Z-axis");
    }
    Some(gsd.abs())
}

/// [`reconstruction_average_gsd`] for a `reconstruction.json` on disk.
pub fn opensfm_reconstruction_average_gsd(
    reconstruction_json: &Path,
    photos: &[Photo],
    use_all_shots: bool,
) -> Option<f64> {
    match SfmReconstruction::load(reconstruction_json) {
        Ok(reconstruction) => reconstruction_average_gsd(&reconstruction, photos, use_all_shots),
        Err(e) => {
            warn!("Cannot read reconstruction for GSD: {e}");
            None
        }
    }
}

/// Cap a requested resolution against a known GSD.
pub fn cap_resolution_with_gsd(resolution: f64, gsd: Option<f64>, options: &CapOptions) -> f64 {
    if options.ignore_gsd {
        return resolution;
    }
    let Some(gsd) = gsd else {
        info!("Cannot calculate GSD, using requested resolution of {resolution:.2}");
        return resolution;
    };

    let capped = gsd * (1.0 - options.gsd_error_estimate) * options.gsd_scaling;
    if capped > resolution || options.ignore_resolution {
        info!(
            "Maximum resolution set to {:.2} * (GSD - {:.2}%) ({:.2} cm/pixel, requested resolution was {:.2} cm/pixel)",
            options.gsd_scaling,
            options.gsd_error_estimate * 100.0,
            capped,
            resolution
        );
        capped
    } else {
        resolution
    }
}

/// Never return a resolution finer than the reconstruction's optics allow.
pub fn cap_resolution(
    resolution: f64,
    reconstruction_json: &Path,
    photos: &[Photo],
    options: &CapOptions,
) -> f64 {
    if options.ignore_gsd {
        return resolution;
    }
    let gsd = opensfm_reconstruction_average_gsd(
        reconstruction_json,
        photos,
        options.has_gcp && options.ignore_resolution,
    );
    cap_resolution_with_gsd(resolution, gsd, options)
}

/// Power-of-one-half down-scale factor for a known GSD.
pub fn scale_factor_for_gsd(gsd: f64, target_resolution: f64, gsd_error_estimate: f64) -> f64 {
    if gsd <= 0.0 || target_resolution <= 0.0 {
        return 1.0;
    }
    let gsd = gsd * (1.0 + gsd_error_estimate);
    let isf = (gsd.abs() / target_resolution).min(1.0);

    let mut factor = 0.5;
    while factor >= isf {
        factor /= 2.0;
    }
    factor * 2.0
}

/// Down-scale factor for images so the reconstruction reaches `target_resolution`.
/// Returns 1 when no GSD is available.
pub fn image_scale_factor(
    target_resolution: f64,
    reconstruction_json: &Path,
    photos: &[Photo],
    gsd_error_estimate: f64,
    has_gcp: bool,
) -> f64 {
    match opensfm_reconstruction_average_gsd(reconstruction_json, photos, has_gcp) {
        Some(gsd) => scale_factor_for_gsd(gsd, target_resolution, gsd_error_estimate),
        None => 1.0,
    }
}

/// Largest image side after applying [`image_scale_factor`].
pub fn image_max_size(
    photos: &[Photo],
    target_resolution: f64,
    reconstruction_json: &Path,
    gsd_error_estimate: f64,
    ignore_gsd: bool,
    has_gcp: bool,
) -> u32 {
    let isf = if ignore_gsd {
        1.0
    } else {
        image_scale_factor(
            target_resolution,
            reconstruction_json,
            photos,
            gsd_error_estimate,
            has_gcp,
        )
    };

    let max_side = photos
        .iter()
        .map(|p| p.width.max(p.height))
        .max()
        .unwrap_or(0);
    (max_side as f64 * isf).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sfm::{SfmPoint, SfmShot};
    use approx::assert_abs_diff_eq;
    use std::collections::BTreeMap;

    fn camera() -> Photo {
        Photo {
            width: 4000,
            height: 3000,
            focal_ratio: 0.5,
            ..Photo::default()
        }
    }

    /// Nadir shots at the given heights above a flat ground at z = 0.
    fn flat_reconstruction(heights: &[f64], with_dop: bool) -> SfmReconstruction {
        let points: BTreeMap<String, SfmPoint> = (0..5)
            .map(|i| (i.to_string(), SfmPoint { coordinates: [i as f64, 0.0, 0.0] }))
            .collect();
        // rotation of pi about x flips the camera to look down
        let shots = heights
            .iter()
            .enumerate()
            .map(|(i, h)| {
                (
                    format!("{i}.jpg"),
                    SfmShot {
                        rotation: [std::f64::consts::PI, 0.0, 0.0],
                        translation: [0.0, 0.0, *h],
                        gps_dop: with_dop.then_some(10.0),
                        camera: None,
                    },
                )
            })
            .collect();
        SfmReconstruction { points, shots }
    }

    #[test]
    fn median_averages_middle_pair() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn reference_gsd_value() {
        let gsd = calculate_gsd(13.2, 100.0, 8.8, 5472).unwrap();
        assert_abs_diff_eq!(gsd, 2.74, epsilon = 0.005);
        assert!(calculate_gsd(13.2, 100.0, 0.0, 2000).is_none());
        assert!(calculate_gsd(13.2, 100.0, 8.8, 0).is_none());
        assert!(calculate_gsd(0.0, 100.0, 8.8, 2000).is_none());
    }

    #[test]
    fn average_gsd_uses_shot_heights_over_median_ground() {
        let rec = flat_reconstruction(&[100.0, 120.0], true);
        let gsd = reconstruction_average_gsd(&rec, &[camera()], false).unwrap();
        // (100 * 100 / 4000) / 0.5 = 5 and (120 * 100 / 4000) / 0.5 = 6
        assert_abs_diff_eq!(gsd, 5.5, epsilon = 1e-9);
    }

    #[test]
    fn shots_without_dop_need_use_all_shots() {
        let rec = flat_reconstruction(&[100.0], false);
        assert!(reconstruction_average_gsd(&rec, &[camera()], false).is_none());
        assert!(reconstruction_average_gsd(&rec, &[camera()], true).is_some());
    }

    #[test]
    fn cap_is_monotonic_below_threshold_then_identity() {
        let options = CapOptions::new(0.1, 1.0);
        let gsd = Some(5.0);
        let threshold = 5.0 * 0.9;

        let mut previous = 0.0;
        for step in 1..100 {
            let requested = step as f64 * 0.1;
            let capped = cap_resolution_with_gsd(requested, gsd, &options);
            assert!(capped >= previous);
            if requested > threshold {
                assert_eq!(capped, requested);
            } else {
                assert_abs_diff_eq!(capped, threshold, epsilon = 1e-12);
            }
            previous = capped;
        }
    }

    #[test]
    fn cap_honours_overrides() {
        let mut options = CapOptions::new(0.1, 1.0);
        assert_eq!(cap_resolution_with_gsd(2.0, None, &options), 2.0);

        options.ignore_resolution = true;
        assert_abs_diff_eq!(cap_resolution_with_gsd(9.0, Some(5.0), &options), 4.5);

        options.ignore_gsd = true;
        assert_eq!(cap_resolution_with_gsd(9.0, Some(5.0), &options), 9.0);
    }

    #[test]
    fn scale_factor_is_power_of_half() {
        for target in [0.5, 1.0, 2.0, 3.3, 7.0, 20.0, 80.0] {
            let factor = scale_factor_for_gsd(2.0, target, 0.5);
            assert!(factor <= 1.0);
            let exponent = -factor.log2();
            assert_abs_diff_eq!(exponent, exponent.round(), epsilon = 1e-12);
        }
        // a target finer than the native gsd keeps full size
        assert_eq!(scale_factor_for_gsd(4.0, 2.0, 0.5), 1.0);
        assert_eq!(scale_factor_for_gsd(2.0, 20.0, 0.5), 0.25);
        assert_eq!(scale_factor_for_gsd(2.0, 24.0, 0.5), 0.125);
        assert_eq!(scale_factor_for_gsd(-1.0, 2.0, 0.5), 1.0);
    }

    #[test]
    fn max_size_without_reconstruction_is_largest_side() {
        let photos = vec![camera()];
        let size = image_max_size(&photos, 5.0, Path::new("/missing.json"), 0.5, false, false);
        assert_eq!(size, 4000);
    }
}
