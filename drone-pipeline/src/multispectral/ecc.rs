//! Enhanced Correlation Coefficient alignment.
//!
//! OpenCV's ECC solver is run coarse-to-fine over an image pyramid, each
//! level starting from the previous level's homography with a tighter
//! termination epsilon.
use super::homography::{normalize_scale, warp_from_mat, warp_to_mat};
use super::image_ops::{resize_match, scale_down, to_mat};
use super::pyramid;
use crate::error::Result;
use image::GrayImage;
use log::{debug, info, warn};
use nalgebra::Matrix3;
use opencv::core::{self, Mat, TermCriteria};
use opencv::video;

#[derive(Debug, Clone, Copy)]
pub struct EccParams {
    pub number_of_iterations: usize,
    pub termination_eps: f64,
    pub start_eps: f64,
    pub gauss_filter_size: usize,
}

impl Default for EccParams {
    fn default() -> Self {
        Self {
            number_of_iterations: 1000,
            termination_eps: 1e-8,
            start_eps: 1e-4,
            gauss_filter_size: 9,
        }
    }
}

/// Refine `warp` so that `input(warp · x) ≈ template(x)` under a homography
/// motion model. Returns the final correlation coefficient.
pub fn find_transform_ecc(
    template: &GrayImage,
    input: &GrayImage,
    warp: &mut Matrix3<f64>,
    max_iterations: usize,
    eps: f64,
    gauss_filter_size: usize,
) -> Result<f64> {
    let mut warp_matrix = warp_to_mat(warp)?;
    let criteria = TermCriteria {
        typ: core::TermCriteria_COUNT + core::TermCriteria_EPS,
        max_count: max_iterations as i32,
        epsilon: eps,
    };
    let rho = video::find_transform_ecc(
        &to_mat(template)?,
        &to_mat(input)?,
        &mut warp_matrix,
        video::MOTION_HOMOGRAPHY,
        criteria,
        &Mat::default(),
        gauss_filter_size as i32,
    )?;
    *warp = warp_from_mat(&warp_matrix)?;
    Ok(rho)
}

/// Pyramid ECC: homography mapping `image` pixels onto `align_image` pixels.
/// A failure at an intermediate level resets that level to identity; a
/// failure at the finest level gives `None`.
pub fn find_ecc_homography(
    image: &GrayImage,
    align_image: &GrayImage,
    params: &EccParams,
) -> Result<Option<Matrix3<f64>>> {
    let (full_w, full_h) = image.dimensions();
    let (align_w, align_h) = align_image.dimensions();
    if full_w == 0 || full_h == 0 || align_w == 0 || align_h == 0 {
        return Ok(None);
    }

    let sf = pyramid::working_scale(full_w, full_h);
    let work = if sf < 1.0 {
        scale_down(image, sf)
    } else {
        image.clone()
    };
    let (w, h) = work.dimensions();

    let levels = pyramid::pyramid_levels(w, h);
    info!("Pyramid levels: {levels}");

    let align_work = resize_match(align_image, (w, h));

    let image_pyr = pyramid::build_pyramid(&work, levels);
    let align_pyr = pyramid::build_pyramid(&align_work, levels);

    let mut warp = pyramid::coarsest_identity(levels);

    for level in 0..=levels {
        let eps = pyramid::level_epsilon(level, levels, params.start_eps, params.termination_eps);
        debug!("Computing ECC pyramid level {level} (eps {eps:e})");

        let result = find_transform_ecc(
            &image_pyr[level],
            &align_pyr[level],
            &mut warp,
            params.number_of_iterations,
            eps,
            params.gauss_filter_size,
        );

        if let Err(e) = result {
            if level != levels {
                warn!("Could not compute ECC warp matrix at pyramid level {level}, resetting matrix ({e})");
                warp = Matrix3::identity();
            } else {
                warn!("ECC failed at the finest level: {e}");
                return Ok(None);
            }
        }

        if level != levels {
            warp = pyramid::to_finer_level(&warp);
        }
    }

    // back from working coordinates to native pixels of both images
    let to_work = Matrix3::new(
        f64::from(w) / f64::from(full_w),
        0.0,
        0.0,
        0.0,
        f64::from(h) / f64::from(full_h),
        0.0,
        0.0,
        0.0,
        1.0,
    );
    let to_align = Matrix3::new(
        f64::from(align_w) / f64::from(w),
        0.0,
        0.0,
        0.0,
        f64::from(align_h) / f64::from(h),
        0.0,
        0.0,
        0.0,
        1.0,
    );
    Ok(normalize_scale(&(to_align * warp * to_work)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// Smooth blob pattern; ECC needs gradients everywhere.
    fn pattern(w: u32, h: u32, dx: f64, dy: f64) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let (xf, yf) = (f64::from(x) + dx, f64::from(y) + dy);
            let v = 128.0
                + 60.0 * (xf / 9.0).sin() * (yf / 11.0).cos()
                + 40.0 * ((xf + yf) / 17.0).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn recovers_small_translation() {
        // template(x) = input(x + (2, 1))
        let template = pattern(96, 80, 2.0, 1.0);
        let input = pattern(96, 80, 0.0, 0.0);
        let mut warp = Matrix3::identity();
        let rho = find_transform_ecc(&template, &input, &mut warp, 200, 1e-8, 5).unwrap();

        assert!(rho > 0.95, "rho = {rho}");
        assert!((warp[(0, 2)] - 2.0).abs() < 0.2, "tx = {}", warp[(0, 2)]);
        assert!((warp[(1, 2)] - 1.0).abs() < 0.2, "ty = {}", warp[(1, 2)]);
    }

    #[test]
    fn pyramid_homography_is_in_native_pixels() {
        let image = pattern(160, 120, 3.0, 0.0);
        let align = pattern(160, 120, 0.0, 0.0);
        let h = find_ecc_homography(&image, &align, &EccParams::default())
            .unwrap()
            .unwrap();
        assert!((h[(0, 2)] - 3.0).abs() < 0.3, "tx = {}", h[(0, 2)]);
        assert!(h[(1, 2)].abs() < 0.3, "ty = {}", h[(1, 2)]);
    }

    #[test]
    fn empty_image_has_no_alignment() {
        let empty = GrayImage::new(0, 0);
        let align = pattern(32, 32, 0.0, 0.0);
        assert!(find_ecc_homography(&empty, &align, &EccParams::default())
            .unwrap()
            .is_none());
    }
}
