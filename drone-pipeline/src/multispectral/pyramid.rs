/// Coarse-to-fine image pyramids for ECC alignment
use super::image_ops::{normalize, scale_down};
use crate::constants::{ECC_MAX_SIZE, ECC_MIN_PYRAMID_SIDE};
use image::GrayImage;
use nalgebra::Matrix3;

/// Halvings needed before the short side drops to the pyramid floor.
pub fn pyramid_levels(width: u32, height: u32) -> usize {
    let mut min_dim = width.min(height);
    let mut levels = 0;
    while min_dim > ECC_MIN_PYRAMID_SIDE {
        min_dim /= 2;
        levels += 1;
    }
    levels
}

/// Scale factor bringing the long side down to the ECC working size.
pub fn working_scale(width: u32, height: u32) -> f64 {
    let max_dim = width.max(height);
    if max_dim > ECC_MAX_SIZE {
        f64::from(ECC_MAX_SIZE) / f64::from(max_dim)
    } else {
        1.0
    }
}

/// Pyramid from coarsest to finest; `levels + 1` entries.
/// Each level is normalised before being halved.
pub fn build_pyramid(image: &GrayImage, levels: usize) -> Vec<GrayImage> {
    let mut pyramid = vec![image.clone()];
    for _ in 0..levels {
        pyramid[0] = normalize(&pyramid[0]);
        let half = scale_down(&pyramid[0], 0.5);
        pyramid.insert(0, half);
    }
    pyramid
}

/// Elementwise factors carrying a homography one level finer (2x).
pub fn level_step() -> Matrix3<f64> {
    Matrix3::new(1.0, 1.0, 2.0, 1.0, 1.0, 2.0, 0.5, 0.5, 1.0)
}

/// Move a homography from one pyramid level to the next finer one.
pub fn to_finer_level(warp: &Matrix3<f64>) -> Matrix3<f64> {
    warp.component_mul(&level_step())
}

/// Identity expressed at the coarsest of `levels + 1` levels.
pub fn coarsest_identity(levels: usize) -> Matrix3<f64> {
    let exponent = -(levels as i32);
    Matrix3::identity().component_mul(&level_step().map(|v| v.powi(exponent)))
}

/// ECC termination epsilon for `level` (0 = coarsest), loosest first.
pub fn level_epsilon(level: usize, levels: usize, start_eps: f64, termination_eps: f64) -> f64 {
    if levels == 0 {
        termination_eps
    } else {
        start_eps - ((start_eps - termination_eps) / levels as f64) * level as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn levels_stop_at_floor() {
        assert_eq!(pyramid_levels(1280, 960), 2);
        assert_eq!(pyramid_levels(640, 480), 1);
        assert_eq!(pyramid_levels(300, 200), 0);
    }

    #[test]
    fn pyramid_halves_each_level() {
        let img = GrayImage::new(1280, 960);
        let pyr = build_pyramid(&img, 2);
        let dims: Vec<_> = pyr.iter().map(|i| i.dimensions()).collect();
        assert_eq!(dims, vec![(320, 240), (640, 480), (1280, 960)]);
    }

    #[test]
    fn epsilon_tightens_toward_finest() {
        assert_relative_eq!(level_epsilon(0, 2, 1e-4, 1e-8), 1e-4);
        assert_relative_eq!(level_epsilon(2, 2, 1e-4, 1e-8), 1e-8, epsilon = 1e-15);
        assert_relative_eq!(level_epsilon(0, 0, 1e-4, 1e-8), 1e-8);
    }

    #[test]
    fn translation_doubles_per_level() {
        let mut warp = Matrix3::identity();
        warp[(0, 2)] = 3.0;
        warp[(2, 0)] = 0.01;
        let finer = to_finer_level(&warp);
        assert_eq!(finer[(0, 2)], 6.0);
        assert_eq!(finer[(2, 0)], 0.005);
        assert_eq!(finer[(0, 0)], 1.0);
        assert_eq!(coarsest_identity(3), Matrix3::identity());
        assert_relative_eq!(working_scale(2560, 1920), 0.5);
    }
}
