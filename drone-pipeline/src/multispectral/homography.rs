/// Homography fitting, OpenCV matrix conversion and matrix diagnostics
use crate::error::Result;
use nalgebra::{Matrix3, Vector3};
use opencv::calib3d;
use opencv::core::{self, Mat, Point2f, Vector};
use opencv::prelude::*;

/// Divide by `H[2,2]`; `None` when it vanishes or the matrix is not finite.
pub fn normalize_scale(h: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let scale = h[(2, 2)];
    if !scale.is_finite() || scale.abs() <= f64::EPSILON {
        return None;
    }
    let out = h / scale;
    out.iter().all(|v| v.is_finite()).then_some(out)
}

/// Map a point through `h`; `None` at infinity.
pub fn transfer(h: &Matrix3<f64>, p: [f64; 2]) -> Option<[f64; 2]> {
    let v = h * Vector3::new(p[0], p[1], 1.0);
    if v[2].abs() <= 1e-12 {
        return None;
    }
    Some([v[0] / v[2], v[1] / v[2]])
}

/// 3x3 `CV_32F` warp, the layout `find_transform_ecc` refines in place.
pub fn warp_to_mat(h: &Matrix3<f64>) -> Result<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(3, 3, core::CV_32F, core::Scalar::all(0.0))?;
    for r in 0..3 {
        for c in 0..3 {
            *mat.at_2d_mut::<f32>(r as i32, c as i32)? = h[(r, c)] as f32;
        }
    }
    Ok(mat)
}

/// Read a 3x3 matrix of any float depth.
pub fn warp_from_mat(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut wide = Mat::default();
    mat.convert_to(&mut wide, core::CV_64F, 1.0, 0.0)?;
    let mut h = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h[(r, c)] = *wide.at_2d::<f64>(r as i32, c as i32)?;
        }
    }
    Ok(h)
}

fn to_points(points: &[[f64; 2]]) -> Vector<Point2f> {
    Vector::from_iter(
        points
            .iter()
            .map(|p| Point2f::new(p[0] as f32, p[1] as f32)),
    )
}

/// RANSAC homography with `dst ~ H * src` (reprojection threshold in px).
/// `None` when fewer than four pairs are given or OpenCV finds no model.
pub fn find_homography(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    threshold: f64,
) -> Result<Option<Matrix3<f64>>> {
    if src.len() < 4 || src.len() != dst.len() {
        return Ok(None);
    }
    let h = calib3d::find_homography(
        &to_points(src),
        &to_points(dst),
        &mut Mat::default(),
        calib3d::RANSAC,
        threshold,
    )?;
    if h.empty() || h.rows() != 3 || h.cols() != 3 {
        return Ok(None);
    }
    Ok(normalize_scale(&warp_from_mat(&h)?))
}

/// 2-norm condition number of the scale-normalised matrix.
pub fn condition_number(h: &Matrix3<f64>) -> f64 {
    let Some(h) = normalize_scale(h) else {
        return f64::INFINITY;
    };
    let sv = h.singular_values();
    let max = sv.max();
    let min = sv.min();
    if min <= f64::EPSILON { f64::INFINITY } else { max / min }
}

/// Ascending eigenvalues of the symmetric part `(H + Hᵀ) / 2`.
/// Degenerate matrices report infinite eigenvalues.
pub fn symmetric_eigenvalues(h: &Matrix3<f64>) -> [f64; 3] {
    let Some(h) = normalize_scale(h) else {
        return [f64::INFINITY; 3];
    };
    let sym = (h + h.transpose()) * 0.5;
    let mut eig: Vec<f64> = sym.symmetric_eigenvalues().iter().copied().collect();
    eig.sort_by(f64::total_cmp);
    [eig[0], eig[1], eig[2]]
}
