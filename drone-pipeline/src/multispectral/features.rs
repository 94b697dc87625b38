/// SIFT keypoints, FLANN two-nearest-neighbour matching and Lowe's ratio test
use super::homography::find_homography;
use super::image_ops::to_mat;
use crate::error::Result;
use image::GrayImage;
use log::debug;
use nalgebra::Matrix3;
use opencv::core::{DMatch, KeyPoint, Mat, Vector};
use opencv::features2d;
use opencv::prelude::*;

const CONTRAST_THRESHOLD: f64 = 0.1;
const EDGE_THRESHOLD: f64 = 10.0;
const SIFT_SIGMA: f64 = 1.6;
/// RANSAC reprojection threshold in pixels.
const REPROJECTION_THRESHOLD: f64 = 3.0;

pub struct Features {
    pub keypoints: Vector<KeyPoint>,
    pub descriptors: Mat,
}

/// SIFT keypoints and descriptors, no cap on the feature count.
pub fn detect(image: &Mat) -> Result<Features> {
    let mut sift = features2d::SIFT::create(0, 3, CONTRAST_THRESHOLD, EDGE_THRESHOLD, SIFT_SIGMA, false)?;
    let mut keypoints = Vector::new();
    let mut descriptors = Mat::default();
    sift.detect_and_compute(image, &Mat::default(), &mut keypoints, &mut descriptors, false)?;
    Ok(Features {
        keypoints,
        descriptors,
    })
}

/// Keep the nearest match of every query whose distance is below `ratio`
/// times the second nearest.
pub fn ratio_test(knn_matches: &Vector<Vector<DMatch>>, ratio: f64) -> Vec<DMatch> {
    knn_matches
        .iter()
        .filter_map(|pair| {
            if pair.len() < 2 {
                return None;
            }
            let best = pair.get(0).ok()?;
            let second = pair.get(1).ok()?;
            (f64::from(best.distance) < ratio * f64::from(second.distance)).then_some(best)
        })
        .collect()
}

/// Ratio-tested matches from `query` into `train`.
pub fn match_features(query: &Features, train: &Features, ratio: f64) -> Result<Vec<DMatch>> {
    // FLANN needs at least two train descriptors for a 2-NN search
    if query.descriptors.empty() || train.descriptors.rows() < 2 {
        return Ok(Vec::new());
    }
    let matcher = features2d::FlannBasedMatcher::create()?;
    let mut knn_matches = Vector::<Vector<DMatch>>::new();
    matcher.knn_train_match(
        &query.descriptors,
        &train.descriptors,
        &mut knn_matches,
        2,
        &Mat::default(),
        false,
    )?;
    Ok(ratio_test(&knn_matches, ratio))
}

/// Homography mapping `image` pixels onto `align_image` pixels from matched
/// SIFT features, or `None` with fewer than `min_match_count` good matches.
pub fn find_features_homography(
    image: &GrayImage,
    align_image: &GrayImage,
    feature_retention: f64,
    min_match_count: usize,
) -> Result<Option<Matrix3<f64>>> {
    let image_features = detect(&to_mat(image)?)?;
    let align_features = detect(&to_mat(align_image)?)?;

    let matches = match_features(&image_features, &align_features, feature_retention)?;
    debug!(
        "{} / {} keypoints, {} good matches",
        image_features.keypoints.len(),
        align_features.keypoints.len(),
        matches.len()
    );
    if matches.len() < min_match_count {
        return Ok(None);
    }

    let mut src = Vec::with_capacity(matches.len());
    let mut dst = Vec::with_capacity(matches.len());
    for m in &matches {
        let a = image_features.keypoints.get(m.query_idx as usize)?.pt();
        let b = align_features.keypoints.get(m.train_idx as usize)?.pt();
        src.push([f64::from(a.x), f64::from(a.y)]);
        dst.push([f64::from(b.x), f64::from(b.y)]);
    }

    find_homography(&src, &dst, REPROJECTION_THRESHOLD)
}
