//! Multi-band alignment.
//!
//! Secondary bands of a multispectral capture are registered onto a primary
//! band with one homography per band. Candidate matrices come from photo
//! pairs (feature matching first, ECC as fallback) and the most consistent
//! candidate wins.
pub mod ecc;
pub mod features;
pub mod homography;
pub mod image_ops;
pub mod pyramid;

use crate::constants::{FEATURE_RETENTION, LOW_RES_ALIGNMENT, MIN_MATCH_COUNT};
use crate::error::{PipelineError, Result};
use crate::photo::Photo;
use crate::reconstruction::Band;
use log::{info, warn};
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// How the winning homography is picked among a band's candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentScorePolicy {
    /// Lowest condition number of the normalised matrix.
    #[default]
    ConditionNumber,
    /// Lowest summed eigenvalue distance to every other candidate.
    EigenConsistency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlignmentAlgorithm {
    #[serde(rename = "feat")]
    Features,
    #[serde(rename = "ecc")]
    Ecc,
}

/// One band's chosen homography, mapping secondary pixels onto the primary photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    pub warp_matrix: [[f64; 3]; 3],
    pub algo: AlignmentAlgorithm,
    pub score: f64,
    /// Primary photo size the matrix maps into.
    pub dimension: (u32, u32),
    pub eigvals: [f64; 3],
}

impl Alignment {
    pub fn new(matrix: &Matrix3<f64>, algo: AlignmentAlgorithm, dimension: (u32, u32)) -> Self {
        let mut warp_matrix = [[0.0; 3]; 3];
        for (r, row) in warp_matrix.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = matrix[(r, c)];
            }
        }
        Self {
            warp_matrix,
            algo,
            score: 0.0,
            dimension,
            eigvals: homography::symmetric_eigenvalues(matrix),
        }
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        let m = &self.warp_matrix;
        Matrix3::new(
            m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
        )
    }
}

/// Band name to its alignment; the primary band has no entry.
pub type AlignmentInfo = BTreeMap<String, Alignment>;

pub fn save_alignment_info(path: &Path, info: &AlignmentInfo) -> Result<()> {
    crate::config::write_json_file(path, info)
}

pub fn load_alignment_info(path: &Path) -> Result<AlignmentInfo> {
    crate::config::load_json_file(path)
}

/// Secondary-to-primary and primary-to-secondaries photo lookups, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct BandMaps {
    pub s2p: BTreeMap<String, Photo>,
    pub p2s: BTreeMap<String, Vec<Photo>>,
}

/// Explicit band name (case-insensitive), or the lowest band index for "auto".
pub fn get_primary_band_name(bands: &[Band], user_band_name: &str) -> Result<String> {
    let first = bands
        .first()
        .ok_or_else(|| PipelineError::invalid("primary band", "no bands"))?;

    if user_band_name.eq_ignore_ascii_case("auto") {
        return Ok(first.name.clone());
    }

    match bands
        .iter()
        .find(|b| b.name.eq_ignore_ascii_case(user_band_name))
    {
        Some(band) => Ok(band.name.clone()),
        None => {
            warn!(
                "Cannot find band name '{}', will use '{}' instead",
                user_band_name, first.name
            );
            Ok(first.name.clone())
        }
    }
}

pub fn get_photos_by_band(bands: &[Band], user_band_name: &str) -> Result<Vec<Photo>> {
    let name = get_primary_band_name(bands, user_band_name)?;
    Ok(bands
        .iter()
        .find(|b| b.name == name)
        .map(|b| b.photos.clone())
        .unwrap_or_default())
}

/// Capture UUID matching; `None` when any UUID is missing, duplicated in the
/// primary band, or without a primary counterpart.
fn band_maps_by_uuid(bands: &[Band], primary: &str) -> Option<BandMaps> {
    let primary_photos = &bands.iter().find(|b| b.name == primary)?.photos;

    let mut by_uuid: BTreeMap<&str, &Photo> = BTreeMap::new();
    for p in primary_photos {
        let Some(uuid) = p.capture_uuid.as_deref().filter(|u| !u.is_empty()) else {
            info!("Cannot use capture UUID (no information in {})", p.file_name());
            return None;
        };
        if by_uuid.insert(uuid, p).is_some() {
            info!("Duplicate capture UUID: {uuid}");
            return None;
        }
    }

    let mut maps = BandMaps::default();
    for band in bands {
        for p in &band.photos {
            let Some(uuid) = p.capture_uuid.as_deref().filter(|u| !u.is_empty()) else {
                info!("Cannot use capture UUID (no information in {})", p.file_name());
                return None;
            };
            let Some(&primary_photo) = by_uuid.get(uuid) else {
                info!("Unreliable capture UUID detected (no primary band match)");
                return None;
            };
            maps.s2p.insert(p.file_name(), primary_photo.clone());
            if band.name != primary {
                maps.p2s
                    .entry(primary_photo.file_name())
                    .or_default()
                    .push(p.clone());
            }
        }
    }
    Some(maps)
}

/// `IMG_0001_4.tif` -> `IMG_0001.tif`; `None` without a `[-_]<band>` suffix.
pub fn filename_without_band(file_name: &str) -> Option<String> {
    let (stem, ext) = match file_name.rfind('.') {
        Some(pos) => (&file_name[..pos], &file_name[pos..]),
        None => (file_name, ""),
    };
    let cut = stem.rfind(['_', '-'])?;
    let suffix = &stem[cut + 1..];
    if cut == 0 || suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!("{}{}", &stem[..cut], ext))
}

/// File naming convention matching; photos without a counterpart stay unmapped.
fn band_maps_by_filename(bands: &[Band], primary: &str) -> BandMaps {
    let mut by_name: BTreeMap<String, &Photo> = BTreeMap::new();
    if let Some(band) = bands.iter().find(|b| b.name == primary) {
        for p in &band.photos {
            match filename_without_band(&p.file_name()) {
                Some(key) => {
                    by_name.insert(key, p);
                }
                None => warn!(
                    "Cannot match bands by filename on {}, name files [filename]_band[.ext] uniformly",
                    p.file_name()
                ),
            }
        }
    }

    let mut maps = BandMaps::default();
    let mut unmatched = 0usize;
    for band in bands {
        for p in &band.photos {
            let primary_photo = filename_without_band(&p.file_name())
                .and_then(|key| by_name.get(&key).copied());
            let Some(primary_photo) = primary_photo else {
                unmatched += 1;
                continue;
            };
            maps.s2p.insert(p.file_name(), primary_photo.clone());
            if band.name != primary {
                maps.p2s
                    .entry(primary_photo.file_name())
                    .or_default()
                    .push(p.clone());
            }
        }
    }
    if unmatched > 0 {
        warn!("{unmatched} photos could not be matched to a primary band photo");
    }
    maps
}

/// Pair every photo with its primary band counterpart, by capture UUID or,
/// failing that, by file name convention.
pub fn compute_band_maps(bands: &[Band], primary_band: &str) -> Result<BandMaps> {
    let band_name = get_primary_band_name(bands, primary_band)?;
    match band_maps_by_uuid(bands, &band_name) {
        Some(maps) => Ok(maps),
        None => {
            warn!("Capture UUIDs are unusable, will use filenames instead");
            Ok(band_maps_by_filename(bands, &band_name))
        }
    }
}

/// Homography from `image_path` onto `align_image_path`, or `None` when
/// neither features nor ECC converge.
pub fn compute_homography(image_path: &Path, align_image_path: &Path) -> Result<Option<Alignment>> {
    let image = image_ops::to_8bit(&image_ops::load_image(image_path)?, false);
    let align_image = image_ops::to_8bit(&image_ops::load_image(align_image_path)?, false);
    let dimension = align_image.dimensions();

    let max_dim = image.width().max(image.height());
    if max_dim <= LOW_RES_ALIGNMENT {
        warn!(
            "Small image for band alignment ({}x{}), this might be tough to compute",
            image.width(),
            image.height()
        );
    } else {
        match features::find_features_homography(
            &image,
            &align_image,
            FEATURE_RETENTION,
            MIN_MATCH_COUNT,
        ) {
            Ok(Some(h)) => {
                return Ok(Some(Alignment::new(&h, AlignmentAlgorithm::Features, dimension)));
            }
            Ok(None) => info!("Can't use feature matching, will use ECC (this might take a bit)"),
            Err(e) => warn!("Feature matching failed ({e}), will use ECC"),
        }
    }

    Ok(ecc::find_ecc_homography(&image, &align_image, &ecc::EccParams::default())?
        .map(|h| Alignment::new(&h, AlignmentAlgorithm::Ecc, dimension)))
}

/// Score every candidate under `policy` (lower is better) and return the
/// index of the winner; ties keep the earliest sample. Candidates with a
/// non-finite matrix or score rank last.
pub fn select_best(candidates: &mut [Alignment], policy: AlignmentScorePolicy) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let finite: Vec<bool> = candidates
        .iter()
        .map(|c| c.matrix().iter().all(|v| v.is_finite()) && c.eigvals.iter().all(|v| v.is_finite()))
        .collect();
    let eigvals: Vec<[f64; 3]> = candidates.iter().map(|c| c.eigvals).collect();
    for (i, candidate) in candidates.iter_mut().enumerate() {
        let score = if !finite[i] {
            f64::INFINITY
        } else {
            match policy {
                AlignmentScorePolicy::ConditionNumber => {
                    homography::condition_number(&candidate.matrix())
                }
                AlignmentScorePolicy::EigenConsistency => eigvals
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i && finite[j])
                    .map(|(_, other)| {
                        (0..3)
                            .map(|k| (eigvals[i][k] - other[k]).abs())
                            .sum::<f64>()
                    })
                    .sum(),
            }
        };
        candidate.score = if score.is_finite() { score } else { f64::INFINITY };
    }

    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        if candidate.score.total_cmp(&candidates[best].score).is_lt() {
            best = i;
        }
    }
    Some(best)
}

/// Best alignment per secondary band from up to `max_samples` photo pairs.
/// Bands without any successful pair are left out and logged.
pub fn compute_alignment_matrices(
    bands: &[Band],
    primary_band_name: &str,
    maps: &BandMaps,
    max_concurrency: usize,
    max_samples: usize,
    policy: AlignmentScorePolicy,
) -> Result<AlignmentInfo> {
    info!("Computing band alignment");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_concurrency.max(1))
        .build()
        .map_err(|e| PipelineError::ResourceLimit {
            detail: format!("cannot start alignment worker pool: {e}"),
        })?;

    let mut alignment_info = AlignmentInfo::new();
    let max_samples = max_samples.max(1);

    for band in bands.iter().filter(|b| b.name != primary_band_name) {
        let mut missing: BTreeSet<String> = BTreeSet::new();
        let pairs: Vec<(&Photo, &Photo)> = band
            .photos
            .iter()
            .filter_map(|p| match maps.s2p.get(&p.file_name()) {
                Some(primary) => Some((p, primary)),
                None => {
                    missing.insert(p.file_name());
                    None
                }
            })
            .collect();
        if !missing.is_empty() {
            warn!(
                "Cannot find primary band photo for {} {} photos",
                missing.len(),
                band.name
            );
        }

        // successes are counted in sample order, in parallel batches
        let mut matrices: Vec<Alignment> = Vec::new();
        let mut next = 0;
        while matrices.len() < max_samples && next < pairs.len() {
            let take = (max_samples - matrices.len()).min(pairs.len() - next);
            let batch = &pairs[next..next + take];
            next += take;

            let results: Vec<Option<Alignment>> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|(p, primary)| match compute_homography(&p.path, &primary.path) {
                        Ok(Some(alignment)) => {
                            info!("{} --> {} good match", p.file_name(), primary.file_name());
                            Some(alignment)
                        }
                        Ok(None) => {
                            info!("{} --> {} cannot be matched", p.file_name(), primary.file_name());
                            None
                        }
                        Err(e) => {
                            warn!("Failed to compute homography for '{}': {}", p.file_name(), e);
                            None
                        }
                    })
                    .collect()
            });
            matrices.extend(results.into_iter().flatten());
        }
        matrices.truncate(max_samples);

        match select_best(&mut matrices, policy) {
            Some(best) => {
                let chosen = matrices.swap_remove(best);
                info!(
                    "{} band will be aligned using warp matrix with score: {:.6}",
                    band.name, chosen.score
                );
                alignment_info.insert(band.name.clone(), chosen);
            }
            None => warn!(
                "Cannot find alignment matrix for band {}, the band might end up misaligned",
                band.name
            ),
        }
    }

    Ok(alignment_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn photo(name: &str, band: &str, index: u32, uuid: Option<&str>) -> Photo {
        Photo {
            path: PathBuf::from(format!("/images/{name}")),
            band_name: band.to_string(),
            band_index: index,
            capture_uuid: uuid.map(str::to_string),
            ..Photo::default()
        }
    }

    fn bands(with_uuid: bool) -> Vec<Band> {
        ["Green", "Red"]
            .iter()
            .enumerate()
            .map(|(index, name)| Band {
                name: name.to_string(),
                band_index: index as u32,
                photos: (0..3)
                    .map(|shot| {
                        let uuid = format!("uuid-{shot}");
                        photo(
                            &format!("IMG_{shot:04}_{}.tif", index + 1),
                            name,
                            index as u32,
                            with_uuid.then_some(uuid.as_str()),
                        )
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn primary_band_lookup() {
        let b = bands(true);
        assert_eq!(get_primary_band_name(&b, "auto").unwrap(), "Green");
        assert_eq!(get_primary_band_name(&b, "red").unwrap(), "Red");
        assert_eq!(get_primary_band_name(&b, "nir").unwrap(), "Green");
        assert!(get_primary_band_name(&[], "auto").is_err());
        assert_eq!(get_photos_by_band(&b, "Red").unwrap().len(), 3);
    }

    #[test]
    fn uuid_maps_link_every_photo() {
        let maps = compute_band_maps(&bands(true), "auto").unwrap();
        assert_eq!(maps.s2p.len(), 6);
        assert_eq!(maps.s2p["IMG_0002_2.tif"].file_name(), "IMG_0002_1.tif");
        assert_eq!(maps.p2s["IMG_0000_1.tif"].len(), 1);
    }

    #[test]
    fn missing_uuid_falls_back_to_filenames() {
        let maps = compute_band_maps(&bands(false), "auto").unwrap();
        assert_eq!(maps.s2p.len(), 6);
        assert_eq!(maps.s2p["IMG_0001_2.tif"].file_name(), "IMG_0001_1.tif");
        assert_eq!(maps.p2s.len(), 3);
    }

    #[test]
    fn band_suffix_is_stripped() {
        assert_eq!(filename_without_band("IMG_0001_4.tif").as_deref(), Some("IMG_0001.tif"));
        assert_eq!(filename_without_band("IMG_00_GRE.TIF").as_deref(), Some("IMG_00.TIF"));
        assert_eq!(filename_without_band("plain.tif"), None);
    }

    #[test]
    fn some_candidate_always_wins() {
        let mut shifted = Matrix3::identity();
        shifted[(0, 2)] = 4.0;
        let mut skewed = Matrix3::identity();
        skewed[(0, 1)] = 3.0;

        for policy in [AlignmentScorePolicy::ConditionNumber, AlignmentScorePolicy::EigenConsistency] {
            let mut candidates = vec![
                Alignment::new(&skewed, AlignmentAlgorithm::Ecc, (10, 10)),
                Alignment::new(&Matrix3::identity(), AlignmentAlgorithm::Features, (10, 10)),
                Alignment::new(&shifted, AlignmentAlgorithm::Features, (10, 10)),
            ];
            let best = select_best(&mut candidates, policy).unwrap();
            assert!(best < 3);
            assert!(candidates.iter().all(|c| c.score.is_finite()));
        }
        assert!(select_best(&mut [], AlignmentScorePolicy::default()).is_none());
    }

    #[test]
    fn non_finite_candidate_never_wins() {
        let broken = Matrix3::from_element(f64::NAN);
        let mut skewed = Matrix3::identity();
        skewed[(0, 1)] = 3.0;

        for policy in [AlignmentScorePolicy::ConditionNumber, AlignmentScorePolicy::EigenConsistency] {
            let mut candidates = vec![
                Alignment::new(&broken, AlignmentAlgorithm::Ecc, (10, 10)),
                Alignment::new(&skewed, AlignmentAlgorithm::Features, (10, 10)),
            ];
            assert_eq!(select_best(&mut candidates, policy), Some(1), "{policy:?}");
            assert_eq!(candidates[0].score, f64::INFINITY);
            assert!(candidates[1].score.is_finite());
        }
    }

    #[test]
    fn condition_number_prefers_identity() {
        let mut skewed = Matrix3::identity();
        skewed[(0, 1)] = 3.0;
        let mut candidates = vec![
            Alignment::new(&skewed, AlignmentAlgorithm::Ecc, (10, 10)),
            Alignment::new(&Matrix3::identity(), AlignmentAlgorithm::Ecc, (10, 10)),
        ];
        assert_eq!(select_best(&mut candidates, AlignmentScorePolicy::ConditionNumber), Some(1));
    }
}
