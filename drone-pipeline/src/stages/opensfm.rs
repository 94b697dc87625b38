/// Structure from motion through the OpenSfM command line
use super::{Stage, StageContext, StageId};
use crate::config::write_json_file;
use crate::error::Result;
use crate::multispectral::{self, AlignmentInfo};
use crate::photo::Photo;
use crate::utm;
use log::{info, warn};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// GPS dilution of precision written for every photo.
const DEFAULT_GPS_DOP: f64 = 10.0;

pub struct OpenSfmStage;

impl Stage for OpenSfmStage {
    fn id(&self) -> StageId {
        StageId::OpenSfm
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        ctx.tree.opensfm_reconstruction.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("OpenSFM");
        fs::create_dir_all(&ctx.tree.opensfm)?;

        setup(ctx)?;

        let opensfm = ctx.tree.opensfm.clone();
        run_step(ctx, "detect_features", &[], &opensfm.join("features"), "features")?;
        run_step(ctx, "match_features", &[], &opensfm.join("matches"), "matches")?;
        run_step(ctx, "create_tracks", &[], &opensfm.join("tracks.csv"), "OpenSFM tracks file")?;
        run_step(
            ctx,
            "reconstruct",
            &[],
            &ctx.tree.opensfm_reconstruction,
            "OpenSFM reconstruction file",
        )?;

        if ctx.reconstruction.is_multi() {
            ctx.alignment = Some(band_alignment(ctx)?);
        }

        run_step(
            ctx,
            "compute_statistics",
            &["--diagram_max_points", "100000"],
            &ctx.tree.opensfm_stats,
            "reconstruction stats",
        )?;
        export_geocoords(ctx)?;
        undistort(ctx)?;
        run_step(
            ctx,
            "export_visualsfm",
            &["--points"],
            &ctx.tree.opensfm_reconstruction_nvm,
            "OpenSFM NVM reconstruction file",
        )?;
        if ctx.reconstruction.is_multi() {
            export_band_nvms(ctx)?;
        }

        if ctx.config.fast_orthophoto {
            run_step(
                ctx,
                "export_ply",
                &["--no-cameras", "--point-num-views"],
                &opensfm.join("reconstruction.ply"),
                "PLY reconstruction",
            )?;
        }
        Ok(())
    }
}

/// `opensfm <command> [args] <opensfm dir>` unless `output` already exists.
fn run_step(ctx: &StageContext, command: &str, args: &[&str], output: &Path, label: &str) -> Result<()> {
    if !ctx.needs_run(StageId::OpenSfm, output, label) {
        return Ok(());
    }
    ctx.cancel.check()?;
    info!("OpenSFM: {command}");
    let spec = ctx
        .tools
        .command(&ctx.tools.paths.opensfm)
        .arg(command)
        .args(args.iter().copied())
        .path_arg(&ctx.tree.opensfm);
    ctx.tools.run(&spec)
}

fn export_geocoords(ctx: &StageContext) -> Result<()> {
    let output = &ctx.tree.opensfm_geocoords_reconstruction;
    if !ctx.needs_run(StageId::OpenSfm, output, "geocoords file") {
        return Ok(());
    }
    let georef = ctx.georef();
    let Some(proj) = georef.proj_string() else {
        return Ok(());
    };

    info!("OpenSFM: export_geocoords");
    let spec = ctx
        .tools
        .command(&ctx.tools.paths.opensfm)
        .args(["export_geocoords", "--reconstruction", "--proj"])
        .arg(proj)
        .arg("--offset-x")
        .arg(format!("{:.1}", georef.utm_east_offset))
        .arg("--offset-y")
        .arg(format!("{:.1}", georef.utm_north_offset))
        .path_arg(&ctx.tree.opensfm);
    ctx.tools.run(&spec)
}

fn undistort(ctx: &StageContext) -> Result<()> {
    let undistorted = ctx.tree.opensfm.join("undistorted");
    let done_flag = undistorted.join("nominal_done.txt");
    if !ctx.needs_run(StageId::OpenSfm, &done_flag, "undistort flag") {
        return Ok(());
    }

    info!("OpenSFM: undistort");
    let spec = ctx
        .tools
        .command(&ctx.tools.paths.opensfm)
        .arg("undistort")
        .path_arg(&ctx.tree.opensfm);
    ctx.tools.run(&spec)?;

    fs::create_dir_all(&undistorted)?;
    fs::write(&done_flag, "")?;
    Ok(())
}

/// Previously computed alignment is reused unless the stage re-runs.
fn band_alignment(ctx: &StageContext) -> Result<AlignmentInfo> {
    let path = &ctx.tree.band_alignment;
    if !ctx.rerun(StageId::OpenSfm) && path.exists() {
        match multispectral::load_alignment_info(path) {
            Ok(info) => {
                info!("Loaded band alignment from {}", path.display());
                return Ok(info);
            }
            Err(e) => warn!("Cannot read {}, recomputing: {}", path.display(), e),
        }
    }

    let bands = ctx.reconstruction.bands();
    let primary = multispectral::get_primary_band_name(&bands, &ctx.config.primary_band)?;
    let maps = multispectral::compute_band_maps(&bands, &primary)?;
    let info = multispectral::compute_alignment_matrices(
        &bands,
        &primary,
        &maps,
        ctx.config.max_concurrency,
        ctx.config.max_alignment_samples,
        ctx.config.alignment_score,
    )?;
    multispectral::save_alignment_info(path, &info)?;
    Ok(info)
}

/// NVM file for a secondary band:
/// `undistorted/reconstruction.nvm` -> `undistorted/reconstruction_<band>.nvm`.
pub fn band_nvm_path(nvm: &Path, band_name: &str) -> PathBuf {
    crate::dem::related_file_path(nvm, "", &format!("_{}", band_name.to_lowercase()))
}

/// Copy the primary band NVM once per secondary band with every image
/// replaced by its matched photo from that band.
fn export_band_nvms(ctx: &StageContext) -> Result<()> {
    let nvm = &ctx.tree.opensfm_reconstruction_nvm;
    let bands = ctx.reconstruction.bands();
    let primary = multispectral::get_primary_band_name(&bands, &ctx.config.primary_band)?;
    let maps = multispectral::compute_band_maps(&bands, &primary)?;
    let text = fs::read_to_string(nvm)?;

    for band in bands.iter().filter(|b| b.name != primary) {
        let output = band_nvm_path(nvm, &band.name);
        if !ctx.needs_run(StageId::OpenSfm, &output, "band NVM file") {
            continue;
        }
        let replacements: BTreeMap<String, String> = maps
            .p2s
            .iter()
            .filter_map(|(primary_name, secondaries)| {
                secondaries
                    .iter()
                    .find(|p| p.band_name == band.name)
                    .map(|p| (primary_name.clone(), p.file_name()))
            })
            .collect();
        fs::write(&output, replace_nvm_images(&text, &replacements))?;
        info!("Wrote {}", output.display());
    }
    Ok(())
}

/// Swap image file names at the start of NVM camera lines, keeping directories.
pub fn replace_nvm_images(text: &str, replacements: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let (token, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let token_path = Path::new(token);
        let replaced = token_path
            .file_name()
            .and_then(|name| replacements.get(name.to_string_lossy().as_ref()))
            .map(|new_name| token_path.with_file_name(new_name));

        match replaced {
            Some(path) if rest.is_empty() => out.push_str(&path.to_string_lossy()),
            Some(path) => {
                out.push_str(&path.to_string_lossy());
                out.push(' ');
                out.push_str(rest);
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

fn setup(ctx: &StageContext) -> Result<()> {
    let photos = &ctx.reconstruction.photos;
    let opensfm = &ctx.tree.opensfm;

    write_exif(photos, &opensfm.join("exif"))?;

    let mut list = String::new();
    for photo in photos {
        list.push_str(&photo.path.to_string_lossy());
        list.push('\n');
    }
    fs::write(opensfm.join("image_list.txt"), list)?;

    if let Some(first) = photos.first() {
        let models = camera_models(first);
        write_json_file(&opensfm.join("camera_models.json"), &models)?;
        write_json_file(&ctx.tree.cameras_json, &models)?;
    }

    let georef = ctx.georef();
    if georef.is_valid {
        let (latitude, longitude) = utm::from_utm(
            georef.utm_east_offset,
            georef.utm_north_offset,
            georef.utm_zone,
            georef.utm_hemisphere,
        );
        write_json_file(
            &opensfm.join("reference_lla.json"),
            &json!({ "latitude": latitude, "longitude": longitude, "altitude": 0.0 }),
        )?;
    }

    fs::write(
        opensfm.join("config.yaml"),
        format!(
            "undistorted_image_max_size: {}\nprocesses: {}\n",
            ctx.config.undistorted_image_max_size, ctx.config.max_concurrency
        ),
    )?;
    Ok(())
}

fn write_exif(photos: &[Photo], exif_dir: &Path) -> Result<()> {
    fs::create_dir_all(exif_dir)?;
    for photo in photos {
        let mut exif = json!({
            "make": photo.camera_make,
            "model": photo.camera_model,
            "width": photo.width,
            "height": photo.height,
            "projection_type": "brown",
            "focal_ratio": photo.focal_ratio,
            "orientation": 1,
            "capture_time": photo.capture_epoch,
            "camera": photo.camera_string(true),
        });
        if let Some(gps) = photo.gps {
            exif["gps"] = json!({
                "latitude": gps.latitude,
                "longitude": gps.longitude,
                "altitude": gps.altitude,
                "dop": DEFAULT_GPS_DOP,
            });
        }
        write_json_file(&exif_dir.join(format!("{}.exif", photo.file_name())), &exif)?;
    }
    Ok(())
}

/// Brown model with the EXIF focal ratio and no distortion.
fn camera_models(photo: &Photo) -> Value {
    let mut models = Map::new();
    models.insert(
        photo.camera_string(true),
        json!({
            "projection_type": "brown",
            "width": photo.width,
            "height": photo.height,
            "focal_x": photo.focal_ratio,
            "focal_y": photo.focal_ratio,
            "c_x": 0.0,
            "c_y": 0.0,
            "k1": 0.0,
            "k2": 0.0,
            "p1": 0.0,
            "p2": 0.0,
            "k3": 0.0,
        }),
    );
    Value::Object(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::GpsPosition;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn camera_model_is_keyed_by_camera_string() {
        let photo = Photo {
            camera_make: "DJI".into(),
            camera_model: "FC6310".into(),
            width: 5472,
            height: 3648,
            focal_ratio: 0.6666,
            ..Photo::default()
        };
        let models = camera_models(&photo);
        let model = &models["v2 dji fc6310 5472 3648 brown 0.6666"];
        assert_eq!(model["width"], 5472);
        assert_eq!(model["focal_x"], 0.6666);
    }

    #[test]
    fn nvm_images_are_swapped_per_band() {
        let nvm = "NVM_V3\n\n2\n/u/images/IMG_0001_1.tif 1200 1 0 0 0 0 0 0 0\n/u/images/IMG_0002_1.tif 1200 1 0 0 0 0 0 0 0\n";
        let replacements = BTreeMap::from([("IMG_0001_1.tif".to_string(), "IMG_0001_3.tif".to_string())]);
        let out = replace_nvm_images(nvm, &replacements);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[3], "/u/images/IMG_0001_3.tif 1200 1 0 0 0 0 0 0 0");
        assert_eq!(lines[4], "/u/images/IMG_0002_1.tif 1200 1 0 0 0 0 0 0 0");
        assert_eq!(lines[0], "NVM_V3");
    }

    #[test]
    fn band_nvm_is_next_to_primary() {
        let path = band_nvm_path(Path::new("/p/undistorted/reconstruction.nvm"), "NIR");
        assert_eq!(path, PathBuf::from("/p/undistorted/reconstruction_nir.nvm"));
    }

    #[test]
    fn exif_files_carry_gps_dop() {
        let dir = tempdir().unwrap();
        let photo = Photo {
            path: PathBuf::from("/images/DJI_0001.JPG"),
            gps: Some(GpsPosition {
                latitude: 46.5,
                longitude: 7.4,
                altitude: 900.0,
            }),
            ..Photo::default()
        };
        write_exif(&[photo], dir.path()).unwrap();

        let exif: Value =
            crate::config::load_json_file(&dir.path().join("DJI_0001.JPG.exif")).unwrap();
        assert_eq!(exif["gps"]["dop"], DEFAULT_GPS_DOP);
        assert!(exif["camera"].as_str().unwrap().starts_with("v2 "));
    }
}
