/// Processing report written as JSON
use super::georef::BOUNDS_PREFIX;
use super::{Stage, StageContext, StageId};
use crate::config::{load_json_file, write_json_file};
use crate::cropper::Cropper;
use crate::error::Result;
use crate::geometry::{self, Point};
use crate::gsd;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize)]
pub struct ReportParameters {
    pub dem_resolution: f64,
    pub dem_gapfill_steps: usize,
    pub dem_decimation: u32,
    pub ortho_resolution: f64,
    pub crop: f64,
    pub fast_orthophoto: bool,
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub date_processed: String,
    pub date_collected: Option<String>,
    pub images: usize,
    pub bands: Vec<String>,
    pub georeferenced: bool,
    /// cm/pixel
    pub average_gsd: Option<f64>,
    /// Square metres inside the crop bounds.
    pub area: Option<f64>,
    /// Seconds per stage, keyed by stage name.
    pub stage_durations: BTreeMap<String, f64>,
    pub parameters: ReportParameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_statistics: Option<Value>,
}

/// `<stage name>: <seconds>` lines; anything else is ignored.
pub fn parse_benchmark(text: &str) -> BTreeMap<String, f64> {
    text.lines()
        .filter_map(|line| {
            let (name, secs) = line.rsplit_once(':')?;
            Some((name.trim().to_string(), secs.trim().parse().ok()?))
        })
        .collect()
}

/// Area of the first polygon in a bounds GeoJSON.
pub fn bounds_area(geojson: &Path) -> Option<f64> {
    let value: Value = load_json_file(geojson)
        .map_err(|e| warn!("Cannot read bounds '{}': {}", geojson.display(), e))
        .ok()?;
    let mut ring: Vec<Point> = Vec::new();
    geometry::collect_coordinates(&value, &mut ring);
    (ring.len() >= 3).then(|| geometry::polygon_area(&ring))
}

fn format_epoch(epoch: f64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(epoch as i64, 0).map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub struct ReportStage;

impl ReportStage {
    pub fn build(ctx: &StageContext) -> Report {
        let tree = ctx.tree;
        let photos = &ctx.reconstruction.photos;

        let stage_durations = fs::read_to_string(&tree.benchmark_log)
            .map(|text| parse_benchmark(&text))
            .unwrap_or_default();

        let bounds = Cropper::new(&tree.georef_path, BOUNDS_PREFIX).path("bounds.geojson");
        let area = if bounds.exists() { bounds_area(&bounds) } else { None };

        let last_capture = photos
            .iter()
            .map(|p| p.capture_epoch)
            .filter(|&e| e > 0.0)
            .fold(None, |acc: Option<f64>, e| Some(acc.map_or(e, |a| a.max(e))));

        let processing_statistics = tree
            .opensfm_stats
            .exists()
            .then(|| load_json_file::<Value>(&tree.opensfm_stats).ok())
            .flatten()
            .and_then(|stats| stats.get("processing_statistics").cloned());

        Report {
            date_processed: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            date_collected: last_capture.and_then(format_epoch),
            images: photos.len(),
            bands: ctx.reconstruction.bands().into_iter().map(|b| b.name).collect(),
            georeferenced: ctx.is_georef(),
            average_gsd: gsd::opensfm_reconstruction_average_gsd(
                &tree.opensfm_reconstruction,
                photos,
                ctx.has_gcp(),
            ),
            area,
            stage_durations,
            parameters: ReportParameters {
                dem_resolution: ctx.config.dem_resolution,
                dem_gapfill_steps: ctx.config.dem_gapfill_steps,
                dem_decimation: ctx.config.dem_decimation,
                ortho_resolution: ctx.config.ortho_resolution,
                crop: ctx.crop,
                fast_orthophoto: ctx.config.fast_orthophoto,
            },
            processing_statistics,
        }
    }
}

impl Stage for ReportStage {
    fn id(&self) -> StageId {
        StageId::Report
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        ctx.tree.report_json.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Report");
        fs::create_dir_all(&ctx.tree.report_path)?;

        let report = Self::build(ctx);
        write_json_file(&ctx.tree.report_json, &report)?;
        info!("Wrote {}", ctx.tree.report_json.display());
        Ok(())
    }
}
