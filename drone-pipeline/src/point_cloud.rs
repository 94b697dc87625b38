/// Point cloud filtering, extent and spacing helpers
use crate::bounds::Extent;
use crate::constants::FILTER_MEAN_K;
use crate::error::{PipelineError, Result};
use crate::runner::Toolkit;
use log::{info, warn};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Statistical outlier removal, optionally with radius sampling.
pub fn filter(
    tools: &Toolkit,
    input: &Path,
    output: &Path,
    output_stats: &Path,
    stddev: f64,
    sample_radius: f64,
    max_concurrency: usize,
) -> Result<()> {
    if !input.exists() {
        return Err(PipelineError::missing("point cloud filter", input));
    }

    info!(
        "Filtering '{}' (statistical, meanK {}, standard deviation {:.1})",
        input.display(),
        FILTER_MEAN_K,
        stddev
    );

    let mut spec = tools
        .command(&tools.paths.filter)
        .arg("--input")
        .path_arg(input)
        .arg("--output")
        .path_arg(output)
        .arg("--stats")
        .path_arg(output_stats)
        .arg("--concurrency")
        .arg(max_concurrency.max(1).to_string())
        .arg("--meank")
        .arg(FILTER_MEAN_K.to_string())
        .arg("--std")
        .arg(format!("{stddev:.1}"));

    if sample_radius > 0.0 {
        info!("Sampling points around a {sample_radius:.1} m radius");
        spec = spec.arg("--radius").arg(format!("{sample_radius:.1}"));
    }

    tools.run(&spec)?;

    if !output.exists() {
        warn!("'{}' not found, filtering has failed", output.display());
    }
    Ok(())
}

/// Planar extent of a point cloud.
/// LAS/LAZ headers are read directly; other formats go through `pdal info`.
pub fn get_extent(tools: &Toolkit, input: &Path, work_dir: &Path) -> Result<Extent> {
    if !input.exists() {
        return Err(PipelineError::missing("point cloud extent", input));
    }

    let extension = input
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if extension == "las" || extension == "laz" {
        let reader = las::Reader::new(BufReader::new(File::open(input)?))?;
        return Ok(Extent::from(reader.header().bounds()));
    }

    // PLY files do not support --summary
    let summary = extension != "ply";
    let json_file = work_dir.join("pdal_info.json");

    let mut spec = tools.command(&tools.paths.pdal).arg("info");
    if summary {
        spec = spec.arg("--summary");
    }
    let spec = spec.path_arg(input).capture_stdout(&json_file);
    tools.run(&spec)?;

    let info: Value = crate::config::load_json_file(&json_file)?;
    bounds_from_info(&info, summary)
        .ok_or_else(|| PipelineError::malformed("point cloud extent", "bounds missing from pdal info"))
}

/// Extract bounds from `pdal info` output (`--summary` or full stats).
pub fn bounds_from_info(info: &Value, summary: bool) -> Option<Extent> {
    let bounds = if summary {
        info.get("summary")?.get("bounds")?
    } else {
        info.get("stats")?.get("bbox")?.get("native")?.get("bbox")?
    };

    let value = |key: &str| bounds.get(key).and_then(Value::as_f64);
    let mut extent = Extent::planar(value("minx")?, value("maxx")?, value("miny")?, value("maxy")?);
    if let (Some(min_z), Some(max_z)) = (value("minz"), value("maxz")) {
        extent.min_z = min_z;
        extent.max_z = max_z;
    }
    Some(extent)
}

/// Average point spacing from the filter statistics.
/// Falls back to half the resolution (cm to m) when unavailable.
pub fn get_spacing(stats_file: &Path, resolution_fallback: f64) -> f64 {
    let fallback = (resolution_fallback / 100.0) / 2.0;

    let stats: Value = match crate::config::load_json_file(stats_file) {
        Ok(stats) => stats,
        Err(_) => {
            warn!(
                "'{}' not readable, using fallback spacing: {:.2}",
                stats_file.display(),
                fallback
            );
            return fallback;
        }
    };

    match stats.get("spacing").and_then(Value::as_f64) {
        Some(spacing) if spacing > 0.0 => spacing,
        Some(spacing) => {
            warn!("Invalid spacing entry ({spacing:.2}), using fallback value: {fallback:.2}");
            fallback
        }
        None => {
            warn!("Missing spacing entry, using fallback value: {fallback:.2}");
            fallback
        }
    }
}

/// Write `pdal info --summary` output to `summary_file`.
pub fn export_summary_json(tools: &Toolkit, point_cloud: &Path, summary_file: &Path) -> Result<()> {
    let spec = tools
        .command(&tools.paths.pdal)
        .arg("info")
        .arg("--summary")
        .path_arg(point_cloud)
        .capture_stdout(summary_file);
    tools.run(&spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn summary_and_native_bounds_are_read() {
        let summary = json!({"summary": {"bounds": {
            "minx": 1.0, "maxx": 5.0, "miny": 2.0, "maxy": 8.0, "minz": -1.0, "maxz": 3.0
        }}});
        let extent = bounds_from_info(&summary, true).unwrap();
        assert_eq!((extent.width(), extent.height()), (4.0, 6.0));
        assert_eq!(extent.max_z, 3.0);

        let stats = json!({"stats": {"bbox": {"native": {"bbox": {
            "minx": 0.0, "maxx": 1.0, "miny": 0.0, "maxy": 2.0
        }}}}});
        assert_eq!(bounds_from_info(&stats, false).unwrap().height(), 2.0);
        assert!(bounds_from_info(&stats, true).is_none());
    }

    #[test]
    fn spacing_falls_back_to_half_resolution() {
        let dir = tempdir().unwrap();
        let stats = dir.path().join("point_cloud_stats.json");
        assert_eq!(get_spacing(&stats, 10.0), 0.05);

        fs::write(&stats, r#"{"spacing": 0.12}"#).unwrap();
        assert_eq!(get_spacing(&stats, 10.0), 0.12);

        fs::write(&stats, r#"{"spacing": -1}"#).unwrap();
        assert_eq!(get_spacing(&stats, 10.0), 0.05);

        fs::write(&stats, r#"{"points": 10}"#).unwrap();
        assert_eq!(get_spacing(&stats, 10.0), 0.05);
    }
}
