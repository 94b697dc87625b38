/// Crop boundaries from point clouds and raster cropping against them
use crate::constants::GDAL_CACHEMAX_WARP;
use crate::error::{PipelineError, Result};
use crate::geometry::{self, Point};
use crate::point_cloud::export_summary_json;
use crate::runner::Toolkit;
use log::{info, warn};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

pub struct Cropper {
    storage_dir: PathBuf,
    files_prefix: String,
}

impl Cropper {
    pub fn new(storage_dir: &Path, files_prefix: &str) -> Self {
        Self {
            storage_dir: storage_dir.to_path_buf(),
            files_prefix: files_prefix.to_string(),
        }
    }

    /// `<storage_dir>/<prefix>.<suffix>`
    pub fn path(&self, suffix: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}.{}", self.files_prefix, suffix))
    }

    /// Crop `geotiff` in place to the polygon in `gpkg`.
    /// Missing inputs skip the crop; a failed warp restores the original.
    pub fn crop(
        tools: &Toolkit,
        gpkg: &Path,
        geotiff: &Path,
        keep_original: bool,
        max_concurrency: usize,
    ) -> Result<PathBuf> {
        if !gpkg.exists() || !geotiff.exists() {
            warn!(
                "Either '{}' or '{}' does not exist, will skip cropping",
                gpkg.display(),
                geotiff.display()
            );
            return Ok(geotiff.to_path_buf());
        }

        info!("Cropping {}", geotiff.display());

        let original = original_path(geotiff);
        fs::rename(geotiff, &original)?;

        let spec = tools
            .command(&tools.paths.gdal_warp)
            .arg("-cutline")
            .path_arg(gpkg)
            .arg("-crop_to_cutline")
            .args([
                "-co",
                "TILED=YES",
                "-co",
                "COMPRESS=DEFLATE",
                "-co",
                "BLOCKXSIZE=512",
                "-co",
                "BLOCKYSIZE=512",
                "-co",
                "BIGTIFF=IF_SAFER",
                "-co",
            ])
            .arg(format!("NUM_THREADS={}", max_concurrency.max(1)))
            .path_arg(&original)
            .path_arg(geotiff)
            .args(["--config", "GDAL_CACHEMAX", GDAL_CACHEMAX_WARP]);

        match tools.run(&spec) {
            Ok(()) if geotiff.exists() => {
                if !keep_original {
                    fs::remove_file(&original)?;
                }
            }
            outcome => {
                if let Err(e) = outcome {
                    warn!("Something went wrong while cropping: {e}");
                }
                if geotiff.exists() {
                    fs::remove_file(geotiff)?;
                }
                fs::rename(&original, geotiff)?;
            }
        }

        Ok(geotiff.to_path_buf())
    }

    /// Convex hull of a decimated point cloud, optionally buffered inward,
    /// written as `<prefix>.bounds.geojson`.
    pub fn create_bounds_geojson(
        &self,
        tools: &Toolkit,
        point_cloud: &Path,
        buffer_distance: f64,
        decimation_step: u32,
    ) -> Result<PathBuf> {
        if !point_cloud.exists() {
            return Err(PipelineError::missing("crop bounds", point_cloud));
        }

        let decimated = self.path("decimated.las");
        let spec = tools
            .command(&tools.paths.pdal)
            .arg("translate")
            .arg("-i")
            .path_arg(point_cloud)
            .arg("-o")
            .path_arg(&decimated)
            .arg("decimation")
            .arg(format!(
                "--filters.decimation.step={}",
                decimation_step.max(1)
            ));
        tools.run(&spec)?;

        if !decimated.exists() {
            return Err(PipelineError::missing("decimated point cloud", &decimated));
        }

        let boundary_file = self.path("boundary.json");
        let spec = tools
            .command(&tools.paths.pdal)
            .arg("info")
            .arg("--boundary")
            .arg("--filters.hexbin.edge_size=1")
            .arg("--filters.hexbin.threshold=0")
            .path_arg(&decimated)
            .capture_stdout(&boundary_file);
        tools.run(&spec)?;

        let info: Value = crate::config::load_json_file(&boundary_file)?;
        let boundary = info
            .get("boundary")
            .and_then(|b| b.get("boundary_json"))
            .ok_or_else(|| {
                PipelineError::malformed("crop bounds", "no boundary_json in pdal info output")
            })?;

        let mut points: Vec<Point> = Vec::new();
        geometry::collect_coordinates(boundary, &mut points);
        let hull = geometry::convex_hull(&points);
        if hull.len() < 3 {
            return Err(PipelineError::malformed(
                "crop bounds",
                format!("boundary has {} distinct vertices", hull.len()),
            ));
        }

        let polygon = geometry::smooth_buffer(&hull, buffer_distance);

        let bounds_geojson = self.path("bounds.geojson");
        crate::config::write_json_file(
            &bounds_geojson,
            &geometry::polygon_feature_collection(&polygon),
        )?;

        let _ = fs::remove_file(&decimated);
        let _ = fs::remove_file(&boundary_file);

        Ok(bounds_geojson)
    }

    /// Bounds polygon converted to GeoPackage in the point cloud's SRS.
    pub fn create_bounds_gpkg(
        &self,
        tools: &Toolkit,
        point_cloud: &Path,
        buffer_distance: f64,
        decimation_step: u32,
    ) -> Result<PathBuf> {
        let bounds_geojson =
            self.create_bounds_geojson(tools, point_cloud, buffer_distance, decimation_step)?;

        let summary_file = self.path("summary.json");
        export_summary_json(tools, point_cloud, &summary_file)?;

        let summary: Value = crate::config::load_json_file(&summary_file)?;
        let proj4 = summary
            .get("summary")
            .and_then(|s| s.get("srs"))
            .and_then(|s| s.get("proj4"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                PipelineError::malformed(
                    "crop bounds",
                    format!("no proj4 SRS in '{}'", summary_file.display()),
                )
            })?;

        let bounds_gpkg = self.path("bounds.gpkg");
        if bounds_gpkg.exists() {
            fs::remove_file(&bounds_gpkg)?;
        }

        let spec = tools
            .command(&tools.paths.ogr2ogr)
            .arg("-overwrite")
            .args(["-f", "GPKG"])
            .arg("-a_srs")
            .arg(proj4)
            .path_arg(&bounds_gpkg)
            .path_arg(&bounds_geojson);
        tools.run(&spec)?;

        Ok(bounds_gpkg)
    }

    /// Union hull of several GeoJSON bounds files, buffered like a single one.
    pub fn merge_bounds(inputs: &[PathBuf], output: &Path, buffer_distance: f64) -> Result<()> {
        let mut points: Vec<Point> = Vec::new();
        for input in inputs {
            let geojson: Value = crate::config::load_json_file(input)?;
            geometry::collect_coordinates(&geojson, &mut points);
        }

        let hull = geometry::convex_hull(&points);
        if hull.len() < 3 {
            return Err(PipelineError::malformed(
                "merge bounds",
                "inputs do not enclose an area",
            ));
        }

        let polygon = geometry::smooth_buffer(&hull, buffer_distance);
        crate::config::write_json_file(output, &geometry::polygon_feature_collection(&polygon))
    }
}

/// `name.tif` -> `name.original.tif`
fn original_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.original.{}", ext.to_string_lossy()),
        None => format!("{stem}.original"),
    };
    path.with_file_name(name)
}
