/// Tiled DEM generation, mosaicking and gap filling
use crate::bounds::Extent;
use crate::cancel::CancelToken;
use crate::constants::{
    DEM_FILL_MAX_DISTANCE, DEM_GAPFILL_OUTSIZE, DEM_MAX_TILE_SIZE, DEM_RES_FLOOR, GDAL_CACHEMAX,
};
use crate::error::{PipelineError, Result};
use crate::point_cloud;
use crate::runner::Toolkit;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

/// Inputs to [`create_dem`].
#[derive(Debug, Clone)]
pub struct DemParams {
    pub input_point_cloud: PathBuf,
    /// Product name, also the output file stem (`dsm`, `dtm`, `mesh_dsm`).
    pub dem_type: String,
    pub radius_steps: Vec<f64>,
    /// Rasteriser statistic (`max`, `idw`, ...).
    pub output_type: String,
    pub gapfill: bool,
    pub outdir: PathBuf,
    /// Metres per pixel.
    pub resolution: f64,
    pub max_workers: usize,
    pub max_tile_size: usize,
    pub decimation: u32,
    pub keep_unfilled_copy: bool,
    pub apply_smoothing: bool,
    /// Tile count above which the memory safety check applies (0 disables it).
    pub max_tiles: usize,
}

impl DemParams {
    pub fn new(input_point_cloud: &Path, dem_type: &str, outdir: &Path, resolution: f64) -> Self {
        Self {
            input_point_cloud: input_point_cloud.to_path_buf(),
            dem_type: dem_type.to_string(),
            radius_steps: vec![0.56],
            output_type: "max".to_string(),
            gapfill: true,
            outdir: outdir.to_path_buf(),
            resolution,
            max_workers: 1,
            max_tile_size: DEM_MAX_TILE_SIZE,
            decimation: 1,
            keep_unfilled_copy: false,
            apply_smoothing: false,
            max_tiles: 0,
        }
    }
}

/// One rasterisation job: a radius pass over one cell of the tile grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DemTile {
    pub filename: PathBuf,
    pub radius: f64,
    pub minx: f64,
    pub maxx: f64,
    pub miny: f64,
    pub maxy: f64,
}

impl DemTile {
    /// Bounds in the rasteriser's `([minx,maxx],[miny,maxy])` form.
    pub fn bounds_string(&self) -> String {
        format!(
            "([{:.15},{:.15}],[{:.15},{:.15}])",
            self.minx, self.maxx, self.miny, self.maxy
        )
    }

    fn pipeline_file(&self) -> PathBuf {
        self.filename.with_extension("pipeline.json")
    }
}

/// Raster size, effective resolution and tile jobs for one DEM.
#[derive(Debug, Clone)]
pub struct TilePlan {
    pub width: usize,
    pub height: usize,
    /// Resolution after the floor was applied.
    pub resolution: f64,
    pub radius_steps: Vec<f64>,
    pub num_splits: usize,
    /// Ordered by radius pass, then column, then row.
    pub tiles: Vec<DemTile>,
}

impl TilePlan {
    pub fn total_pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn tiles_for_radius(&self, radius: f64) -> impl Iterator<Item = &DemTile> {
        self.tiles.iter().filter(move |t| t.radius == radius)
    }
}

/// Tile file name encoding product, radius and grid position.
pub fn tile_file_name(dem_type: &str, radius: f64, x: usize, y: usize) -> String {
    format!("{dem_type}_r{radius:.17}_x{x}_y{y}.tif")
}

/// Grid split count bounding per-tile pixels by `max_tile_size²`.
pub fn num_splits(total_pixels: u64, max_tile_size: usize) -> usize {
    let budget = (max_tile_size as f64) * (max_tile_size as f64);
    let chunks = (total_pixels as f64 / budget).ceil();
    chunks.log2().ceil().max(1.0) as usize
}

/// Plan raster dimensions and tile jobs.
/// Rasters smaller than the floor on both axes are rescaled so the longer side
/// is exactly the floor; radius steps scale with the resolution.
pub fn plan_dem(
    extent: &Extent,
    resolution: f64,
    radius_steps: &[f64],
    max_tile_size: usize,
    dem_type: &str,
    outdir: &Path,
) -> Result<TilePlan> {
    let ext_width = extent.width();
    let ext_height = extent.height();
    if extent.is_empty() {
        return Err(PipelineError::malformed(
            "DEM",
            format!("degenerate point cloud extent {ext_width}x{ext_height}"),
        ));
    }
    if resolution <= 0.0 || max_tile_size == 0 {
        return Err(PipelineError::invalid(
            "DEM",
            format!("resolution {resolution} and tile size {max_tile_size} must be positive"),
        ));
    }

    let mut resolution = resolution;
    // one pass per distinct radius; tile names and pass filtering key on it
    let mut distinct: Vec<f64> = Vec::with_capacity(radius_steps.len());
    for &r in radius_steps {
        if !distinct.contains(&r) {
            distinct.push(r);
        }
    }
    if distinct.len() < radius_steps.len() {
        warn!(
            "Ignoring {} repeated radius steps",
            radius_steps.len() - distinct.len()
        );
    }
    let mut radius_steps = distinct;
    let mut w = (ext_width / resolution).ceil() as usize;
    let mut h = (ext_height / resolution).ceil() as usize;

    if w < DEM_RES_FLOOR && h < DEM_RES_FLOOR {
        let (prev_w, prev_h) = (w, h);
        let floor_ratio = if w >= h {
            w = DEM_RES_FLOOR;
            h = (ext_height / ext_width * DEM_RES_FLOOR as f64).ceil() as usize;
            prev_w as f64 / w as f64
        } else {
            w = (ext_width / ext_height * DEM_RES_FLOOR as f64).ceil() as usize;
            h = DEM_RES_FLOOR;
            prev_h as f64 / h as f64
        };
        resolution *= floor_ratio;
        for r in radius_steps.iter_mut() {
            *r *= floor_ratio;
        }
        warn!(
            "Really low resolution DEM requested ({prev_w}x{prev_h}), setting floor at {DEM_RES_FLOOR} pixels"
        );
        warn!("Resolution changed to {resolution:.4}. The scale of this reconstruction might be off");
    }

    let splits = num_splits(w as u64 * h as u64, max_tile_size);
    let tile_width = ext_width / splits as f64;
    let tile_height = ext_height / splits as f64;

    let mut tiles = Vec::with_capacity(radius_steps.len() * splits * splits);
    for &radius in &radius_steps {
        let mut minx = extent.min_x;
        for x in 0..splits {
            let maxx = if x == splits - 1 {
                extent.max_x
            } else {
                minx + tile_width
            };
            let mut miny = extent.min_y;
            for y in 0..splits {
                let maxy = if y == splits - 1 {
                    extent.max_y
                } else {
                    miny + tile_height
                };
                tiles.push(DemTile {
                    filename: outdir.join(tile_file_name(dem_type, radius, x, y)),
                    radius,
                    minx,
                    maxx,
                    miny,
                    maxy,
                });
                miny = maxy;
            }
            minx = maxx;
        }
    }

    Ok(TilePlan {
        width: w,
        height: h,
        resolution,
        radius_steps,
        num_splits: splits,
        tiles,
    })
}

/// Rasteriser pipeline for one tile.
pub fn tile_pipeline(
    input_point_cloud: &Path,
    tile: &DemTile,
    resolution: f64,
    output_type: &str,
    decimation: u32,
) -> serde_json::Value {
    let mut stages = vec![json!(input_point_cloud.to_string_lossy())];
    if decimation > 1 {
        stages.push(json!({
            "type": "filters.decimation",
            "step": decimation,
        }));
    }
    stages.push(json!({
        "type": "writers.gdal",
        "resolution": resolution,
        "radius": tile.radius,
        "filename": tile.filename.to_string_lossy(),
        "output_type": output_type,
        "data_type": "float",
        "bounds": tile.bounds_string(),
    }));
    serde_json::Value::Array(stages)
}

/// Total physical memory in bytes, when the platform exposes it.
pub fn total_memory() -> Option<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Refuse plans that would very likely exhaust memory.
pub fn check_memory(plan: &TilePlan, max_tiles: usize, total_memory: Option<u64>) -> Result<()> {
    if max_tiles == 0 || plan.tiles.len() <= max_tiles {
        return Ok(());
    }
    let Some(total) = total_memory else {
        warn!("Cannot determine total memory, skipping DEM safety check");
        return Ok(());
    };
    let needed = plan.total_pixels() * 4;
    if needed > total {
        return Err(PipelineError::ResourceLimit {
            detail: format!(
                "max tiles limit exceeded ({max_tiles}); {} tiles needing {needed} bytes. \
                 This is a strong indicator that the reconstruction failed",
                plan.tiles.len()
            ),
        });
    }
    Ok(())
}

/// `<dir>/<prefix><stem><postfix><ext>` next to `path`.
pub fn related_file_path(path: &Path, prefix: &str, postfix: &str) -> PathBuf {
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    dir.join(format!("{prefix}{stem}{postfix}{ext}"))
}

/// Radius steps starting at spacing × multiplier, growing by √2.
pub fn get_dem_radius_steps(
    stats_file: &Path,
    steps: usize,
    resolution: f64,
    multiplier: f64,
) -> Vec<f64> {
    let spacing = point_cloud::get_spacing(stats_file, resolution);
    let mut radius_steps = Vec::with_capacity(steps.max(1));
    radius_steps.push(spacing * multiplier);
    for i in 1..steps {
        radius_steps.push(radius_steps[i - 1] * std::f64::consts::SQRT_2);
    }
    radius_steps
}

fn num_threads_option(max_workers: usize) -> String {
    if max_workers > 0 {
        format!("NUM_THREADS={max_workers}")
    } else {
        "NUM_THREADS=ALL_CPUS".to_string()
    }
}

fn run_tile(
    tools: &Toolkit,
    params: &DemParams,
    plan: &TilePlan,
    tile: &DemTile,
    cancel: &CancelToken,
) -> Result<()> {
    cancel.check()?;
    debug!(
        "Generating {} ({}, radius: {}, resolution: {})",
        tile.filename.display(),
        params.output_type,
        tile.radius,
        plan.resolution
    );

    let pipeline = tile_pipeline(
        &params.input_point_cloud,
        tile,
        plan.resolution,
        &params.output_type,
        params.decimation,
    );
    let pipe_file = tile.pipeline_file();
    fs::write(&pipe_file, serde_json::to_string_pretty(&pipeline)?)?;

    let spec = tools
        .command(&tools.paths.pdal)
        .arg("pipeline")
        .arg("-i")
        .path_arg(&pipe_file);
    let result = tools.run(&spec);
    let _ = fs::remove_file(&pipe_file);
    result
}

/// Build a DEM from a point cloud: plan tiles, rasterise every radius pass,
/// mosaic, optionally gap fill, and move the result to `<outdir>/<dem_type>.tif`.
pub fn create_dem(tools: &Toolkit, params: &DemParams, cancel: &CancelToken) -> Result<PathBuf> {
    fs::create_dir_all(&params.outdir)?;

    let extent = point_cloud::get_extent(tools, &params.input_point_cloud, &params.outdir)?;
    info!(
        "Point cloud bounds are [minx: {:.3}, maxx: {:.3}] [miny: {:.3}, maxy: {:.3}]",
        extent.min_x, extent.max_x, extent.min_y, extent.max_y
    );

    let plan = plan_dem(
        &extent,
        params.resolution,
        &params.radius_steps,
        params.max_tile_size,
        &params.dem_type,
        &params.outdir,
    )?;
    info!(
        "DEM resolution is {}x{}, max tile size is {}, will split DEM generation into {} tiles",
        plan.width,
        plan.height,
        params.max_tile_size,
        plan.num_splits * plan.num_splits
    );

    check_memory(&plan, params.max_tiles, total_memory())?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.max_workers.max(1))
        .build()
        .map_err(|e| PipelineError::ResourceLimit {
            detail: format!("cannot start DEM worker pool: {e}"),
        })?;

    let pb = ProgressBar::new(plan.tiles.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:40.cyan/blue}] {pos}/{len} tiles ({percent}%) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("▉▊▋▌▍▎▏ "),
    );
    pb.set_message(format!("Rasterising {}", params.dem_type));

    // Radius passes stay sequential; tiles inside a pass are independent.
    for &radius in &plan.radius_steps {
        let pass: Vec<&DemTile> = plan.tiles_for_radius(radius).collect();
        pool.install(|| {
            pass.par_iter().try_for_each(|tile| {
                let result = run_tile(tools, params, &plan, tile, cancel);
                pb.inc(1);
                result
            })
        })?;
    }
    pb.finish_with_message(format!("{} tiles done", params.dem_type));

    for tile in &plan.tiles {
        if !tile.filename.exists() {
            return Err(PipelineError::missing("DEM tile", &tile.filename));
        }
    }

    cancel.check()?;
    let output_path = mosaic_tiles(tools, params, &plan)?;

    for tile in &plan.tiles {
        let _ = fs::remove_file(&tile.filename);
    }
    Ok(output_path)
}

/// Mosaic tile rasters into `<dem_type>.tif`, gap filling when requested.
fn mosaic_tiles(tools: &Toolkit, params: &DemParams, plan: &TilePlan) -> Result<PathBuf> {
    let outdir = &params.outdir;
    let tiles_vrt = outdir.join("tiles.vrt");
    let tiles_list = outdir.join("tiles_list.txt");
    let merged_vrt = outdir.join("merged.vrt");
    let geotiff_tmp = outdir.join("tiles.tmp.tif");
    let geotiff_small = outdir.join("tiles.small.tif");
    let geotiff_small_filled = outdir.join("tiles.small_filled.tif");
    let geotiff = outdir.join("tiles.tif");
    let output_path = outdir.join(format!("{}.tif", params.dem_type));

    // Later entries win where rasters overlap, so the finest radius goes last.
    let mut ordered: Vec<&DemTile> = plan.tiles.iter().collect();
    ordered.sort_by(|a, b| b.radius.total_cmp(&a.radius));
    let list: String = ordered
        .iter()
        .map(|t| format!("{}\n", t.filename.display()))
        .collect();
    fs::write(&tiles_list, list)?;

    tools.run(
        &tools
            .command(&tools.paths.gdal_buildvrt)
            .arg("-input_file_list")
            .path_arg(&tiles_list)
            .path_arg(&tiles_vrt),
    )?;

    let threads = num_threads_option(params.max_workers);
    let translate = || {
        tools
            .command(&tools.paths.gdal_translate)
            .arg("-co")
            .arg(threads.clone())
    };

    if params.gapfill {
        // fillnodata misbehaves when reading straight from a VRT
        tools.run(
            &translate()
                .args(["-co", "BIGTIFF=IF_SAFER", "--config", "GDAL_CACHEMAX", GDAL_CACHEMAX])
                .path_arg(&tiles_vrt)
                .path_arg(&geotiff_tmp),
        )?;

        tools.run(
            &translate()
                .args(["-co", "BIGTIFF=IF_SAFER", "--config", "GDAL_CACHEMAX", GDAL_CACHEMAX])
                .args(["-outsize", DEM_GAPFILL_OUTSIZE, "0"])
                .path_arg(&geotiff_tmp)
                .path_arg(&geotiff_small),
        )?;

        tools.run(
            &tools
                .command(&tools.paths.gdal_fillnodata)
                .arg("-md")
                .arg(format!("{DEM_FILL_MAX_DISTANCE}"))
                .args(["-b", "1", "-of", "GTiff"])
                .path_arg(&geotiff_small)
                .path_arg(&geotiff_small_filled),
        )?;

        // Full resolution wins where it has data, the filled copy covers holes.
        tools.run(
            &tools
                .command(&tools.paths.gdal_buildvrt)
                .args(["-resolution", "highest", "-r", "bilinear"])
                .path_arg(&merged_vrt)
                .path_arg(&geotiff_small_filled)
                .path_arg(&geotiff_tmp),
        )?;

        tools.run(
            &translate()
                .args(["-co", "TILED=YES", "-co", "BIGTIFF=IF_SAFER", "-co", "COMPRESS=DEFLATE"])
                .args(["--config", "GDAL_CACHEMAX", GDAL_CACHEMAX])
                .path_arg(&merged_vrt)
                .path_arg(&geotiff),
        )?;
    } else {
        tools.run(
            &translate()
                .args(["-co", "TILED=YES", "-co", "BIGTIFF=IF_SAFER", "-co", "COMPRESS=DEFLATE"])
                .args(["--config", "GDAL_CACHEMAX", GDAL_CACHEMAX])
                .path_arg(&tiles_vrt)
                .path_arg(&geotiff),
        )?;
    }

    if params.apply_smoothing {
        debug!("Median smoothing is left to downstream tools");
    }
    replace_file(&geotiff, &output_path)?;

    if geotiff_tmp.exists() {
        if params.keep_unfilled_copy {
            replace_file(&geotiff_tmp, &related_file_path(&output_path, "", ".unfilled"))?;
        } else {
            let _ = fs::remove_file(&geotiff_tmp);
        }
    }

    for path in [
        &tiles_vrt,
        &tiles_list,
        &merged_vrt,
        &geotiff_small,
        &geotiff_small_filled,
    ] {
        let _ = fs::remove_file(path);
    }

    info!("Created {}", output_path.display());
    Ok(output_path)
}

/// Move `from` over `to`, replacing any existing file.
pub fn replace_file(from: &Path, to: &Path) -> Result<()> {
    if !from.exists() {
        return Err(PipelineError::missing("replace", from));
    }
    if to.exists() {
        fs::remove_file(to)?;
    }
    fs::rename(from, to)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn plan(extent: Extent, resolution: f64, radii: &[f64], tile: usize) -> TilePlan {
        plan_dem(&extent, resolution, radii, tile, "dsm", Path::new("/tmp/dem")).unwrap()
    }

    #[test]
    fn tiny_raster_is_floored_to_64_pixels() {
        // 10 m x 5 m at 0.5 m/px would be 20x10
        let extent = Extent::planar(0.0, 10.0, 0.0, 5.0);
        let p = plan(extent, 0.5, &[1.0, 2.0], 4096);
        assert_eq!(p.width.max(p.height), 64);
        assert_eq!((p.width, p.height), (64, 32));

        let ratio = p.resolution / 0.5;
        assert_abs_diff_eq!(p.radius_steps[0], 1.0 * ratio, epsilon = 1e-12);
        assert_abs_diff_eq!(p.radius_steps[1], 2.0 * ratio, epsilon = 1e-12);
        assert!((extent.width() / p.resolution).ceil() as usize <= 64);
    }

    #[test]
    fn tall_tiny_raster_floors_height() {
        let extent = Extent::planar(0.0, 3.0, 0.0, 12.0);
        let p = plan(extent, 1.0, &[0.5], 4096);
        assert_eq!((p.width, p.height), (16, 64));
        assert_abs_diff_eq!(p.resolution, 12.0 / 64.0, epsilon = 1e-12);
    }

    #[test]
    fn large_raster_is_not_floored() {
        let extent = Extent::planar(0.0, 100.0, 0.0, 10.0);
        let p = plan(extent, 0.5, &[1.0], 4096);
        assert_eq!((p.width, p.height), (200, 20));
        assert_eq!(p.resolution, 0.5);
    }

    #[test]
    fn split_count_follows_pixel_budget() {
        assert_eq!(num_splits(100, 4096), 1);
        assert_eq!(num_splits(4096 * 4096 * 2, 4096), 1);
        assert_eq!(num_splits(4096 * 4096 * 3, 4096), 2);
        assert_eq!(num_splits(4096 * 4096 * 16, 4096), 4);
        assert_eq!(num_splits(4096 * 4096 * 17, 4096), 5);
    }

    #[test]
    fn repeated_radius_steps_run_once() {
        let extent = Extent::planar(0.0, 100.0, 0.0, 50.0);
        let p = plan(extent, 0.5, &[0.5, 0.75, 0.5, 0.75], 64);
        assert_eq!(p.radius_steps, vec![0.5, 0.75]);
        assert_eq!(p.tiles.len(), 2 * p.num_splits * p.num_splits);

        let mut names: Vec<_> = p.tiles.iter().map(|t| t.filename.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), p.tiles.len());
        assert_eq!(p.tiles_for_radius(0.5).count(), p.num_splits * p.num_splits);
    }

    #[test]
    fn tiles_partition_extent_exactly() {
        let extent = Extent::planar(301.7, 1023.3, -52.1, 977.9);
        let radii = [0.3, 0.42];
        let p = plan(extent, 0.01, &radii, 256);
        let per_radius = p.num_splits * p.num_splits;
        assert!(p.num_splits > 1);
        assert_eq!(p.tiles.len(), per_radius * radii.len());

        for &r in &p.radius_steps {
            let tiles: Vec<&DemTile> = p.tiles_for_radius(r).collect();
            assert_eq!(tiles.len(), per_radius);

            let covered: f64 = tiles
                .iter()
                .map(|t| (t.maxx - t.minx) * (t.maxy - t.miny))
                .sum();
            assert_abs_diff_eq!(covered, extent.area(), epsilon = 1e-6);

            // outer edges hit the extent exactly
            assert!(tiles.iter().any(|t| t.maxx == extent.max_x));
            assert!(tiles.iter().any(|t| t.maxy == extent.max_y));
            assert!(tiles.iter().all(|t| t.minx >= extent.min_x && t.maxx <= extent.max_x));

            // neighbours share edges without gaps
            for t in &tiles {
                if t.maxx < extent.max_x {
                    assert!(tiles.iter().any(|o| o.minx == t.maxx && o.miny == t.miny));
                }
                if t.maxy < extent.max_y {
                    assert!(tiles.iter().any(|o| o.miny == t.maxy && o.minx == t.minx));
                }
            }
        }
    }

    #[test]
    fn degenerate_extent_is_rejected() {
        let extent = Extent::planar(0.0, 0.0, 0.0, 10.0);
        assert!(plan_dem(&extent, 0.1, &[1.0], 4096, "dsm", Path::new("/tmp")).is_err());
    }

    #[test]
    fn tile_names_and_pipeline_shape() {
        assert_eq!(
            tile_file_name("dtm", 0.5, 1, 2),
            "dtm_r0.50000000000000000_x1_y2.tif"
        );

        let tile = DemTile {
            filename: PathBuf::from("/out/dsm_r1_x0_y0.tif"),
            radius: 1.0,
            minx: 0.0,
            maxx: 1.0,
            miny: 2.0,
            maxy: 3.0,
        };
        let pipeline = tile_pipeline(Path::new("/in/cloud.ply"), &tile, 0.05, "max", 4);
        let stages = pipeline.as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0], "/in/cloud.ply");
        assert_eq!(stages[1]["type"], "filters.decimation");
        assert_eq!(stages[2]["data_type"], "float");
        assert_eq!(
            stages[2]["bounds"],
            "([0.000000000000000,1.000000000000000],[2.000000000000000,3.000000000000000])"
        );

        let undecimated = tile_pipeline(Path::new("/in/cloud.ply"), &tile, 0.05, "max", 1);
        assert_eq!(undecimated.as_array().unwrap().len(), 2);
    }

    #[test]
    fn radius_steps_grow_by_sqrt2() {
        let steps = get_dem_radius_steps(Path::new("/missing/stats.json"), 3, 10.0, 2.0);
        assert_eq!(steps.len(), 3);
        assert_abs_diff_eq!(steps[0], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(steps[2], 0.2, epsilon = 1e-12);
    }

    #[test]
    fn memory_check_only_trips_with_many_tiles() {
        let extent = Extent::planar(0.0, 1000.0, 0.0, 1000.0);
        let p = plan(extent, 0.01, &[1.0], 4096);
        assert!(check_memory(&p, 0, Some(1)).is_ok());
        assert!(check_memory(&p, p.tiles.len(), Some(1)).is_ok());
        assert!(matches!(
            check_memory(&p, 1, Some(1)),
            Err(PipelineError::ResourceLimit { .. })
        ));
        assert!(check_memory(&p, 1, Some(u64::MAX)).is_ok());
        assert!(check_memory(&p, 1, None).is_ok());
    }

    #[test]
    fn related_path_inserts_postfix() {
        assert_eq!(
            related_file_path(Path::new("/o/dsm.tif"), "", ".unfilled"),
            PathBuf::from("/o/dsm.unfilled.tif")
        );
        assert_eq!(
            related_file_path(Path::new("/o/dsm.tif"), "pre_", ""),
            PathBuf::from("/o/pre_dsm.tif")
        );
    }
}
