/// Digital surface and terrain models from the georeferenced point cloud
use super::georef::BOUNDS_PREFIX;
use super::{Stage, StageContext, StageId};
use crate::config::PipelineConfig;
use crate::constants::DEM_MAX_TILE_SIZE;
use crate::cropper::Cropper;
use crate::dem::{self, DemParams};
use crate::error::Result;
use crate::gsd::{self, CapOptions};
use log::info;
use std::fs;

/// DEM products to build, in order: `(dem_type, output_type)`.
pub fn dem_products(config: &PipelineConfig) -> Vec<(&'static str, &'static str)> {
    let mut products = Vec::new();
    if config.dsm || (config.dtm && config.dem_euclidean_map) {
        products.push(("dsm", "max"));
    }
    if config.dtm {
        products.push(("dtm", "idw"));
    }
    products
}

pub struct DemStage;

impl Stage for DemStage {
    fn id(&self) -> StageId {
        StageId::Dem
    }

    /// Every product the configuration implies, including the dsm that a
    /// dtm with an euclidean map depends on.
    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        dem_products(ctx.config)
            .iter()
            .all(|(product, _)| ctx.tree.dem_path.join(format!("{product}.tif")).exists())
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("DEM");

        let dem_input = &ctx.tree.georef_model_laz;
        let georef = ctx.georef();
        let ignore_resolution = !georef.is_valid;
        if ignore_resolution {
            info!("Not georeferenced, using ungeoreferenced point cloud");
        }

        let config = ctx.config;
        let options = CapOptions {
            ignore_gsd: config.ignore_gsd,
            ignore_resolution: ignore_resolution && config.ignore_gsd,
            has_gcp: ctx.has_gcp(),
            ..CapOptions::new(0.1, 1.0)
        };
        let resolution = gsd::cap_resolution(
            config.dem_resolution,
            &ctx.tree.opensfm_reconstruction,
            &ctx.reconstruction.photos,
            &options,
        );

        fs::create_dir_all(&ctx.tree.dem_path)?;

        let products = dem_products(config);
        if products.is_empty() || !dem_input.exists() {
            info!("DEM will not be generated");
            return Ok(());
        }
        if self.outputs_exist(ctx) && !ctx.rerun(StageId::Dem) {
            info!("Found existing outputs in: {}", ctx.tree.dem_path.display());
            return Ok(());
        }

        let radius_steps = dem::get_dem_radius_steps(
            &ctx.tree.filtered_point_cloud_stats,
            config.dem_gapfill_steps,
            resolution,
            1.0,
        );
        let bounds = Cropper::new(&ctx.tree.georef_path, BOUNDS_PREFIX).path("bounds.gpkg");

        for (product, output_type) in products {
            ctx.cancel.check()?;
            let params = DemParams {
                radius_steps: radius_steps.clone(),
                output_type: output_type.to_string(),
                gapfill: config.dem_gapfill_steps > 0,
                max_workers: config.max_concurrency,
                max_tile_size: DEM_MAX_TILE_SIZE,
                decimation: config.dem_decimation,
                keep_unfilled_copy: config.dem_euclidean_map,
                apply_smoothing: true,
                max_tiles: ctx.image_count() / 2,
                ..DemParams::new(dem_input, product, &ctx.tree.dem_path, resolution / 100.0)
            };
            let geotiff = dem::create_dem(&ctx.tools, &params, ctx.cancel)?;

            if ctx.crop > 0.0 {
                Cropper::crop(&ctx.tools, &bounds, &geotiff, true, config.max_concurrency)?;
                if config.dem_euclidean_map {
                    let unfilled = dem::related_file_path(&geotiff, "", ".unfilled");
                    Cropper::crop(&ctx.tools, &bounds, &unfilled, true, config.max_concurrency)?;
                }
            }
        }
        Ok(())
    }
}
