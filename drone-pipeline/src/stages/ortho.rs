/// Orthophoto rendering from the textured model
use super::georef::BOUNDS_PREFIX;
use super::texture::texture_targets;
use super::{Stage, StageContext, StageId};
use crate::constants::GDAL_CACHEMAX;
use crate::cropper::Cropper;
use crate::error::{PipelineError, Result};
use crate::gsd::{self, CapOptions};
use crate::runner::ExternalToolSpec;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Pixels per metre for a resolution in cm/pixel.
pub fn pixels_per_meter(resolution_cm: f64) -> f64 {
    1.0 / (resolution_cm / 100.0)
}

/// Band list for `-bands`, when the renderer needs one.
fn bands_argument(ctx: &StageContext) -> Option<String> {
    if ctx.reconstruction.is_multi() {
        let names: Vec<String> = ctx
            .reconstruction
            .bands()
            .iter()
            .map(|b| b.name.to_lowercase())
            .collect();
        return Some(names.join(","));
    }
    ctx.reconstruction
        .photos
        .first()
        .filter(|p| p.band_name.eq_ignore_ascii_case("LWIR"))
        .map(|_| "lwir".to_string())
}

fn input_models(ctx: &StageContext) -> Result<Vec<PathBuf>> {
    let base_dir = if ctx.config.use_3dmesh {
        &ctx.tree.texture_path
    } else {
        &ctx.tree.texture_path_25d
    };
    Ok(texture_targets(ctx)?
        .into_iter()
        .map(|t| {
            let dir = if t.subdir.is_empty() {
                base_dir.clone()
            } else {
                base_dir.join(&t.subdir)
            };
            dir.join(&ctx.tree.textured_model_obj)
        })
        .collect())
}

fn build_overviews(ctx: &StageContext, orthophoto: &Path) -> Result<()> {
    info!("Building overviews for {}", orthophoto.display());
    let spec = ctx
        .tools
        .command(&ctx.tools.paths.gdal_addo)
        .args(["-r", "average", "--config", "BIGTIFF_OVERVIEW", "IF_SAFER"])
        .args(["--config", "COMPRESS_OVERVIEW", "JPEG"])
        .path_arg(orthophoto)
        .args(["2", "4", "8", "16"]);
    ctx.tools.run(&spec)
}

pub struct OrthoStage;

impl OrthoStage {
    fn render_command(ctx: &StageContext, resolution: f64) -> Result<ExternalToolSpec> {
        let tree = ctx.tree;
        let georef = ctx.georef();
        let output = if georef.is_valid {
            &tree.orthophoto_tif
        } else {
            &tree.orthophoto_render
        };

        let mut spec = ctx
            .tools
            .command(&ctx.tools.paths.odm_orthophoto)
            .arg("-inputFiles");
        for model in input_models(ctx)? {
            spec = spec.path_arg(&model);
        }
        spec = spec
            .arg("-logFile")
            .path_arg(&tree.orthophoto_log)
            .arg("-outputFile")
            .path_arg(output)
            .arg("-resolution")
            .arg(format!("{:.1}", pixels_per_meter(resolution)))
            .arg("-verbose")
            .arg("-outputCornerFile")
            .path_arg(&tree.orthophoto_corners);

        if georef.is_valid && !ctx.reconstruction.is_multi() {
            spec = spec.args(["-inpaintThreshold", "1.0"]);
        }
        if let Some(proj) = georef.proj_string() {
            spec = spec
                .arg("-utm_north_offset")
                .arg(format!("{:.1}", georef.utm_north_offset))
                .arg("-utm_east_offset")
                .arg(format!("{:.1}", georef.utm_east_offset))
                .arg("-a_srs")
                .arg(proj);
        }
        if let Some(bands) = bands_argument(ctx) {
            spec = spec.arg("-bands").arg(bands);
        }

        Ok(spec
            .args(["-co", "TILED=YES", "-co", "COMPRESS=DEFLATE", "-co", "PREDICTOR=2"])
            .args(["-co", "BIGTIFF=IF_SAFER", "-co", "BLOCKXSIZE=512", "-co", "BLOCKYSIZE=512"])
            .arg("-co")
            .arg(format!("NUM_THREADS={}", ctx.config.max_concurrency))
            .args(["--config", "GDAL_CACHEMAX", GDAL_CACHEMAX]))
    }
}

impl Stage for OrthoStage {
    fn id(&self) -> StageId {
        StageId::Orthophoto
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        if ctx.config.skip_orthophoto {
            return false;
        }
        if ctx.is_georef() {
            ctx.tree.orthophoto_tif.exists()
        } else {
            ctx.tree.orthophoto_render.exists()
        }
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Orthophoto");
        let tree = ctx.tree;
        fs::create_dir_all(&tree.ortho_path)?;

        if ctx.config.skip_orthophoto {
            return Err(PipelineError::invalid(
                "orthophoto",
                "--skip-orthophoto is set, no orthophoto will be generated",
            ));
        }

        let georef = ctx.georef();
        let output = if georef.is_valid {
            &tree.orthophoto_tif
        } else {
            &tree.orthophoto_render
        };
        if !ctx.needs_run(StageId::Orthophoto, output, "orthophoto") {
            return Ok(());
        }

        let options = CapOptions {
            ignore_gsd: ctx.config.ignore_gsd,
            ignore_resolution: georef.is_valid && ctx.config.ignore_gsd,
            has_gcp: ctx.has_gcp(),
            ..CapOptions::new(0.10, 1.0)
        };
        let resolution = gsd::cap_resolution(
            ctx.config.ortho_resolution,
            &tree.opensfm_reconstruction,
            &ctx.reconstruction.photos,
            &options,
        );

        let spec = Self::render_command(ctx, resolution)?;
        ctx.tools.run(&spec)?;

        if georef.is_valid {
            if ctx.crop > 0.0 {
                let bounds = Cropper::new(&tree.georef_path, BOUNDS_PREFIX).path("bounds.gpkg");
                Cropper::crop(
                    &ctx.tools,
                    &bounds,
                    &tree.orthophoto_tif,
                    false,
                    ctx.config.max_concurrency,
                )?;
            }
            if tree.orthophoto_tif.exists() {
                build_overviews(ctx, &tree.orthophoto_tif)?;
            }
        } else if !tree.orthophoto_render.exists() {
            warn!("Could not generate an orthophoto (it did not render)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn resolution_is_converted_to_pixels_per_meter() {
        assert_relative_eq!(pixels_per_meter(5.0), 20.0);
        assert_relative_eq!(pixels_per_meter(2.5), 40.0);
        assert_eq!(format!("{:.1}", pixels_per_meter(3.0)), "33.3");
    }
}
