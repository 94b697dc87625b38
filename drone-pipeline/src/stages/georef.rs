/// Georeferenced LAZ export and crop bounds
use super::{Stage, StageContext, StageId};
use crate::cropper::Cropper;
use crate::error::{PipelineError, Result};
use crate::georef::Georef;
use log::{info, warn};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

/// File prefix of the crop bounds written next to the georeferenced model.
pub const BOUNDS_PREFIX: &str = "odm_georeferenced_model";

/// Decimation applied before the crop hull: fixed in fast mode, otherwise
/// growing with the image count.
pub fn crop_decimation_step(fast_orthophoto: bool, image_count: usize) -> u32 {
    if fast_orthophoto {
        return 4;
    }
    let step = 40 * (image_count / 1000 + 1);
    step.min(95) as u32
}

/// PDAL pipeline moving the filtered cloud into UTM coordinates.
pub fn georef_pipeline(input: &Path, output: &Path, georef: &Georef) -> Result<Value> {
    let proj = georef
        .proj_string()
        .ok_or_else(|| PipelineError::malformed("georeference", "invalid coordinate file"))?;
    let (x, y) = (georef.utm_east_offset, georef.utm_north_offset);
    Ok(json!([
        {
            "type": "readers.ply",
            "filename": input.to_string_lossy(),
        },
        {
            "type": "filters.ferry",
            "dimensions": "views => UserData",
        },
        {
            "type": "filters.transformation",
            "matrix": format!("1 0 0 {x:.1} 0 1 0 {y:.1} 0 0 1 0 0 0 0 1"),
        },
        {
            "type": "writers.las",
            "filename": output.to_string_lossy(),
            "offset_x": x,
            "offset_y": y,
            "offset_z": 0.0,
            "scale_x": 0.001,
            "scale_y": 0.001,
            "scale_z": 0.001,
            "a_srs": proj,
        }
    ]))
}

pub struct GeorefStage;

impl GeorefStage {
    /// Crop bounds failures turn cropping off for the remaining stages.
    fn create_crop_bounds(ctx: &mut StageContext) {
        info!("Calculating cropping area and generating bounds shapefile from point cloud");
        let cropper = Cropper::new(&ctx.tree.georef_path, BOUNDS_PREFIX);
        let step = crop_decimation_step(ctx.config.fast_orthophoto, ctx.image_count());

        if let Err(e) =
            cropper.create_bounds_gpkg(&ctx.tools, &ctx.tree.georef_model_laz, ctx.crop, step)
        {
            warn!("Cannot calculate crop bounds! We will skip cropping ({e})");
            ctx.crop = 0.0;
        }
    }
}

impl Stage for GeorefStage {
    fn id(&self) -> StageId {
        StageId::Georeference
    }

    /// Nothing is produced without a valid coordinate file.
    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        !ctx.is_georef() || ctx.tree.georef_model_laz.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Georeference");

        let georef = ctx.georef();
        if !georef.is_valid {
            info!("Not a georeferenced reconstruction, skipping georeferencing");
            return Ok(());
        }
        if !ctx.needs_run(StageId::Georeference, &ctx.tree.georef_model_laz, "georeferenced model") {
            return Ok(());
        }
        fs::create_dir_all(&ctx.tree.georef_path)?;

        let pipe_file = ctx.tree.root.join("geo_pipe.json");
        let pipeline = georef_pipeline(
            &ctx.tree.filtered_point_cloud,
            &ctx.tree.georef_model_laz,
            &georef,
        )?;
        crate::config::write_json_file(&pipe_file, &pipeline)?;

        let spec = ctx
            .tools
            .command(&ctx.tools.paths.pdal)
            .args(["pipeline", "-i"])
            .path_arg(&pipe_file);
        ctx.tools.run(&spec)?;

        if ctx.crop > 0.0 {
            Self::create_crop_bounds(ctx);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utm::Hemisphere;

    #[test]
    fn decimation_grows_with_image_count() {
        assert_eq!(crop_decimation_step(true, 5000), 4);
        assert_eq!(crop_decimation_step(false, 10), 40);
        assert_eq!(crop_decimation_step(false, 1500), 80);
        assert_eq!(crop_decimation_step(false, 5000), 95);
    }

    #[test]
    fn pipeline_offsets_and_srs() {
        let georef = Georef {
            utm_zone: 33,
            utm_hemisphere: Hemisphere::South,
            utm_east_offset: 450120.0,
            utm_north_offset: 6231000.0,
            is_valid: true,
        };
        let pipe = georef_pipeline(Path::new("in.ply"), Path::new("out.laz"), &georef).unwrap();
        assert_eq!(pipe[2]["matrix"], "1 0 0 450120.0 0 1 0 6231000.0 0 0 1 0 0 0 0 1");
        assert_eq!(pipe[3]["offset_x"], 450120.0);
        assert!(pipe[3]["a_srs"].as_str().unwrap().ends_with("+south"));
    }

    #[test]
    fn invalid_georef_has_no_pipeline() {
        let result = georef_pipeline(Path::new("a"), Path::new("b"), &Georef::default());
        assert!(result.is_err());
    }
}
