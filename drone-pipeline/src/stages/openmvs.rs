/// Dense reconstruction with OpenMVS
use super::{Stage, StageContext, StageId};
use crate::error::Result;
use crate::reconstruction::depthmap_resolution;
use log::info;
use std::fs;

pub struct OpenMvsStage;

/// Number of times the undistorted images are halved before densification.
pub fn resolution_level(max_resolution: u32, depthmap_resolution: u32) -> u32 {
    if max_resolution <= depthmap_resolution || depthmap_resolution == 0 {
        return 0;
    }
    (f64::from(max_resolution) / f64::from(depthmap_resolution))
        .log2()
        .round() as u32
}

impl Stage for OpenMvsStage {
    fn id(&self) -> StageId {
        StageId::OpenMvs
    }

    /// Fast orthophoto mode filters the sparse cloud directly, so there is
    /// nothing to produce.
    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        ctx.config.fast_orthophoto || ctx.tree.openmvs_model.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        if ctx.config.fast_orthophoto {
            info!("Fast orthophoto is turned on, skipping dense reconstruction");
            return Ok(());
        }
        if !ctx.needs_run(StageId::OpenMvs, &ctx.tree.openmvs_model, "dense model") {
            return Ok(());
        }

        info!("Exporting from OpenSFM");
        let spec = ctx
            .tools
            .command(&ctx.tools.paths.opensfm)
            .arg("export_openmvs")
            .path_arg(&ctx.tree.opensfm);
        ctx.tools.run(&spec)?;

        let depthmaps_dir = ctx.tree.openmvs.join("depthmaps");
        fs::create_dir_all(&depthmaps_dir)?;

        let depthmap_res = depthmap_resolution(&ctx.reconstruction.photos, ctx.config.pc_quality);
        info!("Depthmap resolution set to: {depthmap_res}px");

        let max_resolution = ctx.config.undistorted_image_max_size;
        let level = resolution_level(max_resolution, depthmap_res);

        ctx.cancel.check()?;
        info!("Densify pass 1/2");
        let spec = ctx
            .tools
            .command(&ctx.tools.paths.densify)
            .path_arg(&ctx.tree.openmvs.join("scene.mvs"))
            .arg("-w")
            .path_arg(&depthmaps_dir)
            .arg("--dense-config-file")
            .path_arg(&ctx.tree.openmvs.join("Densify.ini"))
            .arg("--resolution-level")
            .arg(level.to_string())
            .arg("--max-resolution")
            .arg(max_resolution.to_string())
            .arg("--max-threads")
            .arg(ctx.config.max_concurrency.to_string())
            .args([
                "--number-views-fuse",
                "2",
                "--sub-resolution-levels",
                "2",
                "--archive-type",
                "3",
                "-v",
                "0",
                "--cuda-device",
                "-1",
            ]);
        ctx.tools.run(&spec)?;

        ctx.cancel.check()?;
        info!("Densify pass 2/2");
        let spec = ctx
            .tools
            .command(&ctx.tools.paths.densify)
            .args(["--filter-point-cloud", "-20", "-i"])
            .path_arg(&ctx.tree.openmvs.join("scene_dense.mvs"))
            .args(["-v", "0", "--cuda-device", "-1"]);
        ctx.tools.run(&spec)
    }
}
