/// Statistical outlier removal on the dense (or sparse) point cloud
use super::{Stage, StageContext, StageId};
use crate::error::Result;
use crate::point_cloud;
use log::info;
use std::fs;
use std::path::PathBuf;

pub struct FilterStage;

impl FilterStage {
    /// Dense model, or the sparse OpenSfM cloud in fast orthophoto mode.
    pub fn input_point_cloud(ctx: &StageContext) -> PathBuf {
        if ctx.config.fast_orthophoto {
            ctx.tree.opensfm.join("reconstruction.ply")
        } else {
            ctx.tree.openmvs_model.clone()
        }
    }
}

impl Stage for FilterStage {
    fn id(&self) -> StageId {
        StageId::Filter
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        ctx.tree.filtered_point_cloud.exists()
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Filter points");
        fs::create_dir_all(&ctx.tree.filter_path)?;

        if !ctx.needs_run(StageId::Filter, &ctx.tree.filtered_point_cloud, "point cloud file") {
            return Ok(());
        }

        let input = Self::input_point_cloud(ctx);
        point_cloud::filter(
            &ctx.tools,
            &input,
            &ctx.tree.filtered_point_cloud,
            &ctx.tree.filtered_point_cloud_stats,
            ctx.config.pc_filter,
            ctx.config.pc_sample,
            ctx.config.max_concurrency,
        )
    }
}
