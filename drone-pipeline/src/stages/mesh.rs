/// 2.5D and 3D mesh generation from the filtered point cloud
use super::{Stage, StageContext, StageId};
use crate::dem::get_dem_radius_steps;
use crate::error::Result;
use crate::mesh::{self, Mesh25dParams, MeshMethod};
use log::info;
use std::f64::consts::PI;
use std::fs;

/// Fast orthophoto builds its DSM this many times coarser.
const FAST_DSM_SCALE: f64 = 8.0;

pub struct MeshStage;

impl MeshStage {
    fn create_25d(ctx: &StageContext) -> Result<()> {
        if ctx.config.use_3dmesh {
            return Ok(());
        }
        let tree = ctx.tree;
        if !ctx.needs_run(StageId::Mesh, &tree.mesh_file_25d, "2.5D mesh file") {
            return Ok(());
        }
        info!("Writing 2.5D mesh file: '{}'", tree.mesh_file_25d.display());

        let multiplier = PI / 2.0;
        let radius_steps = get_dem_radius_steps(
            &tree.filtered_point_cloud_stats,
            3,
            ctx.config.ortho_resolution,
            multiplier,
        );
        let mut dsm_resolution = radius_steps[0] / multiplier;
        info!("2.5D DSM resolution: {dsm_resolution:.2}");

        let method = if ctx.config.fast_orthophoto {
            dsm_resolution *= FAST_DSM_SCALE;
            MeshMethod::Poisson
        } else {
            MeshMethod::Gridded
        };

        let params = Mesh25dParams {
            radius_steps,
            dsm_resolution,
            depth: ctx.config.octree_depth,
            samples_per_node: 1.0,
            max_vertex_count: ctx.config.mesh_size,
            available_cores: ctx.config.max_concurrency,
            method,
            smooth_dsm: true,
            max_tiles: ctx.image_count() / 2,
        };
        mesh::create_25dmesh(
            &ctx.tools,
            &tree.filtered_point_cloud,
            &tree.mesh_file_25d,
            &params,
            ctx.cancel,
        )?;
        Ok(())
    }

    fn create_3d(ctx: &StageContext) -> Result<()> {
        if ctx.config.skip_3dmodel {
            return Ok(());
        }
        let tree = ctx.tree;
        if !ctx.needs_run(StageId::Mesh, &tree.mesh_file, "mesh file") {
            return Ok(());
        }
        info!("Writing 3D mesh file: '{}'", tree.mesh_file.display());

        // PoissonRecon can stall when it is given every core
        let threads = ctx.config.max_concurrency.saturating_sub(1).max(1);
        mesh::screened_poisson_reconstruction(
            &ctx.tools,
            &tree.filtered_point_cloud,
            &tree.mesh_file,
            ctx.config.octree_depth,
            1.0,
            ctx.config.mesh_size,
            4.0,
            threads,
        )?;
        Ok(())
    }
}

impl Stage for MeshStage {
    fn id(&self) -> StageId {
        StageId::Mesh
    }

    fn outputs_exist(&self, ctx: &StageContext) -> bool {
        (ctx.config.use_3dmesh || ctx.tree.mesh_file_25d.exists())
            && (ctx.config.skip_3dmodel || ctx.tree.mesh_file.exists())
    }

    fn run(&self, ctx: &mut StageContext) -> Result<()> {
        info!("Mesh");
        fs::create_dir_all(&ctx.tree.mesh_path)?;

        Self::create_25d(ctx)?;
        ctx.cancel.check()?;
        Self::create_3d(ctx)
    }
}
