/// Mesh reconstruction from point clouds and DSM rasters
use crate::cancel::CancelToken;
use crate::dem::{self, DemParams};
use crate::error::{PipelineError, Result};
use crate::retry::{halve_threads, retry_with_backoff};
use crate::runner::Toolkit;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

/// Upper bound on halving attempts; 64 threads reach 1 in seven steps.
const MAX_RETRY_ATTEMPTS: usize = 8;

/// How the 2.5D mesh is built from its DSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshMethod {
    Gridded,
    Poisson,
}

impl std::str::FromStr for MeshMethod {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gridded" => Ok(MeshMethod::Gridded),
            "poisson" => Ok(MeshMethod::Poisson),
            other => Err(PipelineError::invalid(
                "2.5D mesh",
                format!("not a valid method: '{other}'"),
            )),
        }
    }
}

/// Inputs to [`create_25dmesh`].
#[derive(Debug, Clone)]
pub struct Mesh25dParams {
    pub radius_steps: Vec<f64>,
    /// DSM resolution in metres per pixel.
    pub dsm_resolution: f64,
    pub depth: u32,
    pub samples_per_node: f64,
    pub max_vertex_count: u32,
    pub available_cores: usize,
    pub method: MeshMethod,
    pub smooth_dsm: bool,
    pub max_tiles: usize,
}

/// `odm_mesh.ply` -> `odm_mesh.dirty.ply`
fn dirty_path(out_mesh: &Path) -> PathBuf {
    dem::related_file_path(out_mesh, "", ".dirty")
}

fn cleanup_mesh(
    tools: &Toolkit,
    dirty: &Path,
    out_mesh: &Path,
    max_vertex_count: u32,
    remove_spurious: u32,
) -> Result<()> {
    let max_faces = u64::from(max_vertex_count) * 2;
    let spec = tools
        .command(&tools.paths.recon_mesh)
        .arg("-i")
        .path_arg(dirty)
        .arg("-o")
        .path_arg(out_mesh)
        .args(["--archive-type", "3", "--remove-spikes", "0", "--remove-spurious"])
        .arg(remove_spurious.to_string())
        .args(["--smooth", "0", "--target-face-num"])
        .arg(max_faces.to_string())
        .args(["-v", "0"]);
    tools.run(&spec)
}

/// Poisson surface reconstruction followed by cleanup and decimation.
/// Retries with half the threads until PoissonRecon produces output.
pub fn screened_poisson_reconstruction(
    tools: &Toolkit,
    in_point_cloud: &Path,
    out_mesh: &Path,
    depth: u32,
    samples_per_node: f64,
    max_vertex_count: u32,
    point_weight: f64,
    threads: usize,
) -> Result<PathBuf> {
    if !in_point_cloud.exists() {
        return Err(PipelineError::missing("poisson reconstruction", in_point_cloud));
    }

    let dirty = dirty_path(out_mesh);
    if dirty.exists() {
        fs::remove_file(&dirty)?;
    }

    retry_with_backoff(
        "PoissonRecon",
        threads.max(1),
        |&threads| {
            let spec = tools
                .command(&tools.paths.poisson)
                .arg("--in")
                .path_arg(in_point_cloud)
                .arg("--out")
                .path_arg(&dirty)
                .arg("--depth")
                .arg(depth.to_string())
                .arg("--pointWeight")
                .arg(format!("{point_weight:.1}"))
                .arg("--samplesPerNode")
                .arg(format!("{samples_per_node:.1}"))
                .arg("--threads")
                .arg(threads.to_string())
                .args(["--bType", "2", "--linearFit"]);
            // exit status is unreliable here, the output file decides
            let _ = tools.run(&spec);
            if dirty.exists() {
                Ok(())
            } else {
                Err(PipelineError::missing("PoissonRecon output", &dirty))
            }
        },
        halve_threads,
        MAX_RETRY_ATTEMPTS,
    )?;

    cleanup_mesh(tools, &dirty, out_mesh, max_vertex_count, 20)?;
    let _ = fs::remove_file(&dirty);

    Ok(out_mesh.to_path_buf())
}

/// Gridded mesh straight from a DSM raster.
pub fn dem_to_mesh_gridded(
    tools: &Toolkit,
    in_geotiff: &Path,
    out_mesh: &Path,
    max_vertex_count: u32,
    max_concurrency: usize,
) -> Result<PathBuf> {
    info!("Creating mesh from DSM: {}", in_geotiff.display());

    let dirty = dirty_path(out_mesh);

    retry_with_backoff(
        "dem2mesh",
        max_concurrency.max(1),
        |&concurrency| {
            let spec = tools
                .command(&tools.paths.dem2mesh)
                .arg("-inputFile")
                .path_arg(in_geotiff)
                .arg("-outputFile")
                .path_arg(&dirty)
                .args(["-maxTileLength", "2000", "-maxVertexCount"])
                .arg(max_vertex_count.to_string())
                .arg("-maxConcurrency")
                .arg(concurrency.to_string())
                .args(["-edgeSwapThreshold", "0.15", "-verbose"]);
            let _ = tools.run(&spec);
            if dirty.exists() {
                Ok(())
            } else {
                Err(PipelineError::missing("dem2mesh output", &dirty))
            }
        },
        |concurrency| {
            let next = halve_threads(concurrency);
            if let Some(next) = next {
                info!("dem2mesh failed, retrying with lower concurrency ({next}) in case this is a memory issue");
            }
            next
        },
        MAX_RETRY_ATTEMPTS,
    )?;

    cleanup_mesh(tools, &dirty, out_mesh, max_vertex_count, 0)?;
    let _ = fs::remove_file(&dirty);

    Ok(out_mesh.to_path_buf())
}

/// DSM raster to a point cloud with skirts along height breaks.
pub fn dem_to_points(tools: &Toolkit, in_geotiff: &Path, out_point_cloud: &Path) -> Result<PathBuf> {
    let spec = tools
        .command(&tools.paths.dem2points)
        .arg("-inputFile")
        .path_arg(in_geotiff)
        .arg("-outputFile")
        .path_arg(out_point_cloud)
        .args([
            "-skirtHeightThreshold",
            "1.5",
            "-skirtIncrements",
            "0.2",
            "-skirtHeightCap",
            "100",
            "-verbose",
        ]);
    tools.run(&spec)?;
    Ok(out_point_cloud.to_path_buf())
}

/// 2.5D mesh: DSM in `<mesh dir>/tmp`, then gridded or Poisson meshing.
pub fn create_25dmesh(
    tools: &Toolkit,
    in_point_cloud: &Path,
    out_mesh: &Path,
    params: &Mesh25dParams,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    let mesh_directory = out_mesh.parent().unwrap_or_else(|| Path::new("."));
    let tmp_directory = mesh_directory.join("tmp");
    fs::create_dir_all(&tmp_directory)?;

    info!("Creating DSM for 2.5D mesh");

    let dem_params = DemParams {
        radius_steps: params.radius_steps.clone(),
        output_type: "max".to_string(),
        gapfill: true,
        max_workers: params.available_cores,
        apply_smoothing: params.smooth_dsm,
        max_tiles: params.max_tiles,
        ..DemParams::new(in_point_cloud, "mesh_dsm", &tmp_directory, params.dsm_resolution)
    };
    let dsm = dem::create_dem(tools, &dem_params, cancel)?;

    let mesh = match params.method {
        MeshMethod::Gridded => dem_to_mesh_gridded(
            tools,
            &dsm,
            out_mesh,
            params.max_vertex_count,
            params.available_cores.max(1),
        )?,
        MeshMethod::Poisson => {
            let dsm_points = dem_to_points(tools, &dsm, &tmp_directory.join("dsm_points.ply"))?;
            // PoissonRecon can hang when given every core
            screened_poisson_reconstruction(
                tools,
                &dsm_points,
                out_mesh,
                params.depth,
                params.samples_per_node,
                params.max_vertex_count,
                4.0,
                params.available_cores.saturating_sub(1).max(1),
            )?
        }
    };

    let _ = fs::remove_dir_all(&tmp_directory);
    Ok(mesh)
}
