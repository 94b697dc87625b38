/// Command line entry point for the drone photogrammetry pipeline
use clap::Parser;
use drone_pipeline::config::{PcQuality, PipelineConfig, ProjectTree};
use drone_pipeline::photo::load_photos;
use drone_pipeline::runner::{ProcessRunner, RunLog};
use drone_pipeline::{Pipeline, PipelineError, StageId};
use env_logger::Env;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Turn drone photographs into point clouds, meshes, DEMs and orthophotos.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON manifest listing the input photos.
    #[arg(long)]
    photos: PathBuf,

    /// Project output directory.
    #[arg(long)]
    output: PathBuf,

    /// Optional JSON pipeline configuration. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Re-run this stage and every later one, even when outputs exist.
    #[arg(long, value_enum, conflicts_with = "rerun_all")]
    rerun_from: Option<StageId>,

    /// Re-run every stage.
    #[arg(long)]
    rerun_all: bool,

    /// DEM resolution in cm/pixel.
    #[arg(long)]
    dem_resolution: Option<f64>,

    /// Orthophoto resolution in cm/pixel.
    #[arg(long)]
    ortho_resolution: Option<f64>,

    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Build a digital surface model.
    #[arg(long)]
    dsm: bool,

    /// Build a digital terrain model.
    #[arg(long)]
    dtm: bool,

    /// Crop buffer in metres; 0 disables cropping.
    #[arg(long)]
    crop: Option<f64>,

    #[arg(long, value_enum)]
    pc_quality: Option<PcQuality>,

    /// Use the requested resolutions even when finer than the GSD.
    #[arg(long)]
    ignore_gsd: bool,

    /// Skip dense reconstruction and render the orthophoto from the sparse cloud.
    #[arg(long)]
    fast_orthophoto: bool,

    /// Directory holding the external programs.
    #[arg(long)]
    tools_dir: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then the JSON file, then flags given on the command line.
    fn pipeline_config(&self) -> Result<PipelineConfig, PipelineError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };

        if self.rerun_all {
            config.rerun_from = Some(StageId::Dataset);
        } else if self.rerun_from.is_some() {
            config.rerun_from = self.rerun_from;
        }
        if let Some(v) = self.dem_resolution {
            config.dem_resolution = v;
        }
        if let Some(v) = self.ortho_resolution {
            config.ortho_resolution = v;
        }
        if let Some(v) = self.max_concurrency {
            config.max_concurrency = v.max(1);
        }
        if let Some(v) = self.crop {
            config.crop = v;
        }
        if let Some(v) = self.pc_quality {
            config.pc_quality = v;
        }
        if let Some(dir) = &self.tools_dir {
            config.tools_dir = Some(dir.clone());
        }
        config.dsm |= self.dsm;
        config.dtm |= self.dtm;
        config.ignore_gsd |= self.ignore_gsd;
        config.fast_orthophoto |= self.fast_orthophoto;
        Ok(config)
    }
}

fn try_main(cli: &Cli) -> Result<(), PipelineError> {
    let config = cli.pipeline_config()?;
    let photos = load_photos(&cli.photos)?;
    let tree = ProjectTree::new(&cli.output);

    let run_log = Arc::new(RunLog::new(&tree.run_log));
    let runner = Arc::new(ProcessRunner::new(run_log.clone(), config.tool_env.clone()));

    let pipeline = Pipeline::new(config, tree, runner).with_run_log(run_log);
    let summary = pipeline.run(&photos)?;
    info!(
        "Done: {} stages executed, {} skipped",
        summary.executed.len(),
        summary.skipped.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match try_main(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.status() as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["drone-pipeline", "--photos", "p.json", "--output", "out"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).unwrap()
    }

    #[test]
    fn flags_override_json_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"dem_resolution": 10.0, "crop": 1.5, "dtm": true}"#).unwrap();

        let cli = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--dem-resolution",
            "2.5",
            "--rerun-from",
            "mesh",
        ]);
        let config = cli.pipeline_config().unwrap();
        assert_eq!(config.dem_resolution, 2.5);
        assert_eq!(config.crop, 1.5);
        assert!(config.dtm);
        assert_eq!(config.rerun_from, Some(StageId::Mesh));
        assert_eq!(config.ortho_resolution, 5.0);
    }

    #[test]
    fn rerun_all_starts_at_dataset() {
        let config = parse(&["--rerun-all"]).pipeline_config().unwrap();
        assert_eq!(config.rerun_from, Some(StageId::Dataset));
    }

    #[test]
    fn rerun_flags_conflict() {
        let result = Cli::try_parse_from([
            "drone-pipeline",
            "--photos",
            "p.json",
            "--output",
            "out",
            "--rerun-all",
            "--rerun-from",
            "dem",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn failure_status_maps_to_exit_code() {
        let status = PipelineError::Cancelled.status();
        assert_eq!(status as u8, 255);
    }
}
