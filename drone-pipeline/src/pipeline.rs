//! Top-level orchestration.
//!
//! [`Pipeline::run`] executes every stage in order against one shared
//! context. A stage whose outputs are already on disk is skipped unless the
//! configuration asks to re-run it; the first failure stops the run and the
//! files written so far stay in place for the next attempt.
use crate::cancel::CancelToken;
use crate::config::{PipelineConfig, ProjectTree};
use crate::constants::STAGE_BANNER;
use crate::error::{PipelineError, Result};
use crate::photo::Photo;
use crate::runner::{CommandRunner, RunLog, Toolkit};
use crate::stages::{self, StageContext, StageId, dataset};
use log::{error, info, warn};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Which stages ran and which were satisfied by existing outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: Vec<StageId>,
    pub skipped: Vec<StageId>,
}

pub struct Pipeline {
    config: PipelineConfig,
    tree: ProjectTree,
    runner: Arc<dyn CommandRunner>,
    run_log: Arc<RunLog>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, tree: ProjectTree, runner: Arc<dyn CommandRunner>) -> Self {
        let run_log = Arc::new(RunLog::new(&tree.run_log));
        Self {
            config,
            tree,
            runner,
            run_log,
            cancel: CancelToken::new(),
        }
    }

    /// Share a run log with the process runner.
    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = run_log;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tree(&self) -> &ProjectTree {
        &self.tree
    }

    pub fn run(&self, photos: &[Photo]) -> Result<RunSummary> {
        fs::create_dir_all(&self.tree.root)?;
        self.run_log.init()?;

        if photos.is_empty() {
            return Err(PipelineError::missing("pipeline", "photo list"));
        }
        info!(
            "Processing {} photos into {}",
            photos.len(),
            self.tree.root.display()
        );

        let tools = self.config.resolved_tools();
        let toolkit = Toolkit::new(self.runner.as_ref(), &tools, &self.config.tool_env);
        let reconstruction = dataset::load_reconstruction(&self.config, photos)?;
        let mut ctx = StageContext::new(
            &self.config,
            &self.tree,
            toolkit,
            &self.run_log,
            &self.cancel,
            reconstruction,
        );

        let mut summary = RunSummary::default();
        for (index, stage) in stages::pipeline_stages().iter().enumerate() {
            self.cancel.check()?;

            let id = stage.id();
            self.run_log.write_line(STAGE_BANNER);
            self.run_log.write_line(&format!("Stage: {}", id.name()));
            self.run_log.write_line(STAGE_BANNER);

            let start = Instant::now();
            if stage.outputs_exist(&ctx) && !ctx.rerun(id) {
                info!("{}: found existing outputs, skipping", id.name());
                summary.skipped.push(id);
            } else {
                info!("Running stage: {}", id.name());
                match stage.run(&mut ctx) {
                    Ok(()) => summary.executed.push(id),
                    Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                    Err(e) => {
                        error!("{} failed: {}", id.name(), e);
                        return Err(PipelineError::Stage {
                            stage: id,
                            source: Box::new(e),
                        });
                    }
                }
            }
            write_benchmark(
                &self.tree.benchmark_log,
                id,
                start.elapsed().as_secs_f64(),
                index == 0,
            );
        }

        info!(
            "Pipeline finished: {} stages run, {} skipped",
            summary.executed.len(),
            summary.skipped.len()
        );
        Ok(summary)
    }
}

/// `<stage name>: <seconds>`; the first stage of a run starts a fresh file.
fn write_benchmark(path: &Path, stage: StageId, seconds: f64, truncate: bool) {
    let result = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!truncate)
        .truncate(truncate)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}: {:.3}", stage.name(), seconds));
    if let Err(e) = result {
        warn!("Unable to write benchmark log '{}': {}", path.display(), e);
    }
}
