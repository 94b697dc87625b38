//! External tool invocation.
//!
//! Every heavy processing step shells out to a third-party program. The
//! boundary is kept narrow: an [`ExternalToolSpec`] value describes one
//! invocation and a [`CommandRunner`] executes it, so stages can be tested
//! against a recording runner instead of real binaries.
use crate::config::ToolPaths;
use crate::error::{PipelineError, Result};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

/// Outcome of one external invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Program ran and exited normally with code 0.
    Success,
    /// Program missing, argument invalid, or the process could not start.
    Failed,
    /// Program terminated by a signal or exited with a non-zero code.
    Abnormal,
}

impl ToolStatus {
    pub fn code(self) -> i32 {
        match self {
            ToolStatus::Success => 0,
            ToolStatus::Failed => -1,
            ToolStatus::Abnormal => -2,
        }
    }
}

/// One external program invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalToolSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env_overrides: BTreeMap<String, String>,
    /// File receiving the program's stdout, if any.
    pub capture_stdout: Option<PathBuf>,
}

impl ExternalToolSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env_overrides: BTreeMap::new(),
            capture_stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append a path argument using its lossy UTF-8 form.
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env_overrides
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn capture_stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture_stdout = Some(path.into());
        self
    }

    /// Program file name, used in log lines and errors.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.to_string_lossy().into_owned())
    }

    /// Single-line rendering written to the run log.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Arguments must not carry leading or trailing whitespace.
    pub fn validate_args(&self) -> Result<()> {
        match self.args.iter().find(|a| a.trim() != a.as_str()) {
            Some(bad) => Err(PipelineError::invalid(
                &self.program_name(),
                format!("invalid parameter format: '{bad}'"),
            )),
            None => Ok(()),
        }
    }

    /// Run through `runner`, turning any non-success status into an error.
    pub fn execute(&self, runner: &dyn CommandRunner) -> Result<()> {
        match runner.execute(self) {
            ToolStatus::Success => Ok(()),
            status => Err(PipelineError::ExternalTool {
                program: self.program_name(),
                status: status.code(),
            }),
        }
    }
}

/// Executes external programs; blocks until the child exits.
pub trait CommandRunner: Send + Sync {
    fn execute(&self, spec: &ExternalToolSpec) -> ToolStatus;
}

/// Append-only text log shared by the runner and the stages.
/// Opened and closed per write, serialised by a mutex.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the log at the start of a fresh run.
    pub fn init(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, "")?;
        Ok(())
    }

    pub fn write_line(&self, text: &str) {
        self.append(&format!("{text}\n"));
    }

    /// Append raw text; failures only reach the diagnostic log.
    pub fn append(&self, text: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| file.write_all(text.as_bytes()));
        if let Err(e) = result {
            warn!("Unable to write run log '{}': {}", self.path.display(), e);
        }
    }
}

/// `std::process` backed runner.
pub struct ProcessRunner {
    run_log: std::sync::Arc<RunLog>,
    base_env: BTreeMap<String, String>,
}

impl ProcessRunner {
    pub fn new(run_log: std::sync::Arc<RunLog>, base_env: BTreeMap<String, String>) -> Self {
        Self { run_log, base_env }
    }
}

impl CommandRunner for ProcessRunner {
    fn execute(&self, spec: &ExternalToolSpec) -> ToolStatus {
        let Some(program) = resolve_program(&spec.program) else {
            error!("Program file not found: '{}'", spec.program.display());
            return ToolStatus::Failed;
        };

        if let Err(e) = spec.validate_args() {
            error!("{e}");
            return ToolStatus::Failed;
        }

        self.run_log
            .write_line(&format!("Running: {}", spec.command_line()));
        debug!("Running: {}", spec.command_line());

        let output = Command::new(&program)
            .args(&spec.args)
            .envs(&self.base_env)
            .envs(&spec.env_overrides)
            .output();

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                error!("Unable to start '{}': {}", program.display(), e);
                return ToolStatus::Failed;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).replace("\r\n", "\n");
        if !stderr.is_empty() {
            self.run_log.append(&stderr);
        }

        if let Some(capture) = &spec.capture_stdout {
            let stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
            if !stdout.is_empty() {
                if let Err(e) = fs::write(capture, stdout) {
                    warn!("Unable to capture stdout to '{}': {}", capture.display(), e);
                }
            }
        }

        if output.status.success() {
            ToolStatus::Success
        } else {
            match output.status.code() {
                Some(code) => error!("{} returned exit code: {}", spec.program_name(), code),
                None => error!("{} terminated abnormally", spec.program_name()),
            }
            ToolStatus::Abnormal
        }
    }
}

/// Runner, program table and environment overlay handed to the engines.
#[derive(Clone, Copy)]
pub struct Toolkit<'a> {
    pub runner: &'a dyn CommandRunner,
    pub paths: &'a ToolPaths,
    pub env: &'a BTreeMap<String, String>,
}

impl<'a> Toolkit<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        paths: &'a ToolPaths,
        env: &'a BTreeMap<String, String>,
    ) -> Self {
        Self { runner, paths, env }
    }

    /// Invocation of `program` with the environment overlay applied.
    pub fn command(&self, program: &Path) -> ExternalToolSpec {
        ExternalToolSpec::new(program).envs(self.env)
    }

    pub fn run(&self, spec: &ExternalToolSpec) -> Result<()> {
        run_tool(self.runner, spec)
    }
}

/// Execute `spec`, mapping a non-zero status to [`PipelineError::ExternalTool`].
pub fn run_tool(runner: &dyn CommandRunner, spec: &ExternalToolSpec) -> Result<()> {
    spec.execute(runner)
}

/// Locate a program either directly or through `PATH`.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 || program.is_absolute() {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn builder_collects_arguments_in_order() {
        let spec = ExternalToolSpec::new("/usr/bin/pdal")
            .arg("pipeline")
            .args(["-i", "pipe.json"])
            .env("PROJ_LIB", "/share/proj");

        assert_eq!(spec.args, vec!["pipeline", "-i", "pipe.json"]);
        assert_eq!(spec.command_line(), "/usr/bin/pdal pipeline -i pipe.json");
        assert_eq!(spec.program_name(), "pdal");
        assert_eq!(spec.env_overrides["PROJ_LIB"], "/share/proj");
    }

    #[test]
    fn padded_argument_is_rejected() {
        let spec = ExternalToolSpec::new("gdalwarp").arg(" -cutline");
        assert!(spec.validate_args().is_err());
    }

    #[test]
    fn missing_program_reports_minus_one() {
        let dir = tempdir().unwrap();
        let log = Arc::new(RunLog::new(&dir.path().join("run_log.txt")));
        let runner = ProcessRunner::new(log, BTreeMap::new());

        let spec = ExternalToolSpec::new(dir.path().join("no-such-program"));
        assert_eq!(runner.execute(&spec), ToolStatus::Failed);
        assert_eq!(runner.execute(&spec).code(), -1);

        let err = spec.execute(&runner).unwrap_err();
        assert_eq!(err.status(), -1);
    }

    #[test]
    fn run_log_truncates_then_appends() {
        let dir = tempdir().unwrap();
        let log = RunLog::new(&dir.path().join("run_log.txt"));
        log.write_line("stale");
        log.init().unwrap();
        log.write_line("first");
        log.write_line("second");

        let text = fs::read_to_string(log.path()).unwrap();
        assert_eq!(text, "first\nsecond\n");
    }
}
