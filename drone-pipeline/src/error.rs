/// Typed failures raised by pipeline stages and engines
use crate::stages::StageId;
use std::path::PathBuf;
use thiserror::Error;

/// Status reported for failures that did not come from an external tool.
pub const STATUS_FAILED: i32 = -1;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{context}: '{}' not found", path.display())]
    MissingInput { context: String, path: PathBuf },

    #[error("{context}: malformed data ({detail})")]
    MalformedData { context: String, detail: String },

    #[error("{program} failed with status {status}")]
    ExternalTool { program: String, status: i32 },

    #[error("{context}: gave up after {attempts} attempts")]
    RetryExhausted { context: String, attempts: usize },

    #[error("{context}: {detail}")]
    InvalidArgument { context: String, detail: String },

    #[error("resource limit exceeded: {detail}")]
    ResourceLimit { detail: String },

    #[error("processing cancelled")]
    Cancelled,

    #[error("stage '{}' failed: {source}", stage.name())]
    Stage {
        stage: StageId,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("LAS error: {0}")]
    Las(#[from] las::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

impl PipelineError {
    pub fn missing(context: &str, path: impl Into<PathBuf>) -> Self {
        PipelineError::MissingInput {
            context: context.to_string(),
            path: path.into(),
        }
    }

    pub fn malformed(context: &str, detail: impl Into<String>) -> Self {
        PipelineError::MalformedData {
            context: context.to_string(),
            detail: detail.into(),
        }
    }

    pub fn invalid(context: &str, detail: impl Into<String>) -> Self {
        PipelineError::InvalidArgument {
            context: context.to_string(),
            detail: detail.into(),
        }
    }

    /// Integer status surfaced as the process exit code.
    /// Tool statuses pass through unchanged, everything else is -1.
    pub fn status(&self) -> i32 {
        match self {
            PipelineError::ExternalTool { status, .. } => *status,
            PipelineError::Stage { source, .. } => source.status(),
            _ => STATUS_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
