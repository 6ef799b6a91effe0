//! Typed failure taxonomy for the production pipeline.
//!
//! Every failure maps to exactly one recovery policy:
//!
//! - `Configuration`: the offending view becomes a disabled slot, other views are unaffected.
//! - `SourceUnavailable`: the producer aborts and deregisters, nothing is ever published.
//! - `TransientProcessing`: the cycle is skipped and the previous snapshot stays visible.
//! - `AccelerationUnavailable`: the CPU backend is used instead, decided once at startup.
//!
//! No variant terminates the process.

/// Pipeline stage in which a transient failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Acquire,
    Composite,
    Encode,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Composite => "composite",
            Stage::Encode => "encode",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineError {
    Configuration {
        view_index: usize,
        message: String,
    },
    SourceUnavailable {
        source_id: String,
        message: String,
    },
    TransientProcessing {
        stage: Stage,
        message: String,
    },
    AccelerationUnavailable {
        message: String,
    },
}

impl PipelineError {
    pub fn configuration(view_index: usize, err: impl std::fmt::Display) -> Self {
        PipelineError::Configuration {
            view_index,
            message: err.to_string(),
        }
    }

    pub fn source_unavailable(source_id: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::SourceUnavailable {
            source_id: source_id.to_string(),
            message: err.to_string(),
        }
    }

    /// Wraps an `anyhow::Error` with its full context chain.
    pub fn transient(stage: Stage, err: &anyhow::Error) -> Self {
        PipelineError::TransientProcessing {
            stage,
            message: format!("{:#}", err),
        }
    }

    pub fn acceleration_unavailable(err: impl std::fmt::Display) -> Self {
        PipelineError::AccelerationUnavailable {
            message: err.to_string(),
        }
    }

    /// Stable code for log lines and status reporting.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Configuration { .. } => "CONFIGURATION_ERROR",
            PipelineError::SourceUnavailable { .. } => "SOURCE_UNAVAILABLE",
            PipelineError::TransientProcessing { .. } => "TRANSIENT_PROCESSING_ERROR",
            PipelineError::AccelerationUnavailable { .. } => "ACCELERATION_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Configuration {
                view_index,
                message,
            } => write!(f, "{}: view {}: {}", self.code(), view_index, message),
            PipelineError::SourceUnavailable { source_id, message } => {
                write!(f, "{}: {}: {}", self.code(), source_id, message)
            }
            PipelineError::TransientProcessing { stage, message } => {
                write!(f, "{}: {}: {}", self.code(), stage.as_str(), message)
            }
            PipelineError::AccelerationUnavailable { message } => {
                write!(f, "{}: {}", self.code(), message)
            }
        }
    }
}

impl std::error::Error for PipelineError {}
