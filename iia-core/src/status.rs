use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::{GenerationRequest, GenerationResult};

/// Why a load attempt ended in `LoadFailed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("engine rejected the model")]
    EngineRejected,
}

/// Why a generation ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationFailure {
    #[error("engine returned no image data")]
    EmptyOutput,
    #[error("engine error: {0}")]
    Engine(String),
    #[error("parameters rejected: {0}")]
    InvalidParameters(String),
}

impl GenerationFailure {
    /// True for the failures that originate inside the engine rather than in the request.
    pub fn is_engine_rejected(&self) -> bool {
        matches!(self, Self::EmptyOutput | Self::Engine(_))
    }
}

/// Negative acknowledgement for `load`/`submit`. Returned synchronously; no state changes.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    #[error("a model is already loading")]
    AlreadyLoading,
    #[error("a generation is already running")]
    GenerationRunning,
    #[error("no model is ready")]
    ModelNotReady,
    #[error("an unload is pending")]
    UnloadPending,
    #[error("the orchestrator has shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ModelStatus {
    #[default]
    Unloaded,
    Loading,
    Ready,
    LoadFailed(LoadFailure),
}

impl ModelStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => f.write_str("No model loaded"),
            Self::Loading => f.write_str("Loading model..."),
            Self::Ready => f.write_str("Model ready"),
            Self::LoadFailed(reason) => write!(f, "Model failed to load ({reason})"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum GenerationStatus {
    #[default]
    Idle,
    Running(Arc<GenerationRequest>),
    Succeeded(Arc<GenerationResult>),
    Failed(GenerationFailure),
}

impl GenerationStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Running(request) => write!(
                f,
                "Generating {}x{} ({} steps)",
                request.width, request.height, request.steps
            ),
            Self::Succeeded(result) => write!(f, "Done: {}x{}", result.width, result.height),
            Self::Failed(reason) => write!(f, "Generation failed ({reason})"),
        }
    }
}
