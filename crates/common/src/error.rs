//! Error types shared across livemix crates.

/// Coarse classification of failures, following the points in the
/// graph lifecycle where they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Stage construction or configuration (fatal at startup).
    Construction,
    /// Graph assembly: linking, negotiation, port handling.
    Link,
    /// A lifecycle state transition failed.
    Transition,
    /// A live stage reported a fault while playing.
    Runtime,
}

/// Top-level error type for livemix operations.
#[derive(Debug, thiserror::Error)]
pub enum LivemixError {
    #[error("Stage kind '{kind}' is not provided by this runtime")]
    UnavailableCapability { kind: String },

    #[error("Invalid option '{key}' on stage '{stage}': {message}")]
    InvalidOption {
        stage: String,
        key: String,
        message: String,
    },

    #[error("A stage named '{name}' already exists in the graph")]
    DuplicateStage { name: String },

    #[error("Stage '{stage}' is in use: {message}")]
    StageInUse { stage: String, message: String },

    #[error("Cannot link {upstream} to {downstream}: format {contract} is not accepted by both ends")]
    IncompatibleFormat {
        upstream: String,
        downstream: String,
        contract: String,
    },

    #[error("No common format between {upstream} and {downstream}")]
    NoCommonFormat { upstream: String, downstream: String },

    #[error("Invalid port: {message}")]
    InvalidPort { message: String },

    #[error("Linking {upstream} to {downstream} would create a cycle")]
    LinkCycle { upstream: String, downstream: String },

    #[error("Graph incomplete, unconnected mandatory ports: {}", .missing.join(", "))]
    GraphIncomplete { missing: Vec<String> },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Resource unavailable for stage '{stage}': {message}")]
    ResourceUnavailable { stage: String, message: String },

    #[error("Error received from stage {stage}: {message}")]
    RuntimeFault {
        stage: String,
        message: String,
        detail: Option<String>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using LivemixError.
pub type LivemixResult<T> = Result<T, LivemixError>;

impl LivemixError {
    pub fn invalid_option(
        stage: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            stage: stage.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn invalid_port(msg: impl Into<String>) -> Self {
        Self::InvalidPort {
            message: msg.into(),
        }
    }

    pub fn resource_unavailable(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Where in the lifecycle this error belongs.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnavailableCapability { .. }
            | Self::InvalidOption { .. }
            | Self::DuplicateStage { .. }
            | Self::Config { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Other(_) => ErrorCategory::Construction,
            Self::IncompatibleFormat { .. }
            | Self::NoCommonFormat { .. }
            | Self::InvalidPort { .. }
            | Self::LinkCycle { .. } => ErrorCategory::Link,
            Self::StageInUse { .. }
            | Self::GraphIncomplete { .. }
            | Self::InvalidTransition { .. }
            | Self::ResourceUnavailable { .. } => ErrorCategory::Transition,
            Self::RuntimeFault { .. } => ErrorCategory::Runtime,
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        match self.category() {
            ErrorCategory::Construction => 1,
            ErrorCategory::Link => 2,
            ErrorCategory::Transition => 3,
            ErrorCategory::Runtime => 4,
        }
    }
}
