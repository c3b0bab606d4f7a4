//! Core error types.

use thiserror::Error;

/// Boxed error returned by user-supplied guard and action functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the statechart engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid guard expression: {reason}")]
    InvalidGuard { reason: String },

    #[error("guard '{guard}' failed on event '{event}' in state '{state}': {source}")]
    Guard {
        state: String,
        event: String,
        guard: String,
        #[source]
        source: BoxError,
    },

    #[error("action '{action}' failed on event '{event}' in state '{state}': {source}")]
    Action {
        state: String,
        event: String,
        action: String,
        #[source]
        source: BoxError,
    },

    #[error("unknown state: {state}")]
    UnknownState { state: String },

    #[error("instance has been disposed")]
    Disposed,

    #[error("machine not found: {machine}")]
    MachineNotFound { machine: String },

    #[error("machine version not found: {machine} v{version}")]
    MachineVersionNotFound { machine: String, version: u32 },

    #[error("machine version already exists: {machine} v{version}")]
    MachineVersionExists { machine: String, version: u32 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Returns true for errors raised while building a machine from its
    /// definition. The definition must be fixed before retrying.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::InvalidGuard { .. }
                | CoreError::Json(_)
                | CoreError::Yaml(_)
        )
    }

    /// Returns true when a guard or action implementation failed during `send`.
    /// The instance is left exactly as it was before the call.
    pub fn is_action_error(&self) -> bool {
        matches!(self, CoreError::Guard { .. } | CoreError::Action { .. })
    }

    /// Returns a stable error code suitable for machine-readable output.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidDefinition { .. } => "CONFIGURATION_ERROR",
            CoreError::InvalidGuard { .. } => "CONFIGURATION_ERROR",
            CoreError::Json(_) => "CONFIGURATION_ERROR",
            CoreError::Yaml(_) => "CONFIGURATION_ERROR",
            CoreError::Guard { .. } => "ACTION_ERROR",
            CoreError::Action { .. } => "ACTION_ERROR",
            CoreError::UnknownState { .. } => "UNKNOWN_STATE",
            CoreError::Disposed => "DISPOSED",
            CoreError::MachineNotFound { .. } => "MACHINE_NOT_FOUND",
            CoreError::MachineVersionNotFound { .. } => "MACHINE_NOT_FOUND",
            CoreError::MachineVersionExists { .. } => "MACHINE_VERSION_EXISTS",
        }
    }
}
