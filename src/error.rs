use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskboxError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Invalid port spec '{spec}' (expected [hostPort:]containerPort)")]
    InvalidPortSpec { spec: String },

    #[error("Invalid mount '{spec}' (expected host_path:container_path[:ro])")]
    InvalidMount { spec: String },

    // Engine errors
    #[error("Container engine is not available")]
    EngineUnavailable,

    #[error("Container engine failed during {operation}: {message}")]
    Engine { operation: String, message: String },

    #[error("Container engine timed out during {operation} after {seconds} seconds")]
    EngineTimeout { operation: String, seconds: u64 },

    // Sandbox errors
    #[error("Failed to create sandbox for task '{task_id}': {stderr}")]
    CreateFailed { task_id: String, stderr: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskboxError {
    pub fn engine(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True when the caller should fall back to host execution.
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, Self::EngineUnavailable)
    }

    pub fn is_create_failed(&self) -> bool {
        matches!(self, Self::CreateFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, TaskboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_failed_carries_stderr() {
        let err = TaskboxError::CreateFailed {
            task_id: "t1".to_string(),
            stderr: "pull access denied".to_string(),
        };
        assert!(err.is_create_failed());
        assert!(!err.is_engine_unavailable());
        assert_eq!(
            err.to_string(),
            "Failed to create sandbox for task 't1': pull access denied"
        );
    }

    #[test]
    fn test_engine_error_display() {
        let err = TaskboxError::engine("inspect", "permission denied");
        assert_eq!(
            err.to_string(),
            "Container engine failed during inspect: permission denied"
        );
    }
}
