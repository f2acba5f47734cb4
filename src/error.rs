//! Error types for container reconciliation

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("Engine call '{action}' failed for container '{container_id}': {source}")]
    EngineCallFailed {
        action: String,
        container_id: String,
        #[source]
        source: EngineError,
    },

    #[error(
        "Command timed out after {}s:\n{command}\n\nAdjust cmd_timeout if this command needs longer.",
        timeout.as_secs()
    )]
    CommandTimeout { command: String, timeout: Duration },

    #[error("Init system operation failed for service '{service}': {source}")]
    InitSystem {
        service: String,
        #[source]
        source: CommandError,
    },

    #[error("Command error: {0}")]
    Command(CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap an engine failure with the action and container it happened on
    pub fn engine_call(action: impl Into<String>, container_id: impl Into<String>, source: EngineError) -> Self {
        Error::EngineCallFailed {
            action: action.into(),
            container_id: container_id.into(),
            source,
        }
    }

    /// Check if the engine reported the container as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EngineCallFailed { source: EngineError::NotFound(_), .. }
        )
    }
}

impl From<CommandError> for Error {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout { command, timeout } => Error::CommandTimeout { command, timeout },
            other => Error::Command(other),
        }
    }
}

/// Failure running an external program
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error talking to `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Stderr of a command that ran and failed, empty otherwise
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Failure reported by a container engine client
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("unexpected engine response: {0}")]
    Malformed(String),

    #[error("engine did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_timeout_maps_to_crate_timeout() {
        let err: Error = CommandError::Timeout {
            command: "docker login registry.local".into(),
            timeout: Duration::from_secs(60),
        }
        .into();

        assert!(matches!(err, Error::CommandTimeout { .. }));
        let message = err.to_string();
        assert!(message.contains("docker login registry.local"));
        assert!(message.contains("cmd_timeout"));
    }

    #[test]
    fn test_engine_call_carries_context() {
        let err = Error::engine_call("stop", "abc123", EngineError::NotFound("abc123".into()));
        assert!(err.is_not_found());
        assert!(err.to_string().contains("'stop'"));
        assert!(err.to_string().contains("'abc123'"));
    }

    #[test]
    fn test_failed_command_stderr() {
        let err = CommandError::Failed {
            command: "docker rm x".into(),
            code: Some(1),
            stderr: "Error: No such container: x".into(),
        };
        assert_eq!(err.stderr(), "Error: No such container: x");
    }
}
