use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by fixture operations.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("authentication is not enabled")]
    AuthDisabled,

    #[error("command failed: {stderr}")]
    Command { stderr: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("container port {0}/tcp is not mapped to a host port")]
    PortNotMapped(u16),

    #[error("Pulsar did not become ready within {0:?}")]
    Timeout(Duration),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("failed to build archive: {0}")]
    Archive(#[from] std::io::Error),
}

pub type Result<T, E = FixtureError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_carries_stderr() {
        let err = FixtureError::Command {
            stderr: "boom".to_string(),
        };
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_auth_disabled_message() {
        assert_eq!(
            FixtureError::AuthDisabled.to_string(),
            "authentication is not enabled"
        );
    }
}
