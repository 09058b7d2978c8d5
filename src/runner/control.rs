//! Container control plane used by the runner.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control plane unavailable: {0}")]
    Unavailable(String),
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn restart(&self, resource: &str) -> Result<(), ControlError>;
    async fn stop(&self, resource: &str) -> Result<(), ControlError>;
    async fn start(&self, resource: &str) -> Result<(), ControlError>;
    /// Start a new detached resource `name` from `image`.
    async fn provision(&self, name: &str, image: &str) -> Result<(), ControlError>;
}

/// Drives containers through the `docker` command line.
pub struct DockerCli {
    binary: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self { binary: binary.into(), timeout }
    }

    async fn run(&self, args: &[&str]) -> Result<(), ControlError> {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(%command, "running control-plane command");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| ControlError::Timeout {
            command: command.clone(),
            secs: self.timeout.as_secs(),
        })?
        .map_err(|e| ControlError::Unavailable(format!("{}: {}", self.binary, e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ControlError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ControlPlane for DockerCli {
    async fn restart(&self, resource: &str) -> Result<(), ControlError> {
        self.run(&["restart", resource]).await
    }

    async fn stop(&self, resource: &str) -> Result<(), ControlError> {
        self.run(&["stop", resource]).await
    }

    async fn start(&self, resource: &str) -> Result<(), ControlError> {
        self.run(&["start", resource]).await
    }

    async fn provision(&self, name: &str, image: &str) -> Result<(), ControlError> {
        self.run(&["run", "-d", "--name", name, image]).await
    }
}

/// No control plane: every call is unavailable, which routes each action to
/// synthetic recovery.
pub struct Disabled;

#[async_trait]
impl ControlPlane for Disabled {
    async fn restart(&self, _resource: &str) -> Result<(), ControlError> {
        Err(ControlError::Unavailable("disabled".to_string()))
    }

    async fn stop(&self, _resource: &str) -> Result<(), ControlError> {
        Err(ControlError::Unavailable("disabled".to_string()))
    }

    async fn start(&self, _resource: &str) -> Result<(), ControlError> {
        Err(ControlError::Unavailable("disabled".to_string()))
    }

    async fn provision(&self, _name: &str, _image: &str) -> Result<(), ControlError> {
        Err(ControlError::Unavailable("disabled".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let cli = DockerCli::new("/nonexistent/docker-binary", Duration::from_secs(2));
        match cli.restart("payment-service").await {
            Err(ControlError::Unavailable(msg)) => assert!(msg.contains("docker-binary")),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disabled_never_succeeds() {
        assert!(Disabled.restart("x").await.is_err());
        assert!(Disabled.provision("x-cache-1", "redis:7-alpine").await.is_err());
    }
}
