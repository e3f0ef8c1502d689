use crate::infrastructure::error::GatewayError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const DEFAULT_TRACKER_BINARY: &str = "timew";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerCommand {
    Probe,
    Export,
    Start { tags: Vec<String> },
    Stop,
    Retag { id: String, tags: Vec<String> },
}

impl TrackerCommand {
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Probe => vec!["--version".to_string()],
            Self::Export => vec!["export".to_string()],
            Self::Start { tags } => std::iter::once("start".to_string())
                .chain(tags.iter().cloned())
                .collect(),
            Self::Stop => vec!["stop".to_string()],
            Self::Retag { id, tags } => ["retag".to_string(), id.clone()]
                .into_iter()
                .chain(tags.iter().cloned())
                .collect(),
        }
    }
}

/// The single point of contact with the tracker binary.
///
/// Only `run` is required; the typed helpers build argument lists through
/// [`TrackerCommand`] so fakes only need to understand raw arguments.
#[async_trait]
pub trait TrackerGateway: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<String, GatewayError>;

    async fn execute(&self, command: &TrackerCommand) -> Result<String, GatewayError> {
        self.run(&command.args()).await
    }

    async fn probe(&self) -> Result<String, GatewayError> {
        self.execute(&TrackerCommand::Probe).await
    }

    async fn export(&self) -> Result<String, GatewayError> {
        self.execute(&TrackerCommand::Export).await
    }

    async fn start(&self, tags: &[String]) -> Result<String, GatewayError> {
        self.execute(&TrackerCommand::Start {
            tags: tags.to_vec(),
        })
        .await
    }

    async fn stop(&self) -> Result<String, GatewayError> {
        self.execute(&TrackerCommand::Stop).await
    }

    async fn retag(&self, id: &str, tags: &[String]) -> Result<String, GatewayError> {
        self.execute(&TrackerCommand::Retag {
            id: id.to_string(),
            tags: tags.to_vec(),
        })
        .await
    }
}

#[derive(Debug, Clone)]
pub struct ProcessTrackerGateway {
    binary: PathBuf,
    timeout: Duration,
}

impl ProcessTrackerGateway {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    fn spawn_error(error: std::io::Error) -> GatewayError {
        match error.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => GatewayError::BinaryUnavailable,
            _ => GatewayError::Spawn(error.to_string()),
        }
    }
}

impl Default for ProcessTrackerGateway {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_BINARY)
    }
}

#[async_trait]
impl TrackerGateway for ProcessTrackerGateway {
    async fn run(&self, args: &[String]) -> Result<String, GatewayError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(Self::spawn_error)?;
        // Dropping the pending future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|error| GatewayError::Spawn(error.to_string()))?,
            Err(_) => {
                tracing::warn!(
                    binary = %self.binary.display(),
                    args = ?args,
                    timeout = ?self.timeout,
                    "tracker command timed out"
                );
                return Err(GatewayError::Timeout);
            }
        };

        if !output.status.success() {
            return Err(GatewayError::CommandFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|error| GatewayError::MalformedOutput(format!("stdout is not UTF-8: {error}")))
    }
}
