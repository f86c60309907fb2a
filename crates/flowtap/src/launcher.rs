//! Helper launching
//!
//! The helper is the privileged half of the redirector. It is started with
//! the path of the tunnel socket and is expected to connect back to it.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Placeholder replaced with the socket path in helper arguments
pub const SOCKET_PLACEHOLDER: &str = "{socket}";

/// Helper launch errors
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no helper program configured")]
    NotConfigured,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("helper exited before connecting: {0}")]
    ExitedEarly(String),
}

/// Where the helper has to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperEndpoint {
    pub socket_path: PathBuf,
    pub session_id: String,
}

/// A launched helper
#[derive(Debug)]
pub enum HelperProcess {
    /// Separate OS process
    Child(Child),
    /// In-process task
    Task(JoinHandle<()>),
    /// Started by someone else; we only own the socket
    Attached,
}

impl HelperProcess {
    pub fn id(&self) -> Option<u32> {
        match self {
            HelperProcess::Child(child) => child.id(),
            _ => None,
        }
    }

    /// Exit description if the helper has already gone away
    pub fn try_exited(&mut self) -> Option<String> {
        match self {
            HelperProcess::Child(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(format!("wait failed: {}", e)),
            },
            HelperProcess::Task(task) => task.is_finished().then(|| "task finished".to_string()),
            HelperProcess::Attached => None,
        }
    }

    /// Stop the helper, waiting up to `grace` for it to exit on its own
    /// after the tunnel closed.
    pub async fn stop(&mut self, grace: Duration) {
        match self {
            HelperProcess::Child(child) => {
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => debug!("Helper exited: {}", status),
                    Ok(Err(e)) => warn!("Failed to wait for helper: {}", e),
                    Err(_) => {
                        info!("Helper did not exit in time, killing it");
                        if let Err(e) = child.kill().await {
                            warn!("Failed to kill helper: {}", e);
                        }
                    }
                }
            }
            HelperProcess::Task(task) => {
                if tokio::time::timeout(grace, &mut *task).await.is_err() {
                    task.abort();
                    debug!("Helper task aborted");
                }
            }
            HelperProcess::Attached => {}
        }
    }
}

/// Starts the helper for a session
#[async_trait]
pub trait HelperLauncher: Send + Sync {
    async fn launch(&self, endpoint: &HelperEndpoint) -> Result<HelperProcess, LaunchError>;
}

/// Spawns the helper program as a child process
///
/// Arguments containing `{socket}` get the socket path substituted; when no
/// argument does, the socket path is appended as the last argument. The
/// path and session id are also exported as `FLOWTAP_SOCKET` and
/// `FLOWTAP_SESSION`.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn command_args(&self, endpoint: &HelperEndpoint) -> Vec<String> {
        let socket = endpoint.socket_path.display().to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace(SOCKET_PLACEHOLDER, &socket))
            .collect();
        if !self.args.iter().any(|arg| arg.contains(SOCKET_PLACEHOLDER)) {
            args.push(socket);
        }
        args
    }
}

#[async_trait]
impl HelperLauncher for CommandLauncher {
    async fn launch(&self, endpoint: &HelperEndpoint) -> Result<HelperProcess, LaunchError> {
        let args = self.command_args(endpoint);
        info!(
            program = %self.program.display(),
            session = %endpoint.session_id,
            "Launching helper"
        );

        let child = Command::new(&self.program)
            .args(&args)
            .env("FLOWTAP_SOCKET", &endpoint.socket_path)
            .env("FLOWTAP_SESSION", &endpoint.session_id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        debug!(pid = ?child.id(), "Helper spawned");
        Ok(HelperProcess::Child(child))
    }
}

/// Runs the helper as a task inside this process
pub struct TaskLauncher<F> {
    spawn: F,
}

impl<F, Fut> TaskLauncher<F>
where
    F: Fn(HelperEndpoint) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(spawn: F) -> Self {
        Self { spawn }
    }
}

#[async_trait]
impl<F, Fut> HelperLauncher for TaskLauncher<F>
where
    F: Fn(HelperEndpoint) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn launch(&self, endpoint: &HelperEndpoint) -> Result<HelperProcess, LaunchError> {
        let task = tokio::spawn((self.spawn)(endpoint.clone()));
        Ok(HelperProcess::Task(task))
    }
}

/// For helpers started outside of flowtap that find the socket on their own
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachedLauncher;

#[async_trait]
impl HelperLauncher for AttachedLauncher {
    async fn launch(&self, endpoint: &HelperEndpoint) -> Result<HelperProcess, LaunchError> {
        info!(
            socket = %endpoint.socket_path.display(),
            "Waiting for an externally started helper"
        );
        Ok(HelperProcess::Attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> HelperEndpoint {
        HelperEndpoint {
            socket_path: PathBuf::from("/tmp/flowtap-test/tunnel.sock"),
            session_id: "01TEST".to_string(),
        }
    }

    #[test]
    fn test_socket_path_is_appended() {
        let launcher = CommandLauncher::new("helper").with_args(vec!["--verbose".to_string()]);
        assert_eq!(
            launcher.command_args(&endpoint()),
            vec!["--verbose", "/tmp/flowtap-test/tunnel.sock"]
        );
    }

    #[test]
    fn test_socket_placeholder_is_substituted() {
        let launcher = CommandLauncher::new("helper")
            .with_args(vec!["--socket={socket}".to_string(), "--once".to_string()]);
        assert_eq!(
            launcher.command_args(&endpoint()),
            vec!["--socket=/tmp/flowtap-test/tunnel.sock", "--once"]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let launcher = CommandLauncher::new("/nonexistent/flowtap-helper");
        let err = launcher.launch(&endpoint()).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_task_launcher_runs_helper_in_process() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let launcher = TaskLauncher::new(move |endpoint: HelperEndpoint| {
            let tx = tx.lock().unwrap().take();
            async move {
                if let Some(tx) = tx {
                    let _ = tx.send(endpoint.session_id);
                }
            }
        });

        let mut helper = launcher.launch(&endpoint()).await.unwrap();
        assert_eq!(rx.await.unwrap(), "01TEST");
        helper.stop(Duration::from_secs(1)).await;
        assert!(helper.try_exited().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_lingering_child() {
        let launcher = CommandLauncher::new("sh").with_args(vec![
            "-c".to_string(),
            "sleep 30".to_string(),
            "{socket}".to_string(),
        ]);
        let mut helper = launcher.launch(&endpoint()).await.unwrap();
        helper.stop(Duration::from_millis(100)).await;
        assert!(helper.try_exited().is_some());
    }
}
