//! Spawning and supervising cloudflared child processes
//!
//! The connector token never appears in argv: it is written to a 0600 temp
//! file referenced via `--token-file`, and the file is unlinked 500ms after
//! the spawn (or on child exit, whichever comes first).

use crate::error::ConnectorError;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

/// Grace window between SIGTERM and SIGKILL
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long the token file survives after the spawn
const SECRET_FILE_LINGER: Duration = Duration::from_millis(500);

/// Capacity of the stderr fan-out channel
const STDERR_CHANNEL_CAPACITY: usize = 256;

/// Options for spawning a connector
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub metrics_addr: String,
    pub loglevel: String,
    pub protocol: String,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            metrics_addr: "127.0.0.1:0".to_string(),
            loglevel: "info".to_string(),
            protocol: "quic".to_string(),
        }
    }
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when the child died to a signal
    pub code: Option<i32>,
}

/// A supervised cloudflared child
///
/// The child is intentionally not killed on drop: non-interactive commands
/// leave the connector running and a later invocation adopts it through the
/// pid registry.
#[derive(Debug)]
pub struct ConnectorProcess {
    pid: u32,
    stderr_tx: broadcast::Sender<String>,
    /// Receiver opened before the reader task starts, so the first
    /// subscriber sees every line from the very beginning of the child's
    /// output
    initial_stderr_rx: std::sync::Mutex<Option<broadcast::Receiver<String>>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_lock: Arc<Mutex<()>>,
}

impl ConnectorProcess {
    /// Spawn a named-tunnel connector authenticated by `token`
    pub async fn spawn(
        binary: &Path,
        token: &str,
        opts: &SpawnOptions,
    ) -> Result<Self, ConnectorError> {
        let token_file = write_token_file(token)?;
        let args = build_run_args(opts, &token_file);
        Self::spawn_with_args(binary, args, Some(token_file)).await
    }

    /// Spawn an ephemeral quick tunnel pointing at `origin_url`; the public
    /// hostname arrives on stderr and is pulled out by the log parser
    pub async fn spawn_quick(
        binary: &Path,
        origin_url: &str,
        opts: &SpawnOptions,
    ) -> Result<Self, ConnectorError> {
        let args = build_quick_args(opts, origin_url);
        Self::spawn_with_args(binary, args, None).await
    }

    async fn spawn_with_args(
        binary: &Path,
        args: Vec<String>,
        token_file: Option<TempPath>,
    ) -> Result<Self, ConnectorError> {
        let mut child = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(ConnectorError::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            ConnectorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "child exited before its pid was read",
            ))
        })?;
        debug!("spawned cloudflared pid {}", pid);

        let (stderr_tx, initial_stderr_rx) = broadcast::channel(STDERR_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        // stderr fan-out; stream errors are swallowed so a broken pipe
        // cannot take the supervisor down
        if let Some(stderr) = child.stderr.take() {
            let tx = stderr_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let _ = tx.send(line);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            debug!("stderr stream error: {}", err);
                            break;
                        }
                    }
                }
            });
        }

        // stdout is piped but unused; drain it so the child never blocks
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(_)) = lines.next_line().await {}
            });
        }

        // The token file is deleted 500ms after spawn or on child exit,
        // whichever happens first
        let secret = Arc::new(std::sync::Mutex::new(token_file));
        if secret.lock().unwrap().is_some() {
            let secret = Arc::clone(&secret);
            tokio::spawn(async move {
                tokio::time::sleep(SECRET_FILE_LINGER).await;
                drop(secret.lock().unwrap().take());
            });
        }

        // One-shot exit observation: both kill() and a natural exit converge
        // on this watch value
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo {
                    code: status.code(),
                },
                Err(err) => {
                    warn!("wait on cloudflared pid {} failed: {}", pid, err);
                    ExitInfo { code: None }
                }
            };
            debug!("cloudflared pid {} exited: {:?}", pid, info.code);
            drop(secret.lock().unwrap().take());
            let _ = exit_tx.send(Some(info));
        });

        Ok(Self {
            pid,
            stderr_tx,
            initial_stderr_rx: std::sync::Mutex::new(Some(initial_stderr_rx)),
            exit_rx,
            kill_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Subscribe to the child's stderr lines. The first subscriber receives
    /// lines buffered since the spawn; later subscribers see lines from
    /// their point of subscription on.
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        if let Some(rx) = self.initial_stderr_rx.lock().unwrap().take() {
            return rx;
        }
        self.stderr_tx.subscribe()
    }

    /// A watch that resolves once the child has exited
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// SIGTERM, wait up to 5s, SIGKILL.
    ///
    /// A no-op on an already-exited child; concurrent callers serialise on
    /// the kill lock so the child is never double-signalled.
    pub async fn kill(&self) {
        let _guard = self.kill_lock.lock().await;
        let mut exit_rx = self.exit_rx.clone();
        if exit_rx.borrow().is_some() {
            return;
        }

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            // ESRCH: the child beat us to the exit
            debug!("SIGTERM to {} failed: {}", self.pid, err);
        }

        let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
            let _ = exit_rx.wait_for(|info| info.is_some()).await;
        })
        .await;

        if graceful.is_err() {
            warn!(
                "cloudflared pid {} did not exit within {:?}, sending SIGKILL",
                self.pid, SHUTDOWN_GRACE
            );
            let _ = kill(pid, Signal::SIGKILL);
            let _ = exit_rx.wait_for(|info| info.is_some()).await;
        }
    }
}

/// Write the connector token to a fresh 0600 file in the OS temp directory.
/// Failure aborts the spawn.
fn write_token_file(token: &str) -> Result<TempPath, ConnectorError> {
    use std::io::Write;

    let mut file = tempfile::Builder::new()
        .prefix(".tuinnel-token-")
        .tempfile()
        .map_err(ConnectorError::SecretFile)?;
    file.write_all(token.as_bytes())
        .map_err(ConnectorError::SecretFile)?;
    file.flush().map_err(ConnectorError::SecretFile)?;
    Ok(file.into_temp_path())
}

/// Argument ordering is part of the contract: global flags precede the
/// subcommand, subcommand flags follow it.
fn build_run_args(opts: &SpawnOptions, token_file: &Path) -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--config".to_string(),
        "/dev/null".to_string(),
        "--no-autoupdate".to_string(),
        "--metrics".to_string(),
        opts.metrics_addr.clone(),
        "--loglevel".to_string(),
        opts.loglevel.clone(),
        "--protocol".to_string(),
        opts.protocol.clone(),
        "run".to_string(),
        "--token-file".to_string(),
        token_file.display().to_string(),
    ]
}

/// Quick tunnels take the origin inline and need no credentials
fn build_quick_args(opts: &SpawnOptions, origin_url: &str) -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--config".to_string(),
        "/dev/null".to_string(),
        "--no-autoupdate".to_string(),
        "--metrics".to_string(),
        opts.metrics_addr.clone(),
        "--loglevel".to_string(),
        opts.loglevel.clone(),
        "--url".to_string(),
        origin_url.to_string(),
    ]
}

/// Is the process alive? The null signal probes without delivering.
pub fn pid_is_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// TERM -> grace -> KILL ladder for a connector this process did not spawn
/// (adopted from the pid registry). Returns false when the pid was already
/// gone.
pub async fn terminate_pid(pid: u32) -> bool {
    let target = Pid::from_raw(pid as i32);
    if kill(target, None).is_err() {
        return false;
    }

    let _ = kill(target, Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while tokio::time::Instant::now() < deadline {
        if kill(target, None).is_err() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!("pid {} survived SIGTERM, sending SIGKILL", pid);
    let _ = kill(target, Signal::SIGKILL);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_args_keep_global_flags_before_the_subcommand() {
        let opts = SpawnOptions::default();
        let args = build_run_args(&opts, Path::new("/tmp/.tuinnel-token-x"));

        let run_pos = args.iter().position(|a| a == "run").unwrap();
        let token_file_pos = args.iter().position(|a| a == "--token-file").unwrap();
        assert!(token_file_pos > run_pos, "--token-file must follow run");

        for flag in ["--config", "--no-autoupdate", "--metrics", "--loglevel", "--protocol"] {
            let pos = args.iter().position(|a| a == flag).unwrap();
            assert!(pos < run_pos, "{flag} must precede run");
        }

        assert_eq!(args[0], "tunnel");
        assert_eq!(args[args.len() - 2], "--token-file");
    }

    #[test]
    fn run_args_reflect_options() {
        let opts = SpawnOptions {
            metrics_addr: "127.0.0.1:9400".to_string(),
            loglevel: "debug".to_string(),
            protocol: "http2".to_string(),
        };
        let args = build_run_args(&opts, Path::new("/tmp/t"));
        assert!(args.windows(2).any(|w| w == ["--metrics", "127.0.0.1:9400"]));
        assert!(args.windows(2).any(|w| w == ["--loglevel", "debug"]));
        assert!(args.windows(2).any(|w| w == ["--protocol", "http2"]));
    }

    #[test]
    fn quick_args_have_no_token_and_no_run_subcommand() {
        let args = build_quick_args(&SpawnOptions::default(), "http://127.0.0.1:3000");
        assert!(!args.iter().any(|a| a == "run"));
        assert!(!args.iter().any(|a| a == "--token-file"));
        assert!(args
            .windows(2)
            .any(|w| w == ["--url", "http://127.0.0.1:3000"]));
    }

    #[test]
    fn token_file_is_owner_read_write_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = write_token_file("secret-token").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret-token");
    }

    #[test]
    fn liveness_probe_sees_our_own_process() {
        assert!(pid_is_alive(std::process::id()));
        // pid 0 would signal our own process group; use an absurd pid instead
        assert!(!pid_is_alive(4_000_000));
    }
}
