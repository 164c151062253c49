//! Supervisor behaviour against real child processes
//!
//! A shell script stands in for cloudflared: it reports its argv and token
//! file over stderr the way the connector reports its startup state.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::timeout;
use tuinnel_connector::{ConnectorProcess, SpawnOptions};

/// Write an executable stand-in script into `dir`
fn stub_binary(dir: &TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("cloudflared-stub");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Stand-in that reads its token file immediately, then reports argv and
/// token after a delay (so the test's subscriber is attached), then idles
/// until SIGTERM.
const REPORTING_STUB: &str = r#"
for a in "$@"; do last="$a"; done
tok=$(cat "$last" 2>/dev/null || echo MISSING)
sleep 1
echo "ARGS:$*" >&2
echo "TOKENFILE:$last" >&2
echo "TOKEN:$tok" >&2
trap 'exit 0' TERM
while :; do sleep 1; done
"#;

async fn collect_lines(process: &ConnectorProcess, want: usize) -> Vec<String> {
    let mut rx = process.subscribe_stderr();
    let mut lines = Vec::new();
    while lines.len() < want {
        let line = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("stderr line timed out")
            .expect("stderr channel closed");
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn argv_ordering_and_token_file_indirection() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, REPORTING_STUB);

    let process = ConnectorProcess::spawn(&stub, "s3cret-connector-token", &SpawnOptions::default())
        .await
        .unwrap();

    let lines = collect_lines(&process, 3).await;
    let args_line = lines.iter().find(|l| l.starts_with("ARGS:")).unwrap();
    let token_line = lines.iter().find(|l| l.starts_with("TOKEN:")).unwrap();

    // The token reaches the child through the file, never through argv
    assert_eq!(token_line, "TOKEN:s3cret-connector-token");
    assert!(!args_line.contains("s3cret-connector-token"));

    // Global flags precede `run`; --token-file follows it
    let run_pos = args_line.find(" run ").unwrap();
    assert!(args_line.find("--no-autoupdate").unwrap() < run_pos);
    assert!(args_line.find("--metrics").unwrap() < run_pos);
    assert!(args_line.find("--protocol quic").unwrap() < run_pos);
    assert!(args_line.find("--token-file").unwrap() > run_pos);

    process.kill().await;
}

#[tokio::test]
async fn secret_file_is_deleted_shortly_after_spawn() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, REPORTING_STUB);

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();

    let lines = collect_lines(&process, 3).await;
    let token_file = lines
        .iter()
        .find(|l| l.starts_with("TOKENFILE:"))
        .unwrap()
        .trim_start_matches("TOKENFILE:")
        .to_string();

    // The child read the token before deletion kicked in
    assert!(lines.iter().any(|l| l == "TOKEN:tok"));

    // Reporting happens ~1s after spawn; the 500ms linger has passed
    assert!(
        !std::path::Path::new(&token_file).exists(),
        "token file should be unlinked within 1s of spawn"
    );

    process.kill().await;
}

#[tokio::test]
async fn kill_is_graceful_when_the_child_honours_sigterm() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, "trap 'exit 0' TERM\nwhile :; do sleep 1; done\n");

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();
    // Give the shell a moment to install its trap
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    process.kill().await;
    assert!(process.has_exited());
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "graceful exit must not wait out the whole kill window"
    );
}

#[tokio::test]
async fn kill_escalates_to_sigkill_when_sigterm_is_ignored() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, "trap '' TERM\nwhile :; do sleep 1; done\n");

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    process.kill().await;
    assert!(process.has_exited());
}

#[tokio::test]
async fn natural_exit_code_is_observed() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, "exit 7\n");

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();

    let mut exit_rx = process.exit_watch();
    let info = timeout(Duration::from_secs(10), async {
        exit_rx.wait_for(|info| info.is_some()).await.unwrap().unwrap()
    })
    .await
    .unwrap();

    assert_eq!(info.code, Some(7));
}

#[tokio::test]
async fn kill_after_exit_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, "exit 0\n");

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();

    let mut exit_rx = process.exit_watch();
    timeout(Duration::from_secs(10), async {
        exit_rx.wait_for(|info| info.is_some()).await.unwrap();
    })
    .await
    .unwrap();

    let started = Instant::now();
    process.kill().await;
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn concurrent_kills_converge() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(&dir, "trap 'exit 0' TERM\nwhile :; do sleep 1; done\n");

    let process = ConnectorProcess::spawn(&stub, "tok", &SpawnOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::join!(process.kill(), process.kill());
    assert!(process.has_exited());
}

#[tokio::test]
async fn quick_tunnel_spawn_has_no_token_file() {
    let dir = TempDir::new().unwrap();
    let stub = stub_binary(
        &dir,
        "sleep 1\necho \"ARGS:$*\" >&2\ntrap 'exit 0' TERM\nwhile :; do sleep 1; done\n",
    );

    let process =
        ConnectorProcess::spawn_quick(&stub, "http://127.0.0.1:3000", &SpawnOptions::default())
            .await
            .unwrap();

    let lines = collect_lines(&process, 1).await;
    assert!(lines[0].contains("--url http://127.0.0.1:3000"));
    assert!(!lines[0].contains("--token-file"));
    assert!(!lines[0].contains(" run"));

    process.kill().await;
}

#[tokio::test]
async fn terminate_pid_reaps_a_detached_process() {
    // A process this supervisor did not spawn, as with registry adoption
    let mut child = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id().unwrap();
    let reaper = tokio::spawn(async move {
        let _ = child.wait().await;
    });

    assert!(tuinnel_connector::pid_is_alive(pid));
    assert!(tuinnel_connector::terminate_pid(pid).await);
    reaper.await.unwrap();

    assert!(!tuinnel_connector::pid_is_alive(pid));
    assert!(!tuinnel_connector::terminate_pid(4_000_000).await);
}
