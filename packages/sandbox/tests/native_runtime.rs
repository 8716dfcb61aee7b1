// ABOUTME: Integration tests for sandbox execution on the native process-group runtime
// ABOUTME: Covers streaming order, single terminal events, cancellation, timeouts and confinement

use futures::StreamExt;
use pretty_assertions::assert_eq;
use runhub_config::SandboxConfig;
use runhub_core::{OutputStream, ResourceLimits};
use runhub_sandbox::{
    CancelReason, ExecutionEvent, ExecutionHandle, NativeRuntime, SandboxError, SandboxExecutor,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn executor(root: &TempDir) -> SandboxExecutor {
    std::fs::create_dir_all(root.path().join("ws-1")).unwrap();
    let config = SandboxConfig {
        workspace_root: root.path().to_path_buf(),
        grace_period: Duration::from_secs(2),
        ..Default::default()
    };
    SandboxExecutor::new(Arc::new(NativeRuntime::new()), config).unwrap()
}

/// Drain a handle, returning (stdout, stderr, terminal events)
async fn collect(mut handle: ExecutionHandle) -> (String, String, Vec<ExecutionEvent>) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut terminals = Vec::new();

    while let Some(event) = handle.next().await {
        match event {
            ExecutionEvent::Output(chunk) => {
                assert!(terminals.is_empty(), "output after terminal event");
                match chunk.stream {
                    OutputStream::Stdout => stdout.push_str(&chunk.text()),
                    OutputStream::Stderr => stderr.push_str(&chunk.text()),
                }
            }
            terminal => terminals.push(terminal),
        }
    }
    (stdout, stderr, terminals)
}

#[tokio::test]
async fn test_echo_streams_output_then_exits() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);

    let handle = executor.run("echo hello", "ws-1", None).await.unwrap();
    let (stdout, stderr, terminals) = collect(handle).await;

    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "");
    assert_eq!(terminals, vec![ExecutionEvent::Exited { exit_code: 0 }]);
}

#[tokio::test]
async fn test_stderr_and_nonzero_exit() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);

    let handle = executor
        .run("echo oops >&2; exit 3", "ws-1", None)
        .await
        .unwrap();
    let (stdout, stderr, terminals) = collect(handle).await;

    assert_eq!(stdout, "");
    assert_eq!(stderr, "oops\n");
    assert_eq!(terminals, vec![ExecutionEvent::Exited { exit_code: 3 }]);
}

#[tokio::test]
async fn test_runs_in_working_dir() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);
    std::fs::write(root.path().join("ws-1/marker.txt"), "inside").unwrap();

    let handle = executor.run("cat marker.txt", "ws-1", None).await.unwrap();
    let (stdout, _, terminals) = collect(handle).await;

    assert_eq!(stdout, "inside");
    assert_eq!(terminals, vec![ExecutionEvent::Exited { exit_code: 0 }]);
}

#[tokio::test]
async fn test_cancel_stops_within_grace_period() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);

    let handle = executor.run("sleep 3", "ws-1", None).await.unwrap();
    let canceller = handle.canceller();
    let started = Instant::now();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel(CancelReason::Requested("user requested".to_string()));
    });

    let (stdout, _, terminals) = collect(handle).await;

    assert_eq!(stdout, "");
    assert_eq!(
        terminals,
        vec![ExecutionEvent::Cancelled {
            reason: CancelReason::Requested("user requested".to_string())
        }]
    );
    // 500ms delay plus at most the 2s grace period
    assert!(started.elapsed() < Duration::from_millis(2900));
}

#[tokio::test]
async fn test_cancel_kills_process_ignoring_sigterm() {
    let root = TempDir::new().unwrap();
    let config = SandboxConfig {
        workspace_root: root.path().to_path_buf(),
        grace_period: Duration::from_millis(300),
        ..Default::default()
    };
    let executor = SandboxExecutor::new(Arc::new(NativeRuntime::new()), config).unwrap();

    let handle = executor
        .run("trap '' TERM; sleep 5", ".", None)
        .await
        .unwrap();
    handle.cancel(CancelReason::Requested("stop".to_string()));
    let started = Instant::now();

    let (_, _, terminals) = collect(handle).await;

    assert_eq!(terminals.len(), 1);
    assert!(matches!(terminals[0], ExecutionEvent::Cancelled { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_timeout_cancels_execution() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);
    let limits = ResourceLimits {
        timeout_seconds: 1,
        ..Default::default()
    };

    let handle = executor.run("sleep 5", "ws-1", Some(limits)).await.unwrap();
    let (_, _, terminals) = collect(handle).await;

    assert_eq!(
        terminals,
        vec![ExecutionEvent::Cancelled {
            reason: CancelReason::Timeout { seconds: 1 }
        }]
    );
}

#[tokio::test]
async fn test_environment_is_cleared() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);
    std::env::set_var("RUNHUB_TEST_SECRET", "leaked");

    let handle = executor
        .run("echo \"[$RUNHUB_TEST_SECRET]\"", "ws-1", None)
        .await
        .unwrap();
    let (stdout, _, _) = collect(handle).await;

    assert_eq!(stdout, "[]\n");
}

#[tokio::test]
async fn test_working_dir_escape_rejected() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);

    for dir in ["../", "/tmp", "ws-1/../../"] {
        let result = executor.run("echo hi", dir, None).await;
        assert!(
            matches!(result, Err(SandboxError::WorkspaceError(_))),
            "{} should be rejected",
            dir
        );
    }
}

#[tokio::test]
async fn test_dropping_handle_tears_down_process() {
    let root = TempDir::new().unwrap();
    let executor = executor(&root);
    let marker = root.path().join("ws-1/finished");

    let handle = executor
        .run("sleep 1 && touch finished", "ws-1", None)
        .await
        .unwrap();
    drop(handle);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "process kept running after handle drop");
}

#[tokio::test]
#[ignore] // Requires Docker daemon
async fn test_docker_runtime_denies_network() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("ws-1")).unwrap();
    let config = SandboxConfig {
        workspace_root: root.path().to_path_buf(),
        ..Default::default()
    };
    let runtime = runhub_sandbox::DockerRuntime::new(&config).unwrap();
    let executor = SandboxExecutor::new(Arc::new(runtime), config).unwrap();

    let handle = executor
        .run("wget -q -T 2 -O- http://1.1.1.1 || echo offline", "ws-1", None)
        .await
        .unwrap();
    let (stdout, _, terminals) = collect(handle).await;

    assert!(stdout.contains("offline"));
    assert_eq!(terminals, vec![ExecutionEvent::Exited { exit_code: 0 }]);
}
