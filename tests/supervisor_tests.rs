//! Integration tests for the supervisor, driven by small shell scripts
#![cfg(unix)]

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use terra_panel::logs::{BroadcasterOptions, LogLine, LogStream, Subscription};
use terra_panel::process::{ExitState, LaunchConfig};
use terra_panel::supervisor::{Supervisor, SupervisorOptions, SupervisorState, SupervisorStatus};
use terra_panel::SupervisorError;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn shell(script: &str) -> LaunchConfig {
    LaunchConfig::new("/bin/sh").with_arg("-c").with_arg(script)
}

fn quick_options() -> SupervisorOptions {
    SupervisorOptions::default()
        .with_stop_timeout(Duration::from_secs(2))
        .with_kill_timeout(Duration::from_secs(2))
}

fn supervisor(script: &str) -> Supervisor {
    Supervisor::new(shell(script), quick_options())
}

async fn wait_for_state(supervisor: &Supervisor, state: SupervisorState) -> SupervisorStatus {
    let mut watch = supervisor.watch_status();
    timeout(WAIT, async {
        loop {
            let status = watch.current();
            if status.state == state {
                return status;
            }
            if watch.changed().await.is_none() {
                panic!("supervisor dropped");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
}

async fn next_line(subscription: &mut Subscription) -> Arc<LogLine> {
    timeout(WAIT, subscription.recv())
        .await
        .expect("timed out waiting for a log line")
        .expect("subscription ended")
}

async fn wait_for_text(subscription: &mut Subscription, text: &str) -> Arc<LogLine> {
    loop {
        let line = next_line(subscription).await;
        if line.text == text {
            return line;
        }
    }
}

#[tokio::test]
async fn test_start_reports_running_with_pid() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");

    supervisor.start().await?;

    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Running);
    assert!(status.pid.unwrap_or(0) > 0);
    assert_eq!(status.run_id, 1);
    assert!(status.uptime.is_some());

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_start_twice_is_rejected() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");
    supervisor.start().await?;

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning));
    assert_eq!(err.as_label(), "already_running");

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stop_when_stopped_is_rejected() {
    let supervisor = supervisor("exec sleep 30");

    let err = supervisor.stop().await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning));
    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
}

#[tokio::test]
async fn test_stop_without_stop_command_sends_sigterm() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");
    supervisor.start().await?;

    timeout(WAIT, supervisor.stop()).await??;

    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.last_exit, Some(ExitState::Crashed { signal: Some(15) }));
    // A requested stop is not a crash
    assert_eq!(status.last_error, None);
    Ok(())
}

#[tokio::test]
async fn test_stop_command_gives_graceful_exit() -> Result<()> {
    let options = quick_options()
        .with_stop_command("quit")
        .with_stop_timeout(Duration::from_secs(5));
    let supervisor = Supervisor::new(
        shell(r#"while IFS= read -r line; do [ "$line" = quit ] && exit 0; done"#),
        options,
    );
    supervisor.start().await?;

    let started = Instant::now();
    timeout(WAIT, supervisor.stop()).await??;

    assert!(started.elapsed() < Duration::from_secs(4));
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.last_exit, Some(ExitState::Exited(0)));
    Ok(())
}

#[tokio::test]
async fn test_stop_escalates_to_kill() -> Result<()> {
    let options = quick_options().with_stop_timeout(Duration::from_millis(300));
    let supervisor = Supervisor::new(
        shell("trap '' TERM; echo ready; while true; do sleep 0.1; done"),
        options,
    );
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;
    wait_for_text(&mut logs, "ready").await;

    let started = Instant::now();
    timeout(WAIT, supervisor.stop()).await??;

    assert!(started.elapsed() < Duration::from_secs(3));
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.last_exit, Some(ExitState::Crashed { signal: Some(9) }));
    Ok(())
}

#[tokio::test]
async fn test_start_while_stopping_is_rejected() -> Result<()> {
    let options = quick_options().with_stop_timeout(Duration::from_secs(2));
    let supervisor = Supervisor::new(
        shell("trap '' TERM; echo ready; while true; do sleep 0.1; done"),
        options,
    );
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;
    wait_for_text(&mut logs, "ready").await;

    let stopping = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.stop().await })
    };
    wait_for_state(&supervisor, SupervisorState::Stopping).await;

    // Rejected at once, not queued behind the stop
    let started = Instant::now();
    let err = timeout(Duration::from_millis(500), supervisor.start())
        .await?
        .unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning));
    assert!(started.elapsed() < Duration::from_millis(500));

    timeout(WAIT, stopping).await???;
    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.run_id, 1);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_stops_all_succeed() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");
    supervisor.start().await?;

    let (a, b, c) = timeout(
        WAIT,
        async { tokio::join!(supervisor.stop(), supervisor.stop(), supervisor.stop()) },
    )
    .await?;

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert!(c.is_ok());
    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_starts_spawn_once() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");

    let (a, b, c) = tokio::join!(supervisor.start(), supervisor.start(), supervisor.start());
    let results = [a, b, c];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(err, SupervisorError::AlreadyRunning));
    }
    assert_eq!(supervisor.status().run_id, 1);

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_external_kill_is_detected_as_crash() -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let supervisor = supervisor("exec sleep 30");
    supervisor.start().await?;
    let pid = supervisor.status().pid.expect("pid while running");

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL)?;

    let status = wait_for_state(&supervisor, SupervisorState::Stopped).await;
    assert_eq!(status.last_exit, Some(ExitState::Crashed { signal: Some(9) }));
    let error = status.last_error.expect("crash recorded");
    assert!(error.contains("terminated unexpectedly"), "{}", error);

    // Stopping after a crash is rejected, starting again works
    assert!(matches!(
        supervisor.stop().await,
        Err(SupervisorError::NotRunning)
    ));
    supervisor.start().await?;
    assert_eq!(supervisor.status().run_id, 2);
    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_nonzero_exit_is_a_crash() {
    let supervisor = supervisor("exit 3");
    supervisor.start().await.unwrap();

    let status = wait_for_state(&supervisor, SupervisorState::Stopped).await;
    assert_eq!(status.last_exit, Some(ExitState::Exited(3)));
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_clean_exit_records_no_error() {
    let supervisor = supervisor("exit 0");
    supervisor.start().await.unwrap();

    let status = wait_for_state(&supervisor, SupervisorState::Stopped).await;
    assert_eq!(status.last_exit, Some(ExitState::Exited(0)));
    assert_eq!(status.last_error, None);
}

#[tokio::test]
async fn test_missing_executable_is_spawn_error() {
    let supervisor = Supervisor::new(
        LaunchConfig::new("/nonexistent/terra-panel-test-server"),
        quick_options(),
    );

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, SupervisorError::SpawnError { .. }));

    let status = supervisor.status();
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(status.pid, None);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn test_missing_working_dir_is_spawn_error() {
    let supervisor = Supervisor::new(
        shell("exec sleep 30").with_working_dir("/nonexistent/terra-panel-dir"),
        quick_options(),
    );

    let err = supervisor.start().await.unwrap_err();
    assert_eq!(err.as_label(), "spawn_error");
    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
}

#[tokio::test]
async fn test_commands_arrive_in_order() -> Result<()> {
    let supervisor = supervisor(r#"while IFS= read -r line; do echo "got:$line"; done"#);
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;

    for i in 0..20 {
        supervisor.send_command(format!("cmd {}", i)).await;
    }

    for i in 0..20 {
        let line = next_line(&mut logs).await;
        assert_eq!(line.text, format!("got:cmd {}", i));
        assert_eq!(line.stream, LogStream::Stdout);
    }

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_senders_keep_their_own_order() -> Result<()> {
    let supervisor = supervisor(r#"while IFS= read -r line; do echo "$line"; done"#);
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;

    let mut tasks = Vec::new();
    for sender in 0..3 {
        let supervisor = supervisor.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                supervisor.send_command(format!("{}:{}", sender, i)).await;
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    let mut seen = vec![Vec::new(); 3];
    for _ in 0..30 {
        let line = next_line(&mut logs).await;
        let (sender, i) = line.text.split_once(':').expect("sender:index");
        seen[sender.parse::<usize>()?].push(i.parse::<u32>()?);
    }
    for order in seen {
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_closed_stdin_is_handled_as_crash() -> Result<()> {
    let supervisor = supervisor("exec 0<&-; echo ready; exec sleep 30");
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;
    wait_for_text(&mut logs, "ready").await;

    supervisor.send_command("hello").await;

    let status = wait_for_state(&supervisor, SupervisorState::Stopped).await;
    assert_eq!(status.last_exit, Some(ExitState::Crashed { signal: Some(9) }));
    let error = status.last_error.expect("crash recorded");
    assert!(error.contains("terminated unexpectedly"), "{}", error);
    Ok(())
}

#[tokio::test]
async fn test_send_command_while_stopped_is_ignored() {
    let supervisor = supervisor("cat");

    supervisor.send_command("say hi").await;

    assert_eq!(supervisor.status().state, SupervisorState::Stopped);
    assert_eq!(supervisor.broadcaster().last_sequence(), None);
}

#[tokio::test]
async fn test_late_subscriber_gets_replay_then_live() -> Result<()> {
    let supervisor = supervisor(r#"echo one; echo two; read x; echo "three:$x"; sleep 30"#);
    let mut early = supervisor.subscribe();
    supervisor.start().await?;
    wait_for_text(&mut early, "two").await;

    let mut late = supervisor.subscribe();
    assert_eq!(late.replay_len(), 2);
    supervisor.send_command("go").await;

    let lines = [
        next_line(&mut late).await,
        next_line(&mut late).await,
        next_line(&mut late).await,
    ];
    let texts: Vec<&str> = lines.iter().map(|l| l.text.as_str()).collect();
    assert_eq!(texts, ["one", "two", "three:go"]);
    assert_eq!(lines[1].seq, lines[0].seq + 1);
    assert_eq!(lines[2].seq, lines[1].seq + 1);

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_stderr_is_captured() -> Result<()> {
    let supervisor = supervisor("echo oops 1>&2; sleep 30");
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;

    let line = next_line(&mut logs).await;
    assert_eq!(line.text, "oops");
    assert_eq!(line.stream, LogStream::Stderr);

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_prompt_without_newline_is_flushed() -> Result<()> {
    let options = quick_options().with_broadcaster(BroadcasterOptions {
        partial_flush: Duration::from_millis(100),
        ..BroadcasterOptions::default()
    });
    let supervisor = Supervisor::new(
        shell(r#"printf 'prompt> '; read x; echo "after:$x"; sleep 30"#),
        options,
    );
    let mut logs = supervisor.subscribe();
    supervisor.start().await?;

    assert_eq!(next_line(&mut logs).await.text, "prompt> ");

    supervisor.send_command("x").await;
    assert_eq!(next_line(&mut logs).await.text, "after:x");

    supervisor.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_sequence_continues_across_restarts() -> Result<()> {
    let supervisor = supervisor("echo hello; sleep 30");
    let mut logs = supervisor.subscribe();

    supervisor.start().await?;
    let first = wait_for_text(&mut logs, "hello").await;
    supervisor.stop().await?;

    supervisor.start().await?;
    let second = wait_for_text(&mut logs, "hello").await;
    supervisor.stop().await?;

    assert!(second.seq > first.seq);
    assert_eq!(supervisor.status().run_id, 2);
    Ok(())
}

#[tokio::test]
async fn test_status_watch_sees_transitions() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");
    let mut watch = supervisor.watch_status();

    supervisor.start().await?;
    let mut states = Vec::new();
    while let Ok(Some(status)) = timeout(Duration::from_millis(200), watch.changed()).await {
        states.push(status.state);
    }
    assert_eq!(states.last(), Some(&SupervisorState::Running));

    supervisor.stop().await?;
    let status = timeout(WAIT, watch.changed()).await?.expect("supervisor alive");
    assert_eq!(status.state, SupervisorState::Stopped);
    assert_eq!(watch.current().pid, None);
    Ok(())
}

#[tokio::test]
async fn test_system_stats_follow_the_process() -> Result<()> {
    let supervisor = supervisor("exec sleep 30");

    let idle = supervisor.system_stats().await;
    assert!(!idle.running);
    assert_eq!(idle.pid, None);
    assert_eq!(idle.memory_bytes, 0);

    supervisor.start().await?;
    let pid = supervisor.status().pid;
    let busy = supervisor.system_stats().await;
    assert!(busy.running);
    assert_eq!(busy.pid, pid);
    assert!(busy.host_memory_total > 0);

    supervisor.stop().await?;
    Ok(())
}
