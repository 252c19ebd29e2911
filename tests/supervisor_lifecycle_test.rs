use shepherd::config::{MemoryLimit, ProcessConfig, Registry, SupervisorSettings};
use shepherd::error::ShepherdError;
use shepherd::process::{ProcessState, ProcessStatus, Supervisor};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;

fn create_test_settings(dir: &TempDir) -> SupervisorSettings {
    SupervisorSettings {
        log_dir: dir.path().join("logs"),
        kill_timeout_ms: 500,
        memory_check_interval_ms: 100,
        restart_delay_ms: 50,
        max_restart_delay_ms: 400,
        ..SupervisorSettings::default()
    }
}

fn sh(name: &str, script: &str) -> ProcessConfig {
    let mut config = ProcessConfig::new(name, "/bin/sh");
    config.arguments = vec!["-c".to_string(), script.to_string()];
    config
}

fn supervisor(dir: &TempDir, settings: SupervisorSettings, configs: Vec<ProcessConfig>) -> Supervisor {
    let registry = Registry::from_configs(settings, configs, dir.path()).unwrap();
    Supervisor::new(registry)
}

async fn wait_for<F>(supervisor: &Supervisor, name: &str, timeout: Duration, mut done: F) -> ProcessStatus
where
    F: FnMut(&ProcessStatus) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let status = supervisor.status(name).await.unwrap();
        if done(&status) {
            return status;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting on {}: {:?}", name, status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_start_all_runs_every_process() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(
        &dir,
        create_test_settings(&dir),
        vec![sh("a", "sleep 30"), sh("b", "sleep 30")],
    );

    let statuses = sup.start_all().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].name, "a");
    assert_eq!(statuses[1].name, "b");
    for status in &statuses {
        assert_eq!(status.state, ProcessState::Running);
        assert!(status.pid.is_some());
        assert_eq!(status.restart_count, 0);
    }

    let statuses = sup.shutdown().await;
    assert!(statuses.iter().all(|s| s.state == ProcessState::Stopped));
}

#[tokio::test]
async fn test_exit_without_autorestart_stays_stopped() {
    let dir = TempDir::new().unwrap();
    let mut config = sh("once", "exit 1");
    config.autorestart = false;
    let sup = supervisor(&dir, create_test_settings(&dir), vec![config]);

    sup.start_all().await;
    let status = wait_for(&sup, "once", Duration::from_secs(5), |s| {
        s.state == ProcessState::Stopped && s.last_exited_at.is_some()
    })
    .await;

    assert_eq!(status.restart_count, 0);
    assert_eq!(status.last_exit_code, Some(1));
    assert_eq!(status.pid, None);

    // Nothing comes back on its own
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = sup.status("once").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restart_count, 0);
}

#[tokio::test]
async fn test_crash_loop_backs_off() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(&dir, create_test_settings(&dir), vec![sh("flaky", "exit 3")]);

    sup.start_all().await;

    // Collect the start time of every life
    let mut starts: Vec<SystemTime> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while starts.len() < 6 && Instant::now() < deadline {
        let status = sup.status("flaky").await.unwrap();
        if let Some(started) = status.last_started_at {
            if starts.last() != Some(&started) {
                starts.push(started);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(starts.len() >= 6, "only saw {} lives", starts.len());

    let gaps: Vec<Duration> = starts
        .windows(2)
        .map(|w| w[1].duration_since(w[0]).unwrap())
        .collect();
    for pair in gaps.windows(2) {
        // Allow scheduling jitter, but the delay must not shrink
        assert!(
            pair[1] + Duration::from_millis(40) >= pair[0],
            "gaps shrank: {:?}",
            gaps
        );
    }
    assert!(*gaps.last().unwrap() < Duration::from_millis(1000));

    let status = sup.status("flaky").await.unwrap();
    assert!(status.restart_count >= 5);
    assert_eq!(status.last_exit_code, Some(3));

    sup.shutdown().await;
}

#[tokio::test]
async fn test_stop_cancels_pending_restart() {
    let dir = TempDir::new().unwrap();
    let mut settings = create_test_settings(&dir);
    settings.restart_delay_ms = 1000;
    settings.max_restart_delay_ms = 1000;
    let sup = supervisor(&dir, settings, vec![sh("crasher", "exit 1")]);

    sup.start_all().await;
    wait_for(&sup, "crasher", Duration::from_secs(5), |s| {
        s.state == ProcessState::RestartBackoff
    })
    .await;

    let status = sup.stop("crasher").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);

    tokio::time::sleep(Duration::from_millis(1300)).await;
    let status = sup.status("crasher").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restart_count, 0);
}

#[tokio::test]
async fn test_manual_stop_skips_restart_policy() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(&dir, create_test_settings(&dir), vec![sh("server", "sleep 30")]);

    sup.start_all().await;
    let status = sup.stop("server").await.unwrap();

    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.last_signal, Some(15));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = sup.status("server").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.restart_count, 0);

    // Stopping again is harmless
    let status = sup.stop("server").await.unwrap();
    assert_eq!(status.state, ProcessState::Stopped);
}

#[tokio::test]
async fn test_restart_relaunches_without_counting() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(&dir, create_test_settings(&dir), vec![sh("server", "sleep 30")]);

    let first = sup.start_all().await.remove(0);
    let second = sup.restart("server").await.unwrap();

    assert_eq!(second.state, ProcessState::Running);
    assert_ne!(first.pid, second.pid);
    assert_eq!(second.restart_count, 0);
    assert_eq!(second.last_signal, Some(15));

    sup.shutdown().await;
}

#[tokio::test]
async fn test_start_resets_restart_count() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(&dir, create_test_settings(&dir), vec![sh("flaky", "sleep 0.05; exit 1")]);

    sup.start_all().await;
    wait_for(&sup, "flaky", Duration::from_secs(5), |s| s.restart_count >= 2).await;

    let stopped = sup.stop("flaky").await.unwrap();
    assert_eq!(stopped.state, ProcessState::Stopped);
    assert!(stopped.restart_count >= 2);

    let started = sup.start("flaky").await.unwrap();
    assert_eq!(started.restart_count, 0);

    sup.shutdown().await;
}

#[tokio::test]
async fn test_memory_breach_restarts_even_without_autorestart() {
    let dir = TempDir::new().unwrap();
    let mut config = sh("hog", "sleep 30");
    config.autorestart = false;
    // Far below what any real process uses
    config.max_memory_bytes = Some(MemoryLimit::Text("1K".to_string()));
    let sup = supervisor(&dir, create_test_settings(&dir), vec![config]);

    sup.start_all().await;
    let status = wait_for(&sup, "hog", Duration::from_secs(10), |s| s.restart_count >= 1).await;

    assert_eq!(status.last_signal, Some(15));
    assert!(status.memory_usage_bytes.unwrap_or(0) > 1024);

    sup.shutdown().await;
}

#[tokio::test]
async fn test_launch_failure_goes_through_policy() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("not-executable.sh");
    std::fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();

    let mut config = ProcessConfig::new("broken", script.to_str().unwrap());
    config.autorestart = false;
    let sup = supervisor(&dir, create_test_settings(&dir), vec![config]);

    let status = sup.start_all().await.remove(0);
    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.pid, None);
    assert_eq!(status.last_exit_code, None);
    assert_eq!(status.last_signal, None);
    assert!(status.last_exited_at.is_some());
}

#[tokio::test]
async fn test_unknown_process() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(&dir, create_test_settings(&dir), vec![sh("real", "sleep 30")]);

    match sup.status("ghost").await {
        Err(ShepherdError::UnknownProcess(name)) => assert_eq!(name, "ghost"),
        other => panic!("expected UnknownProcess, got {:?}", other),
    }
    assert!(matches!(
        sup.stop("ghost").await,
        Err(ShepherdError::UnknownProcess(_))
    ));
    assert!(matches!(
        sup.restart("ghost").await,
        Err(ShepherdError::UnknownProcess(_))
    ));
}

#[tokio::test]
async fn test_list_before_start() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor(
        &dir,
        create_test_settings(&dir),
        vec![sh("one", "sleep 30"), sh("two", "sleep 30")],
    );

    let list = sup.list().await;
    let names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["one", "two"]);
    assert!(list.iter().all(|s| s.state == ProcessState::Stopped && s.pid.is_none()));
}

#[tokio::test]
async fn test_watch_restarts_on_file_change() {
    let dir = TempDir::new().unwrap();
    let app_dir = dir.path().join("app");
    std::fs::create_dir(&app_dir).unwrap();

    let mut config = sh("watched", "sleep 30");
    config.working_directory = Some(app_dir.clone());
    config.watch_enabled = true;
    let sup = supervisor(&dir, create_test_settings(&dir), vec![config]);

    let first = sup.start_all().await.remove(0);
    // Let the debounce window after start pass
    tokio::time::sleep(Duration::from_millis(700)).await;

    std::fs::write(app_dir.join("main.py"), "print('v2')\n").unwrap();

    let status = wait_for(&sup, "watched", Duration::from_secs(10), |s| {
        s.state == ProcessState::Running && s.pid.is_some() && s.pid != first.pid
    })
    .await;
    assert_eq!(status.restart_count, 0);

    sup.shutdown().await;
}

#[tokio::test]
async fn test_exit_reported_while_descendant_holds_output() {
    let dir = TempDir::new().unwrap();
    let mut settings = create_test_settings(&dir);
    settings.kill_timeout_ms = 3000;
    // The background sleep inherits stdout and stderr and outlives its parent
    let mut config = sh("parent", "sleep 10 & exit 1");
    config.autorestart = false;
    let sup = supervisor(&dir, settings, vec![config]);

    sup.start_all().await;
    let status = wait_for(&sup, "parent", Duration::from_secs(1), |s| {
        s.state != ProcessState::Running
    })
    .await;

    assert_eq!(status.state, ProcessState::Stopped);
    assert_eq!(status.last_exit_code, Some(1));
    assert_eq!(status.pid, None);
}

#[tokio::test]
async fn test_relaunch_waits_for_previous_output() {
    let dir = TempDir::new().unwrap();
    let mut settings = create_test_settings(&dir);
    settings.kill_timeout_ms = 1000;
    let sup = supervisor(&dir, settings, vec![sh("parent", "sleep 5 & exit 1")]);

    let first = sup.start_all().await.remove(0);
    let first_started = first.last_started_at.unwrap();

    // The exit shows up right away, long before the pipe gives up
    let exited = wait_for(&sup, "parent", Duration::from_millis(800), |s| {
        s.last_exit_code == Some(1)
    })
    .await;
    assert_ne!(exited.state, ProcessState::Running);

    // The second life exits at once too, so only its start time is reliable
    let second = wait_for(&sup, "parent", Duration::from_secs(5), |s| {
        s.last_started_at != Some(first_started)
    })
    .await;
    let gap = second
        .last_started_at
        .unwrap()
        .duration_since(first_started)
        .unwrap();
    assert!(gap >= Duration::from_millis(900), "relaunched after {:?}", gap);
    assert_eq!(second.restart_count, 1);

    sup.shutdown().await;
}

#[tokio::test]
async fn test_watch_works_when_logs_live_in_working_directory() {
    let dir = TempDir::new().unwrap();
    let app_dir = dir.path().join("app");
    std::fs::create_dir(&app_dir).unwrap();

    let mut settings = create_test_settings(&dir);
    settings.log_dir = app_dir.clone();
    let mut config = sh("watched", "echo booted; sleep 30");
    config.working_directory = Some(app_dir.clone());
    config.watch_enabled = true;
    let sup = supervisor(&dir, settings, vec![config]);

    let first = sup.start_all().await.remove(0);
    tokio::time::sleep(Duration::from_millis(700)).await;

    std::fs::write(app_dir.join("main.py"), "print('v2')\n").unwrap();

    let status = wait_for(&sup, "watched", Duration::from_secs(10), |s| {
        s.state == ProcessState::Running && s.pid.is_some() && s.pid != first.pid
    })
    .await;
    assert_eq!(status.restart_count, 0);

    // The supervisor's own log writes never count as changes
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(sup.status("watched").await.unwrap().pid, status.pid);

    sup.shutdown().await;
}
