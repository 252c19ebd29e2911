// Integration tests for the control socket

use shepherd::config::{ProcessConfig, Registry, SupervisorSettings};
use shepherd::daemon::Daemon;
use shepherd::error::ShepherdError;
use shepherd::ipc::{Command, IpcClient, IpcServer, Response, ResponseData};
use shepherd::process::ProcessState;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

async fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !path.exists() {
        assert!(Instant::now() < deadline, "socket never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Send one command from a blocking thread, the way the CLI does
async fn send(socket: &Path, command: Command) -> shepherd::error::Result<Response> {
    let socket = socket.to_path_buf();
    tokio::task::spawn_blocking(move || IpcClient::with_socket_path(socket).send_command(command))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_client_communication() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("echo.sock");

    let mut server = IpcServer::with_socket_path(&socket_path);
    server.start().unwrap();
    let server_task = tokio::spawn(async move {
        server
            .run(|command| async move {
                match command {
                    Command::Stop { name } if name == "ghost" => {
                        Err(ShepherdError::UnknownProcess(name))
                    }
                    Command::Stop { name } => Ok(Response::success(
                        0,
                        ResponseData::Success(format!("stopped {}", name)),
                    )),
                    _ => Ok(Response::success(0, ResponseData::ProcessList(Vec::new()))),
                }
            })
            .await
    });
    wait_for_socket(&socket_path).await;

    let response = send(&socket_path, Command::List).await.unwrap();
    assert_eq!(response.result, Ok(ResponseData::ProcessList(Vec::new())));

    let response = send(&socket_path, Command::Stop { name: "api".to_string() })
        .await
        .unwrap();
    assert_eq!(
        response.result,
        Ok(ResponseData::Success("stopped api".to_string()))
    );

    // Handler errors come back as an error result, not a broken connection
    let response = send(&socket_path, Command::Stop { name: "ghost".to_string() })
        .await
        .unwrap();
    let message = response.result.unwrap_err();
    assert!(message.contains("ghost"), "unexpected error: {}", message);

    server_task.abort();
}

#[tokio::test]
async fn test_malformed_request_gets_error_response() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path = temp_dir.path().join("malformed.sock");

    let mut server = IpcServer::with_socket_path(&socket_path);
    server.start().unwrap();
    let server_task = tokio::spawn(async move {
        server
            .run(|_| async { Ok(Response::success(0, ResponseData::ProcessList(Vec::new()))) })
            .await
    });
    wait_for_socket(&socket_path).await;

    let stream = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    writer.write_all(b"this is not json\n").await.unwrap();

    let mut line = String::new();
    BufReader::new(reader).read_line(&mut line).await.unwrap();
    let response: Response = serde_json::from_str(&line).unwrap();

    assert_eq!(response.id, 0);
    assert!(response.result.unwrap_err().contains("Malformed request"));

    server_task.abort();
}

#[tokio::test]
async fn test_client_without_supervisor() {
    let temp_dir = TempDir::new().unwrap();
    let result = send(&temp_dir.path().join("nobody.sock"), Command::List).await;
    assert!(matches!(result, Err(ShepherdError::DaemonNotRunning)));
}

fn daemon_registry(dir: &TempDir) -> Registry {
    let settings = SupervisorSettings {
        log_dir: dir.path().join("logs"),
        kill_timeout_ms: 500,
        ..SupervisorSettings::default()
    };
    let mut worker = ProcessConfig::new("worker", "/bin/sh");
    worker.arguments = vec!["-c".to_string(), "sleep 30".to_string()];
    let mut api = ProcessConfig::new("api", "/bin/sh");
    api.arguments = vec!["-c".to_string(), "sleep 30".to_string()];
    Registry::from_configs(settings, vec![worker, api], dir.path()).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_serves_commands_until_shutdown() {
    let temp_dir = TempDir::new().unwrap();
    let socket_path: PathBuf = temp_dir.path().join("control").join("shepherd.sock");

    let daemon = Daemon::new(daemon_registry(&temp_dir), Some(socket_path.clone()));
    assert_eq!(daemon.socket_path(), socket_path.as_path());
    let daemon_task = tokio::spawn(daemon.run());
    wait_for_socket(&socket_path).await;

    // List answers in declaration order once everything has been started
    let deadline = Instant::now() + Duration::from_secs(5);
    let list = loop {
        let response = send(&socket_path, Command::List).await.unwrap();
        let list = match response.result {
            Ok(ResponseData::ProcessList(list)) => list,
            other => panic!("unexpected list answer: {:?}", other),
        };
        if list.iter().all(|s| s.state == ProcessState::Running) {
            break list;
        }
        assert!(Instant::now() < deadline, "processes never came up");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let names: Vec<&str> = list.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["worker", "api"]);

    let response = send(&socket_path, Command::Stop { name: "api".to_string() })
        .await
        .unwrap();
    match response.result {
        Ok(ResponseData::Status(status)) => {
            assert_eq!(status.name, "api");
            assert_eq!(status.state, ProcessState::Stopped);
        }
        other => panic!("unexpected stop answer: {:?}", other),
    }

    let response = send(&socket_path, Command::Status { name: "nope".to_string() })
        .await
        .unwrap();
    assert!(response.result.unwrap_err().contains("nope"));

    let response = send(&socket_path, Command::Shutdown).await.unwrap();
    assert!(matches!(response.result, Ok(ResponseData::Success(_))));

    let statuses = tokio::time::timeout(Duration::from_secs(5), daemon_task)
        .await
        .expect("daemon did not shut down")
        .unwrap()
        .unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.state == ProcessState::Stopped));
    assert!(!socket_path.exists());
}
