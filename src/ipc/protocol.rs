// IPC Protocol definitions for control-socket clients
//
// One newline-terminated JSON request per connection, answered by one
// newline-terminated JSON response.

use crate::process::ProcessStatus;
use serde::{Deserialize, Serialize};

/// All available commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    StartAll,
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Status { name: String },
    List,
    /// Stop every process and exit the supervisor
    Shutdown,
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    /// Snapshot of one process
    Status(ProcessStatus),
    /// Snapshots of every process, in declaration order
    ProcessList(Vec<ProcessStatus>),
    /// Generic success message
    Success(String),
}

/// Request message from client to supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub command: Command,
}

/// Response message from supervisor to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub result: Result<ResponseData, String>,
}

impl Request {
    pub fn new(id: u64, command: Command) -> Self {
        Self { id, command }
    }
}

impl Response {
    pub fn success(id: u64, data: ResponseData) -> Self {
        Self {
            id,
            result: Ok(data),
        }
    }

    pub fn error(id: u64, error: String) -> Self {
        Self {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_request_wire_format() {
        let request = Request::new(7, Command::Stop {
            name: "api".to_string(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":7,"command":{"Stop":{"name":"api"}}}"#);

        let unit = serde_json::to_string(&Request::new(1, Command::List)).unwrap();
        assert_eq!(unit, r#"{"id":1,"command":"List"}"#);
    }

    #[test]
    fn test_status_response_survives_json() {
        let status = ProcessStatus {
            name: "worker".to_string(),
            state: ProcessState::RestartBackoff,
            pid: None,
            restart_count: 4,
            last_exit_code: Some(1),
            last_signal: None,
            last_started_at: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            last_exited_at: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_005)),
            memory_usage_bytes: Some(12_345),
        };
        let response = Response::success(3, ResponseData::Status(status.clone()));

        let json = serde_json::to_string(&response).unwrap();
        let back: Response = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.result, Ok(ResponseData::Status(status)));
    }

    #[test]
    fn test_error_response() {
        let response = Response::error(9, "Unknown process: ghost".to_string());
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""Err":"Unknown process: ghost""#));
    }
}
