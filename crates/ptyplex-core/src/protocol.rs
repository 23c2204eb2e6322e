//! Protocol types for CLI-daemon communication.
//!
//! One JSON object per line in each direction over the daemon's Unix socket.

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// A request from CLI to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
}

/// Commands the daemon can execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    /// Spawn a new PTY session.
    Spawn {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Get the auth token and transport port, optionally closing every
    /// session except `keep` first.
    Details {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keep: Option<u64>,
    },
    /// Close every session except `keep`.
    CloseAllExcept { keep: u64 },
    /// Close one session.
    Kill { session: u64 },
    /// List all live sessions.
    ListSessions,
    /// Shutdown the daemon gracefully.
    Shutdown,
}

/// A response from daemon to CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl Response {
    pub fn success(id: impl Into<String>, data: ResponseData) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: ApiError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Response payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Session created response.
    SessionCreated { session_id: u64 },
    /// Connection details for the streaming transport.
    Details { token: String, port: u16 },
    /// List of live sessions.
    Sessions { sessions: Vec<SessionInfo> },
    /// Generic success message.
    Ok { message: String },
}

/// Information about a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: u64,
    pub command: Vec<String>,
    pub created_at: String,
    pub connected: bool,
    pub paused: bool,
    pub rows: u16,
    pub cols: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_omits_unset_optionals() {
        let command = Command::Spawn {
            command: vec!["bash".into()],
            rows: None,
            cols: None,
            cwd: None,
        };
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(json, r#"{"action":"spawn","command":["bash"]}"#);
    }

    #[test]
    fn test_spawn_accepts_missing_optionals() {
        let command: Command =
            serde_json::from_str(r#"{"action":"spawn","command":["sh","-l"],"rows":40}"#).unwrap();
        assert_eq!(
            command,
            Command::Spawn {
                command: vec!["sh".into(), "-l".into()],
                rows: Some(40),
                cols: None,
                cwd: None,
            }
        );
    }

    #[test]
    fn test_close_all_except_tag() {
        let json = serde_json::to_string(&Command::CloseAllExcept { keep: 3 }).unwrap();
        assert_eq!(json, r#"{"action":"close_all_except","keep":3}"#);
    }

    #[test]
    fn test_error_response_skips_data() {
        let response = Response::error("r1", ApiError::session_not_found(9));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"success\":false"));
        assert!(!json.contains("\"data\""));
        assert!(json.contains("SESSION_NOT_FOUND"));
    }

    #[test]
    fn test_details_response_shape() {
        let response = Response::success(
            "r2",
            ResponseData::Details {
                token: "abc".into(),
                port: 34373,
            },
        );
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""type":"details""#));
        assert!(json.contains(r#""port":34373"#));
    }
}
