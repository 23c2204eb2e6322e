//! Control-plane error types with suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for control-plane responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    AlreadyConnected,
    SpawnFailed,
    InvalidInput,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::AlreadyConnected => write!(f, "ALREADY_CONNECTED"),
            ErrorCode::SpawnFailed => write!(f, "SPAWN_FAILED"),
            ErrorCode::InvalidInput => write!(f, "INVALID_INPUT"),
            ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
        }
    }
}

/// An error response with a hint about what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn session_not_found(session_id: u64) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session {} not found", session_id),
            suggestion: Some("Run 'ptyplex list-sessions' to see live sessions".into()),
        }
    }

    pub fn already_connected(session_id: u64) -> Self {
        Self {
            code: ErrorCode::AlreadyConnected,
            message: format!("Session {} already has a connected client", session_id),
            suggestion: Some(
                "Close the other client first; a session accepts one connection at a time".into(),
            ),
        }
    }

    /// Create a spawn failed error with context about what went wrong.
    pub fn spawn_failed(command: &[String], error: &str) -> Self {
        let cmd_str = if command.is_empty() {
            "(empty command)".to_string()
        } else {
            command.join(" ")
        };
        Self {
            code: ErrorCode::SpawnFailed,
            message: format!("Failed to spawn '{}': {}", cmd_str, error),
            suggestion: Some(format!(
                "Verify '{}' exists in your PATH and is executable, and that the working directory exists.",
                command.first().map_or("the command", |s| s.as_str())
            )),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the command syntax and try again".into()),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn shutting_down() -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: "Daemon is shutting down".to_string(),
            suggestion: Some("Retry once the daemon has restarted".into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every constructor must provide a suggestion.
    fn assert_has_suggestion(err: &ApiError, context: &str) {
        assert!(
            err.suggestion.is_some(),
            "{} should have a suggestion, but got None",
            context
        );
    }

    #[test]
    fn test_session_not_found_has_suggestion() {
        let err = ApiError::session_not_found(42);
        assert_has_suggestion(&err, "session_not_found");
        assert!(err.suggestion.as_ref().unwrap().contains("list-sessions"));
        assert!(err.message.contains("42"));
    }

    #[test]
    fn test_already_connected_has_suggestion() {
        let err = ApiError::already_connected(7);
        assert_has_suggestion(&err, "already_connected");
        assert_eq!(err.code, ErrorCode::AlreadyConnected);
        assert!(err.message.contains('7'));
    }

    #[test]
    fn test_spawn_failed_has_suggestion() {
        let cmd = vec!["vim".to_string(), "file.txt".to_string()];
        let err = ApiError::spawn_failed(&cmd, "command not found");
        assert_has_suggestion(&err, "spawn_failed");
        assert_eq!(err.code, ErrorCode::SpawnFailed);
        assert!(err.message.contains("vim file.txt"));
        assert!(err.message.contains("command not found"));
        assert!(err.suggestion.as_ref().unwrap().contains("vim"));
    }

    #[test]
    fn test_spawn_failed_empty_command() {
        let err = ApiError::spawn_failed(&[], "no command");
        assert_has_suggestion(&err, "spawn_failed (empty)");
        assert!(err.message.contains("(empty command)"));
    }

    #[test]
    fn test_invalid_input_with_custom_suggestion() {
        let err = ApiError::invalid_input_with_suggestion("bad size", "Use ROWSxCOLS");
        assert_has_suggestion(&err, "invalid_input_with_suggestion");
        assert!(err.suggestion.as_ref().unwrap().contains("ROWSxCOLS"));
    }

    #[test]
    fn test_internal_and_shutdown_have_suggestions() {
        assert_has_suggestion(&ApiError::internal("unexpected"), "internal");
        assert_has_suggestion(&ApiError::shutting_down(), "shutting_down");
        assert_has_suggestion(&ApiError::invalid_input("x"), "invalid_input");
    }

    #[test]
    fn test_display_format_with_suggestion() {
        let err = ApiError::session_not_found(3);
        let display = format!("{}", err);
        assert!(display.contains("[SESSION_NOT_FOUND]"));
        assert!(display.contains('3'));
        assert!(display.contains("(hint:"));
    }

    #[test]
    fn test_json_round_trip_keeps_code() {
        let json =
            r#"{"code":"ALREADY_CONNECTED","message":"Session 1 already has a connected client","suggestion":"hint"}"#;
        let err: ApiError = serde_json::from_str(json).unwrap();
        assert!(matches!(err.code, ErrorCode::AlreadyConnected));
        assert_eq!(err.suggestion, Some("hint".to_string()));

        let back = serde_json::to_string(&err).unwrap();
        assert!(back.contains("ALREADY_CONNECTED"));
    }
}
