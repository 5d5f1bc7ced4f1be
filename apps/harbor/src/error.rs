use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Server codes that mean the paired desktop can no longer be reached through this
/// relay identity; the user has to pick a device again rather than retry.
const DEVICE_SELECTION_CODES: &[&str] = &["auth_required", "device_unlinked", "deviceOwnershipFailed"];

/// Server codes that describe a lost or refused relay route rather than a failed
/// operation on the desktop.
const CONNECTION_CODES: &[&str] = &[
    "auth_required",
    "device_unlinked",
    "deviceOwnershipFailed",
    "device_offline",
    "device_not_connected",
    "relay_unavailable",
    "session_expired",
    "unauthorized",
];

/// JSON-RPC codes emitted by the desktop's command handler and the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    Database,
    ExternalService,
    Billing,
    PaymentRequired,
    NotImplemented,
    DesktopOffline,
    Other(i64),
}

impl RpcErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::Internal,
            -32000 => Self::Unauthorized,
            -32001 => Self::Forbidden,
            -32002 => Self::NotFound,
            -32003 => Self::Conflict,
            -32004 => Self::Validation,
            -32005 => Self::Database,
            -32006 => Self::ExternalService,
            -32007 => Self::Billing,
            -32008 => Self::PaymentRequired,
            -32009 => Self::NotImplemented,
            -32010 => Self::DesktopOffline,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Internal => -32603,
            Self::Unauthorized => -32000,
            Self::Forbidden => -32001,
            Self::NotFound => -32002,
            Self::Conflict => -32003,
            Self::Validation => -32004,
            Self::Database => -32005,
            Self::ExternalService => -32006,
            Self::Billing => -32007,
            Self::PaymentRequired => -32008,
            Self::NotImplemented => -32009,
            Self::DesktopOffline => -32010,
            Self::Other(code) => code,
        }
    }

    fn is_connection_loss(self) -> bool {
        matches!(self, Self::Unauthorized | Self::DesktopOffline)
    }
}

/// Structured error carried inside a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    /// Either a JSON-RPC integer code or a relay string code.
    pub code: Value,
    pub message: String,
}

impl FrameError {
    pub fn rpc(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: Value::from(code.code()),
            message: message.into(),
        }
    }

    pub fn named(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: Value::from(code),
            message: message.into(),
        }
    }

    pub fn code_string(&self) -> String {
        match &self.code {
            Value::String(code) => code.clone(),
            Value::Null => "unknown".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<FrameError> for RelayError {
    fn from(err: FrameError) -> Self {
        RelayError::Server {
            code: err.code_string(),
            message: err.message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The relay route to the desktop is gone; reconnect and escalate.
    ConnectionLoss,
    /// Misconfiguration or a programming error; surface once, never retry.
    Configuration,
    /// A single operation failed; the connection itself is fine.
    OperationLocal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::ConnectionLoss => "connection_loss",
            ErrorClass::Configuration => "configuration",
            ErrorClass::OperationLocal => "operation_local",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("relay request timed out")]
    Timeout,
    #[error("device is not connected")]
    NotConnected,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("relay connection closed")]
    Disconnected,
}

impl RelayError {
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::NotConnected | RelayError::Disconnected | RelayError::Network(_) => {
                ErrorClass::ConnectionLoss
            }
            RelayError::InvalidUrl(_) | RelayError::Encoding(_) | RelayError::InvalidState(_) => {
                ErrorClass::Configuration
            }
            RelayError::Timeout => ErrorClass::OperationLocal,
            RelayError::Server { code, message } => {
                if server_code_is_connection_loss(code, message) {
                    ErrorClass::ConnectionLoss
                } else {
                    ErrorClass::OperationLocal
                }
            }
        }
    }

    pub fn is_connection_loss(&self) -> bool {
        self.class() == ErrorClass::ConnectionLoss
    }

    /// Whether an automatic reconnect loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        if self.requires_device_selection() {
            return false;
        }
        matches!(self, RelayError::Timeout) || self.is_connection_loss()
    }

    pub fn requires_device_selection(&self) -> bool {
        match self {
            RelayError::Server { code, .. } => DEVICE_SELECTION_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Stable identifier handed to the presentation layer for translation.
    pub fn code(&self) -> &str {
        match self {
            RelayError::Server { code, .. } => code.as_str(),
            RelayError::Timeout => "timeout",
            RelayError::NotConnected => "not_connected",
            RelayError::Network(_) => "network_error",
            RelayError::InvalidUrl(_) => "invalid_url",
            RelayError::InvalidState(_) => "invalid_state",
            RelayError::Encoding(_) => "encoding_error",
            RelayError::Disconnected => "disconnected",
        }
    }
}

fn server_code_is_connection_loss(code: &str, message: &str) -> bool {
    if CONNECTION_CODES.contains(&code) {
        return true;
    }
    if let Ok(numeric) = code.parse::<i64>() {
        if RpcErrorCode::from_code(numeric).is_connection_loss() {
            return true;
        }
    }
    let message = message.to_ascii_lowercase();
    message.contains("not connected") || message.contains("desktop is offline")
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Encoding(err.to_string())
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => RelayError::Disconnected,
            WsError::Url(err) => RelayError::InvalidUrl(err.to_string()),
            other => RelayError::Network(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_classify_as_connection_loss() {
        for err in [
            RelayError::NotConnected,
            RelayError::Disconnected,
            RelayError::Network("reset by peer".into()),
        ] {
            assert_eq!(err.class(), ErrorClass::ConnectionLoss, "{err}");
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn configuration_errors_are_never_retried() {
        for err in [
            RelayError::InvalidUrl("ftp://x".into()),
            RelayError::Encoding("bad utf8".into()),
            RelayError::InvalidState("no device".into()),
        ] {
            assert_eq!(err.class(), ErrorClass::Configuration, "{err}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn server_errors_split_on_code() {
        let offline = RelayError::from(FrameError::rpc(RpcErrorCode::DesktopOffline, "Desktop is offline"));
        assert!(offline.is_connection_loss());

        let missing = RelayError::from(FrameError::rpc(RpcErrorCode::NotFound, "job not found"));
        assert_eq!(missing.class(), ErrorClass::OperationLocal);
        assert!(!missing.is_retryable());

        let unlinked = RelayError::server("device_unlinked", "device was removed");
        assert!(unlinked.is_connection_loss());
        assert!(unlinked.requires_device_selection());
        assert!(!unlinked.is_retryable());
    }

    #[test]
    fn timeout_is_operation_local_but_retryable() {
        assert_eq!(RelayError::Timeout.class(), ErrorClass::OperationLocal);
        assert!(RelayError::Timeout.is_retryable());
        assert_eq!(RelayError::Timeout.code(), "timeout");
    }

    #[test]
    fn frame_error_code_renders_numbers_and_strings() {
        assert_eq!(FrameError::rpc(RpcErrorCode::Internal, "x").code_string(), "-32603");
        assert_eq!(FrameError::named("auth_required", "x").code_string(), "auth_required");
        assert_eq!(RpcErrorCode::from_code(-42), RpcErrorCode::Other(-42));
    }
}
