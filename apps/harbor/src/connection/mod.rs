mod backoff;
mod presence;
mod supervisor;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

pub use backoff::BackoffPolicy;
pub use presence::PresenceMonitor;
pub use supervisor::{ConnectionSupervisor, FailureSink};

/// Topic on which the supervisor publishes [`ConnectionEvent`]s.
pub const TOPIC: &str = "connection.state";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Failed(RelayError),
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

/// Snapshot of one device as the supervisor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnection {
    pub device: DeviceId,
    pub state: ConnectionState,
    /// Failed connect attempts since the device was last connected.
    pub reconnect_failures: u32,
    /// Last presence signal from device discovery.
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(DeviceConnection),
    ActiveDeviceChanged(Option<DeviceId>),
    DeviceRemoved(DeviceId),
}

/// Why a connect attempt was started; recorded in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReason {
    UserSelected,
    Startup,
    Foreground,
    PresenceRegained,
    PresenceLost,
    LinkLost,
    OperationFailed,
    /// A load expired while the device still looked connected.
    LoadTimeout,
    Retry,
}

impl ConnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectReason::UserSelected => "user_selected",
            ConnectReason::Startup => "startup",
            ConnectReason::Foreground => "foreground",
            ConnectReason::PresenceRegained => "presence_regained",
            ConnectReason::PresenceLost => "presence_lost",
            ConnectReason::LinkLost => "link_lost",
            ConnectReason::OperationFailed => "operation_failed",
            ConnectReason::LoadTimeout => "load_timeout",
            ConnectReason::Retry => "retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Foreground,
    Background,
}
