use std::collections::BTreeMap;
use std::fmt;

use crate::connection::{ConnectionState, DeviceConnection, DeviceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkspaceConnectivityState {
    Healthy,
    TransientReconnecting,
    DegradedDisconnected,
    OfflineModeCandidate,
}

impl WorkspaceConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceConnectivityState::Healthy => "healthy",
            WorkspaceConnectivityState::TransientReconnecting => "transient_reconnecting",
            WorkspaceConnectivityState::DegradedDisconnected => "degraded_disconnected",
            WorkspaceConnectivityState::OfflineModeCandidate => "offline_mode_candidate",
        }
    }
}

impl fmt::Display for WorkspaceConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps the active device's connection plus the offline flag onto the coarse
/// workspace state. `None` until a device is active.
pub fn derive_connectivity(
    connection: Option<&DeviceConnection>,
    offline_mode: bool,
) -> Option<WorkspaceConnectivityState> {
    use self::WorkspaceConnectivityState::*;

    let connection = connection?;
    if connection.state.is_connected() {
        return Some(Healthy);
    }
    if offline_mode {
        return Some(OfflineModeCandidate);
    }
    let failed_before = connection.reconnect_failures > 0;
    Some(match &connection.state {
        ConnectionState::Connected => Healthy,
        ConnectionState::Connecting => TransientReconnecting,
        ConnectionState::Disconnected if failed_before => DegradedDisconnected,
        ConnectionState::Disconnected => TransientReconnecting,
        ConnectionState::Failed(cause)
            if failed_before || cause.requires_device_selection() || !cause.is_connection_loss() =>
        {
            DegradedDisconnected
        }
        ConnectionState::Failed(_) => TransientReconnecting,
    })
}

/// State bound to the selected project and session. Replaced wholesale when
/// either changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub project: Option<String>,
    pub session_id: Option<String>,
    pub pending_text: String,
    pub sync_markers: BTreeMap<String, u64>,
    /// Bumped on every reset so late writers can tell their context is gone.
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceSnapshot {
    pub connectivity: Option<WorkspaceConnectivityState>,
    pub previous: Option<WorkspaceConnectivityState>,
    pub banner_visible: bool,
    pub escalation_pending: bool,
    pub active_device: Option<DeviceId>,
    pub offline_mode: bool,
    pub context: SessionContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceEvent {
    ConnectivityChanged {
        from: Option<WorkspaceConnectivityState>,
        to: Option<WorkspaceConnectivityState>,
    },
    BannerShown,
    BannerCleared,
    ReloadRequested {
        slot: String,
    },
    DeviceSelectionRequired {
        device: DeviceId,
        code: String,
    },
    ContextReset {
        project: Option<String>,
        session_id: Option<String>,
        epoch: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use super::WorkspaceConnectivityState::*;

    fn conn(state: ConnectionState, failures: u32) -> DeviceConnection {
        DeviceConnection {
            device: DeviceId::new("desk-1"),
            state,
            reconnect_failures: failures,
            available: true,
        }
    }

    #[test]
    fn no_active_device_means_no_state() {
        assert_eq!(derive_connectivity(None, false), None);
        assert_eq!(derive_connectivity(None, true), None);
    }

    #[test]
    fn first_loss_is_transient_until_a_retry_fails() {
        let network = RelayError::Network("reset".into());
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Failed(network.clone()), 0)), false),
            Some(TransientReconnecting)
        );
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Failed(network), 1)), false),
            Some(DegradedDisconnected)
        );
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Disconnected, 0)), false),
            Some(TransientReconnecting)
        );
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Disconnected, 2)), false),
            Some(DegradedDisconnected)
        );
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Connecting, 3)), false),
            Some(TransientReconnecting)
        );
    }

    #[test]
    fn non_connection_causes_degrade_immediately() {
        for cause in [
            RelayError::InvalidUrl("x".into()),
            RelayError::Timeout,
            RelayError::server("device_unlinked", "gone"),
        ] {
            assert_eq!(
                derive_connectivity(Some(&conn(ConnectionState::Failed(cause), 0)), false),
                Some(DegradedDisconnected)
            );
        }
    }

    #[test]
    fn offline_flag_only_applies_while_not_connected() {
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Connected, 0)), true),
            Some(Healthy)
        );
        assert_eq!(
            derive_connectivity(Some(&conn(ConnectionState::Connecting, 0)), true),
            Some(OfflineModeCandidate)
        );
    }
}
