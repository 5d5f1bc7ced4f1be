//! Workspace-level view of connectivity: derives the coarse state from the
//! active device, debounces the escalation banner, re-triggers the last load
//! on recovery and owns session-bound context.

mod machine;
mod state;

pub use machine::{ReloadTarget, TOPIC, WorkspaceError, WorkspaceStateMachine};
pub use state::{
    SessionContext, WorkspaceConnectivityState, WorkspaceEvent, WorkspaceSnapshot,
    derive_connectivity,
};
