mod scope;
mod tiered;

use thiserror::Error;

use crate::error::RelayError;

pub use scope::{LoadHandle, LoadOutcome, LoadScope, LoadState, TimeoutHook};
pub use tiered::{FetchRequest, Tier, TieredFetchCoordinator, TieredView};

/// Terminal failure of one load. Cancellation is not an error and has no variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("load timed out")]
    Timeout,
}

impl LoadError {
    pub fn code(&self) -> &str {
        match self {
            LoadError::Relay(err) => err.code(),
            LoadError::Timeout => "timeout",
        }
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, LoadError::Relay(err) if err.is_connection_loss())
    }
}
