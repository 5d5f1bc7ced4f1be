use futures::Stream;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{ConnectionSupervisor, DeviceId};

/// Pumps a device-discovery feed of `(device, available)` signals into the supervisor.
pub struct PresenceMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PresenceMonitor {
    pub fn spawn<S>(supervisor: ConnectionSupervisor, feed: S) -> Self
    where
        S: Stream<Item = (DeviceId, bool)> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut feed = Box::pin(feed);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = feed.next() => match next {
                        Some((device, available)) => supervisor.observe_presence(&device, available),
                        None => break,
                    },
                }
            }
            trace!(target = "harbor::presence", "presence feed ended");
        });
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PresenceMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{BackoffPolicy, ConnectReason, ConnectionEvent, ConnectionState};
    use crate::relay::mock::ScriptedRelay;
    use state_bus::LocalBus;
    use std::sync::Arc;
    use std::time::Duration;
    use futures::channel::mpsc;

    #[tokio::test(start_paused = true)]
    async fn lost_presence_reconnects_active_device() {
        let relay = Arc::new(ScriptedRelay::new());
        let supervisor = ConnectionSupervisor::new(
            relay.clone(),
            Arc::new(LocalBus::<ConnectionEvent>::new()),
            Duration::from_secs(10),
            BackoffPolicy::default(),
        );
        let device = DeviceId::new("desk-1");
        supervisor.set_active_device(Some(device.clone()));
        supervisor.connect(&device, ConnectReason::Startup).await.unwrap();

        let (tx, rx) = mpsc::unbounded();
        let monitor = PresenceMonitor::spawn(supervisor.clone(), rx);
        tx.unbounded_send((device.clone(), false)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(relay.connect_count(&device), 2);
        assert_eq!(supervisor.connection_state(&device), Some(ConnectionState::Connected));

        drop(tx);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(monitor.is_finished());
    }
}
