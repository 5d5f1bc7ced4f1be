use std::sync::Arc;
use std::time::Duration;

use harbor_client_core::config::ClientConfig;
use harbor_client_core::connection::{ConnectionState, DeviceId};
use harbor_client_core::error::RelayError;
use harbor_client_core::load::LoadError;
use harbor_client_core::relay::mock::{ScriptedRelay, ScriptedResponse};
use harbor_client_core::runtime::WorkspaceRuntime;
use harbor_client_core::workspace::{WorkspaceConnectivityState, WorkspaceEvent};
use state_bus::Subscription;
use tokio::time::{Instant, sleep};

use WorkspaceConnectivityState::*;

fn device() -> DeviceId {
    DeviceId::new("desk-1")
}

fn drain(events: &mut Subscription<WorkspaceEvent>) -> Vec<WorkspaceEvent> {
    let mut out = Vec::new();
    while let Ok(Some(msg)) = events.try_recv() {
        out.push(msg.payload);
    }
    out
}

fn trail(events: &[WorkspaceEvent]) -> Vec<Option<WorkspaceConnectivityState>> {
    events
        .iter()
        .filter_map(|event| match event {
            WorkspaceEvent::ConnectivityChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

#[test_timeout::tokio_timeout_test(paused)]
async fn quick_connect_goes_transient_then_healthy_without_banner() {
    let relay = Arc::new(ScriptedRelay::new());
    relay.set_connect_delay(Duration::from_millis(1500));
    let runtime = WorkspaceRuntime::start(ClientConfig::default(), relay.clone());
    let mut events = runtime.machine().subscribe();

    let started = Instant::now();
    runtime.select_device(device()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));

    let mut watch = runtime.machine().watch();
    watch
        .wait_for(|s| s.connectivity == Some(Healthy))
        .await
        .unwrap();

    sleep(Duration::from_secs(10)).await;
    runtime.machine().sync().await.unwrap();

    let events = drain(&mut events);
    assert_eq!(trail(&events), vec![Some(TransientReconnecting), Some(Healthy)]);
    assert!(!events.contains(&WorkspaceEvent::BannerShown));
    assert!(!runtime.machine().snapshot().banner_visible);
    assert_eq!(relay.connect_count(&device()), 1);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn persistent_network_failure_escalates_then_degrades() {
    let relay = Arc::new(ScriptedRelay::new());
    let runtime = WorkspaceRuntime::start(ClientConfig::default(), relay.clone());
    runtime.select_device(device()).await.unwrap();
    let mut watch = runtime.machine().watch();
    watch
        .wait_for(|s| s.connectivity == Some(Healthy))
        .await
        .unwrap();

    // the next two reconnects each hang for 9s and then fail
    for _ in 0..2 {
        relay.push_connect_outcome_after(
            &device(),
            Duration::from_secs(9),
            Err(RelayError::Network("unreachable".into())),
        );
    }

    let lost_at = Instant::now();
    relay.drop_link(&device(), RelayError::Network("connection reset".into()));

    sleep(Duration::from_millis(7_900)).await;
    runtime.machine().sync().await.unwrap();
    let snapshot = runtime.machine().snapshot();
    assert_eq!(snapshot.connectivity, Some(TransientReconnecting));
    assert!(!snapshot.banner_visible);

    watch.wait_for(|s| s.banner_visible).await.unwrap();
    let shown_after = lost_at.elapsed();
    assert!(shown_after >= Duration::from_secs(8));
    assert!(shown_after < Duration::from_secs(10));

    watch
        .wait_for(|s| s.connectivity == Some(DegradedDisconnected))
        .await
        .unwrap();
    assert!(lost_at.elapsed() >= Duration::from_secs(9));
    assert!(matches!(
        runtime.supervisor().connection_state(&device()),
        Some(ConnectionState::Failed(RelayError::Network(_))) | Some(ConnectionState::Connecting)
    ));
    assert!(runtime.machine().snapshot().banner_visible);

    // retries after 1s and 2s of backoff; the third uses the default outcome
    watch
        .wait_for(|s| s.connectivity == Some(Healthy))
        .await
        .unwrap();
    assert!(lost_at.elapsed() >= Duration::from_secs(20));
    assert!(!runtime.machine().snapshot().banner_visible);
    assert_eq!(relay.connect_count(&device()), 4);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn connection_loss_seen_by_a_load_triggers_reconnect() {
    let relay = Arc::new(ScriptedRelay::new());
    relay.set_responder(|_, _| {
        ScriptedResponse::error(
            Duration::from_millis(20),
            RelayError::server("-32010", "desktop is offline"),
        )
    });
    let runtime = WorkspaceRuntime::start(ClientConfig::default(), relay.clone());
    runtime.select_device(device()).await.unwrap();
    assert_eq!(relay.connect_count(&device()), 1);

    runtime.folders().browse("/home/user");
    sleep(Duration::from_millis(100)).await;

    assert!(relay.connect_count(&device()) >= 2);
    assert!(runtime.folders().view().error.is_some());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn load_timeout_on_a_connected_device_re_dials_it() {
    let relay = Arc::new(ScriptedRelay::new());
    relay.set_responder(|_, _| ScriptedResponse::hang());
    let runtime = WorkspaceRuntime::start(ClientConfig::default(), relay.clone());
    runtime.select_device(device()).await.unwrap();
    assert_eq!(relay.connect_count(&device()), 1);

    runtime.folders().browse("/home/user");
    sleep(Duration::from_millis(11_900)).await;
    assert!(runtime.folders().view().is_loading);
    assert_eq!(relay.connect_count(&device()), 1);

    sleep(Duration::from_millis(200)).await;
    let view = runtime.folders().view();
    assert!(!view.is_loading);
    assert_eq!(view.error, Some(LoadError::Timeout));
    assert_eq!(relay.connect_count(&device()), 2);
    assert_eq!(
        runtime.supervisor().connection_state(&device()),
        Some(ConnectionState::Connected)
    );

    // the healthy re-dial does not start a reconnect loop
    sleep(Duration::from_secs(30)).await;
    assert_eq!(relay.connect_count(&device()), 2);
    assert!(!runtime.supervisor().is_reconnecting(&device()));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unlinked_device_requires_selection_and_is_not_retried() {
    let relay = Arc::new(ScriptedRelay::new());
    relay.push_connect_outcome(&device(), Err(RelayError::server("device_unlinked", "unpaired")));
    let runtime = WorkspaceRuntime::start(ClientConfig::default(), relay.clone());
    let mut events = runtime.machine().subscribe();

    let err = runtime.select_device(device()).await.unwrap_err();
    assert!(err.requires_device_selection());

    let mut watch = runtime.machine().watch();
    watch
        .wait_for(|s| s.connectivity == Some(DegradedDisconnected))
        .await
        .unwrap();
    sleep(Duration::from_secs(30)).await;
    runtime.machine().sync().await.unwrap();

    let events = drain(&mut events);
    let selections = events
        .iter()
        .filter(|event| matches!(event, WorkspaceEvent::DeviceSelectionRequired { .. }))
        .count();
    assert_eq!(selections, 1);
    assert!(events.contains(&WorkspaceEvent::DeviceSelectionRequired {
        device: device(),
        code: "device_unlinked".into(),
    }));
    assert!(events.contains(&WorkspaceEvent::BannerShown));
    assert!(!runtime.supervisor().is_reconnecting(&device()));
    assert_eq!(relay.connect_count(&device()), 1);
    assert_eq!(runtime.machine().connectivity(), Some(DegradedDisconnected));
}
