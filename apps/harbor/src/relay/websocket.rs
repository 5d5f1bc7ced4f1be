use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use super::{FrameStream, LinkObserver, RelayCommandChannel, RelayConnector, RelayRequest, ResponseFrame};
use crate::config::ClientConfig;
use crate::connection::DeviceId;
use crate::error::RelayError;

#[derive(Debug, Clone)]
pub struct WebSocketRelayConfig {
    pub relay_url: Url,
    pub auth_token: Option<String>,
    /// Identifies this mobile client to the relay.
    pub client_id: String,
    pub device_name: String,
    /// Upper bound for one call, from request to final frame.
    pub request_timeout: Duration,
}

impl WebSocketRelayConfig {
    pub fn from_client_config(config: &ClientConfig) -> Self {
        Self {
            relay_url: config.relay_url.clone(),
            auth_token: config.auth_token.clone(),
            client_id: config
                .client_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            device_name: "harbor".to_string(),
            request_timeout: config.request_timeout,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum Outbound<'a> {
    #[serde(rename = "register")]
    Register { payload: RegisterPayload<'a> },
    #[serde(rename = "rpc.request")]
    Request { payload: RequestPayload<'a> },
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPayload<'a> {
    device_id: &'a str,
    device_name: &'a str,
    target_device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_token: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestPayload<'a> {
    id: &'a str,
    method: &'a str,
    params: &'a Value,
    target_device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Inbound {
    #[serde(rename = "registered")]
    Registered {
        #[serde(default, rename = "resumeToken")]
        resume_token: Option<String>,
    },
    #[serde(rename = "resumed")]
    Resumed,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    #[serde(rename = "rpc.response")]
    Response { payload: ResponsePayload },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ResponsePayload {
    id: String,
    #[serde(flatten)]
    frame: ResponseFrame,
}

type FrameSender = mpsc::UnboundedSender<Result<ResponseFrame, RelayError>>;

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Mutex<HashMap<String, FrameSender>>,
    cancel: CancellationToken,
}

impl Link {
    fn route(&self, id: &str, frame: ResponseFrame) {
        let mut pending = self.pending.lock();
        let Some(sender) = pending.get(id) else {
            trace!(target = "harbor::relay", id, "dropping frame for unknown call");
            return;
        };
        let done = frame.is_final || frame.error.is_some();
        if sender.send(Ok(frame)).is_err() || done {
            pending.remove(id);
        }
    }

    fn fail_pending(&self, cause: &RelayError) {
        for (_, sender) in self.pending.lock().drain() {
            let _ = sender.send(Err(cause.clone()));
        }
    }
}

#[derive(Default)]
struct Shared {
    links: Mutex<HashMap<DeviceId, Arc<Link>>>,
    resume_tokens: Mutex<HashMap<DeviceId, String>>,
    observer: Mutex<Option<Weak<dyn LinkObserver>>>,
}

impl Shared {
    fn link_closed(&self, device: &DeviceId, link: &Link, cause: RelayError, notify: bool) {
        {
            let mut links = self.links.lock();
            if links.get(device).is_some_and(|l| l.generation == link.generation) {
                links.remove(device);
            }
        }
        link.fail_pending(&RelayError::Disconnected);
        if !notify {
            return;
        }
        let observer = self.observer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.link_lost(device, cause);
        }
    }
}

/// Relay client holding one websocket per paired device.
pub struct WebSocketRelay {
    config: WebSocketRelayConfig,
    shared: Arc<Shared>,
    generations: AtomicU64,
}

impl WebSocketRelay {
    pub fn new(config: WebSocketRelayConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            generations: AtomicU64::new(1),
        }
    }

    pub fn is_linked(&self, device: &DeviceId) -> bool {
        self.shared
            .links
            .lock()
            .get(device)
            .is_some_and(|link| !link.cancel.is_cancelled())
    }

    /// Closes the socket for `device` without reporting a link loss.
    pub fn disconnect(&self, device: &DeviceId) {
        if let Some(link) = self.shared.links.lock().remove(device) {
            link.cancel.cancel();
        }
    }

    pub fn disconnect_all(&self) {
        for (_, link) in self.shared.links.lock().drain() {
            link.cancel.cancel();
        }
    }

    fn endpoint(&self, device: &DeviceId) -> Result<Url, RelayError> {
        let mut url = self.config.relay_url.clone();
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(RelayError::InvalidUrl(format!(
                    "relay url must use ws or wss, got {other}"
                )));
            }
        }
        url.query_pairs_mut()
            .append_pair("targetDeviceId", device.as_str());
        Ok(url)
    }

    async fn handshake(&self, device: &DeviceId) -> Result<(), RelayError> {
        let url = self.endpoint(device)?;
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| RelayError::InvalidState(format!("auth token: {err}")))?;
            headers.insert("Authorization", value);
        }
        let client = HeaderValue::from_str(&self.config.client_id)
            .map_err(|err| RelayError::InvalidState(format!("client id: {err}")))?;
        headers.insert("X-Client-ID", client);

        let (socket, _) = connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let resume_token = self.shared.resume_tokens.lock().get(device).cloned();
        let register = serde_json::to_string(&Outbound::Register {
            payload: RegisterPayload {
                device_id: &self.config.client_id,
                device_name: &self.config.device_name,
                target_device_id: device.as_str(),
                resume_token: resume_token.as_deref(),
            },
        })?;
        sink.send(Message::Text(register)).await?;

        loop {
            let Some(message) = stream.next().await else {
                return Err(RelayError::Disconnected);
            };
            match message? {
                Message::Text(text) => match serde_json::from_str::<Inbound>(&text)? {
                    Inbound::Registered { resume_token } => {
                        if let Some(token) = resume_token {
                            self.shared.resume_tokens.lock().insert(device.clone(), token);
                        }
                        break;
                    }
                    Inbound::Resumed => break,
                    Inbound::Error { code, message } => {
                        self.shared.resume_tokens.lock().remove(device);
                        return Err(RelayError::server(
                            code.unwrap_or_else(|| "relay_error".to_string()),
                            message,
                        ));
                    }
                    _ => continue,
                },
                Message::Close(_) => return Err(RelayError::Disconnected),
                _ => continue,
            }
        }
        debug!(target = "harbor::relay", device = %device, "relay link registered");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let link = Arc::new(Link {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            outbound,
            pending: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        });
        if let Some(previous) = self
            .shared
            .links
            .lock()
            .insert(device.clone(), Arc::clone(&link))
        {
            previous.cancel.cancel();
        }

        let writer_cancel = link.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    next = outbound_rx.recv() => match next {
                        Some(message) => {
                            if let Err(err) = sink.send(message).await {
                                warn!(target = "harbor::relay", error = %err, "relay write failed");
                                writer_cancel.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        let device = device.clone();
        tokio::spawn(async move {
            let cause = loop {
                tokio::select! {
                    _ = link.cancel.cancelled() => break None,
                    next = stream.next() => match next {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Inbound>(&text) {
                            Ok(Inbound::Response { payload }) => link.route(&payload.id, payload.frame),
                            Ok(Inbound::Ping) => {
                                if let Ok(pong) = serde_json::to_string(&Outbound::Pong) {
                                    let _ = link.outbound.send(Message::Text(pong));
                                }
                            }
                            Ok(Inbound::Error { code, message }) => {
                                let err = RelayError::server(
                                    code.unwrap_or_else(|| "relay_error".to_string()),
                                    message,
                                );
                                warn!(target = "harbor::relay", device = %device, error = %err, "relay reported error");
                                if err.is_connection_loss() {
                                    break Some(err);
                                }
                            }
                            Ok(_) => {}
                            Err(err) => {
                                debug!(target = "harbor::relay", error = %err, "ignoring malformed relay frame");
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => break Some(RelayError::Disconnected),
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break Some(RelayError::from(err)),
                    },
                }
            };
            link.cancel.cancel();
            let notify = cause.is_some();
            shared.link_closed(
                &device,
                &link,
                cause.unwrap_or(RelayError::Disconnected),
                notify,
            );
        });
        Ok(())
    }
}

#[async_trait]
impl RelayConnector for WebSocketRelay {
    async fn connect(&self, device: &DeviceId) -> Result<(), RelayError> {
        if self.is_linked(device) {
            return Ok(());
        }
        self.handshake(device).await
    }

    fn set_link_observer(&self, observer: Weak<dyn LinkObserver>) {
        *self.shared.observer.lock() = Some(observer);
    }
}

#[async_trait]
impl RelayCommandChannel for WebSocketRelay {
    async fn invoke(
        &self,
        device: &DeviceId,
        request: RelayRequest,
    ) -> Result<FrameStream, RelayError> {
        let link = self
            .shared
            .links
            .lock()
            .get(device)
            .cloned()
            .ok_or(RelayError::NotConnected)?;
        if link.cancel.is_cancelled() {
            return Err(RelayError::NotConnected);
        }

        let id = Uuid::new_v4().to_string();
        let text = serde_json::to_string(&Outbound::Request {
            payload: RequestPayload {
                id: &id,
                method: &request.method,
                params: &request.params,
                target_device_id: device.as_str(),
                idempotency_key: request.idempotency_key.as_deref(),
            },
        })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        link.pending.lock().insert(id.clone(), sender);
        if link.outbound.send(Message::Text(text)).is_err() {
            link.pending.lock().remove(&id);
            return Err(RelayError::Disconnected);
        }
        trace!(
            target = "harbor::relay",
            device = %device,
            id = %id,
            method = %request.method,
            "relay call sent"
        );

        Ok(RouteStream {
            id,
            link: Arc::downgrade(&link),
            receiver,
            deadline: Box::pin(tokio::time::sleep(self.config.request_timeout)),
            done: false,
        }
        .boxed())
    }
}

/// Frames for one call id. Dropping it unregisters the route.
struct RouteStream {
    id: String,
    link: Weak<Link>,
    receiver: mpsc::UnboundedReceiver<Result<ResponseFrame, RelayError>>,
    deadline: Pin<Box<Sleep>>,
    done: bool,
}

impl Stream for RouteStream {
    type Item = Result<ResponseFrame, RelayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
            Poll::Ready(None) => {
                self.done = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }
        if self.deadline.as_mut().poll(cx).is_ready() {
            self.done = true;
            return Poll::Ready(Some(Err(RelayError::Timeout)));
        }
        Poll::Pending
    }
}

impl Drop for RouteStream {
    fn drop(&mut self) {
        if let Some(link) = self.link.upgrade() {
            link.pending.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayCall;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct CountingObserver(AtomicUsize);

    impl LinkObserver for CountingObserver {
        fn link_lost(&self, _device: &DeviceId, _cause: RelayError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn relay_for(addr: std::net::SocketAddr) -> WebSocketRelay {
        WebSocketRelay::new(WebSocketRelayConfig {
            relay_url: Url::parse(&format!("ws://{addr}/ws/mobile")).unwrap(),
            auth_token: Some("token".into()),
            client_id: "mobile-1".into(),
            device_name: "test".into(),
            request_timeout: Duration::from_secs(5),
        })
    }

    #[tokio::test]
    async fn registers_routes_frames_and_reports_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let register: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(register["type"], "register");
            assert_eq!(register["payload"]["targetDeviceId"], "desk-1");
            ws.send(Message::Text(json!({"type": "registered", "resumeToken": "r1"}).to_string()))
                .await
                .unwrap();

            let request: Value = match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(request["type"], "rpc.request");
            assert_eq!(request["payload"]["method"], "fs.listFolders");
            let id = request["payload"]["id"].as_str().unwrap().to_string();
            for frame in [
                json!({"type": "rpc.response", "payload": {"id": id, "result": ["a"], "isFinal": false}}),
                json!({"type": "rpc.response", "payload": {"id": id, "result": ["a", "b"]}}),
            ] {
                ws.send(Message::Text(frame.to_string())).await.unwrap();
            }
            ws.close(None).await.unwrap();
        });

        let relay = relay_for(addr);
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let weak: Weak<dyn LinkObserver> = Arc::downgrade(&observer) as Weak<dyn LinkObserver>;
        relay.set_link_observer(weak);

        let device = DeviceId::new("desk-1");
        relay.connect(&device).await.unwrap();
        assert!(relay.is_linked(&device));

        let value = RelayCall::request(
            &relay,
            &device,
            RelayRequest::new("fs.listFolders", json!({"directoryPath": "/home/user"})),
        )
        .await
        .unwrap();
        assert_eq!(value, json!(["a", "b"]));

        server.await.unwrap();
        for _ in 0..50 {
            if observer.0.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert!(!relay.is_linked(&device));
        assert_eq!(
            relay
                .invoke(&device, RelayRequest::new("job.get", json!({})))
                .await
                .err(),
            Some(RelayError::NotConnected)
        );
    }

    #[tokio::test]
    async fn relay_error_during_register_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                json!({"type": "error", "code": "deviceOwnershipFailed", "message": "not yours"})
                    .to_string(),
            ))
            .await
            .unwrap();
        });

        let relay = relay_for(addr);
        let err = relay.connect(&DeviceId::new("desk-9")).await.unwrap_err();
        assert!(err.requires_device_selection());
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        let relay = WebSocketRelay::new(WebSocketRelayConfig {
            relay_url: Url::parse("https://relay.example/ws").unwrap(),
            auth_token: None,
            client_id: "c".into(),
            device_name: "d".into(),
            request_timeout: Duration::from_secs(1),
        });
        assert!(matches!(
            relay.endpoint(&DeviceId::new("x")),
            Err(RelayError::InvalidUrl(_))
        ));
    }
}
