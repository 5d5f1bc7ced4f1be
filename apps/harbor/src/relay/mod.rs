//! Command channel to a paired desktop through the relay.
//!
//! A call yields a finite, non-restartable stream of [`ResponseFrame`]s. The call is
//! complete at the first frame with `is_final`, at the first error frame, or when the
//! stream ends. Dropping the stream abandons the call; implementations stop routing
//! frames to it.

pub mod mock;
pub mod websocket;

use std::sync::Weak;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::DeviceId;
use crate::error::{FrameError, RelayError};

fn default_final() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
    #[serde(default = "default_final")]
    pub is_final: bool,
}

impl ResponseFrame {
    pub fn result(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
            is_final: true,
        }
    }

    pub fn partial(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
            is_final: false,
        }
    }

    pub fn error(error: FrameError) -> Self {
        Self {
            result: None,
            error: Some(error),
            is_final: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub method: String,
    pub params: Value,
    pub idempotency_key: Option<String>,
}

impl RelayRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

pub type FrameStream = BoxStream<'static, Result<ResponseFrame, RelayError>>;

#[async_trait]
pub trait RelayCommandChannel: Send + Sync {
    async fn invoke(
        &self,
        device: &DeviceId,
        request: RelayRequest,
    ) -> Result<FrameStream, RelayError>;
}

/// Establishes the relay route to one device.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, device: &DeviceId) -> Result<(), RelayError>;

    /// Registers who hears about routes that drop after a successful connect.
    fn set_link_observer(&self, observer: Weak<dyn LinkObserver>);
}

pub trait LinkObserver: Send + Sync {
    fn link_lost(&self, device: &DeviceId, cause: RelayError);
}

/// Helpers for consuming a [`FrameStream`].
pub struct RelayCall;

impl RelayCall {
    /// Drains `stream` to completion and returns the last result payload, or
    /// `Value::Null` when the call finished without one.
    pub async fn drain(stream: FrameStream) -> Result<Value, RelayError> {
        Self::drain_with(stream, |_| {}).await
    }

    /// Like [`RelayCall::drain`], handing every intermediate result to `on_result`.
    pub async fn drain_with<F>(mut stream: FrameStream, mut on_result: F) -> Result<Value, RelayError>
    where
        F: FnMut(&Value) + Send,
    {
        let mut last = None;
        while let Some(frame) = stream.next().await {
            let frame = frame?;
            if let Some(error) = frame.error {
                return Err(error.into());
            }
            if let Some(result) = frame.result {
                on_result(&result);
                last = Some(result);
            }
            if frame.is_final {
                break;
            }
        }
        Ok(last.unwrap_or(Value::Null))
    }

    pub async fn request(
        channel: &dyn RelayCommandChannel,
        device: &DeviceId,
        request: RelayRequest,
    ) -> Result<Value, RelayError> {
        let stream = channel.invoke(device, request).await?;
        Self::drain(stream).await
    }
}
