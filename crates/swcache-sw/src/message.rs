//! Control-plane messages exchanged with a managing client.
//!
//! Messages are JSON objects `{"type": ..., "payload": ...}`. Replies travel
//! back over a one-shot port attached to the message; commands without a
//! reply simply drop it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, oneshot};

use crate::error::ServiceWorkerError;

/// A command understood by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Promote a waiting worker immediately.
    SkipWaiting,
    /// Report the version tag.
    GetVersion,
    /// Delete every non-active generation.
    CleanCache,
    /// Fetch one resource into the active generation.
    CacheUrl { url: String },
}

/// Wire shape of a message before its type is known.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: JsonValue,
}

#[derive(Debug, Deserialize)]
struct CacheUrlPayload {
    url: String,
}

impl ControlMessage {
    /// Decode a message. Unknown types and bad payloads are errors; commands
    /// that take no payload ignore whatever payload they carry.
    pub fn parse(data: &JsonValue) -> Result<Self, ServiceWorkerError> {
        let invalid =
            |e: serde_json::Error| ServiceWorkerError::InvalidMessage(format!("{e}: {data}"));
        let raw: RawMessage = serde_json::from_value(data.clone()).map_err(invalid)?;

        match raw.kind.as_str() {
            "SKIP_WAITING" => Ok(ControlMessage::SkipWaiting),
            "GET_VERSION" => Ok(ControlMessage::GetVersion),
            "CLEAN_CACHE" => Ok(ControlMessage::CleanCache),
            "CACHE_URL" => {
                let payload: CacheUrlPayload =
                    serde_json::from_value(raw.payload).map_err(invalid)?;
                Ok(ControlMessage::CacheUrl { url: payload.url })
            }
            other => Err(ServiceWorkerError::InvalidMessage(format!(
                "unknown message type {other}"
            ))),
        }
    }

    pub fn to_value(&self) -> JsonValue {
        match self {
            ControlMessage::SkipWaiting => json!({ "type": "SKIP_WAITING" }),
            ControlMessage::GetVersion => json!({ "type": "GET_VERSION" }),
            ControlMessage::CleanCache => json!({ "type": "CLEAN_CACHE" }),
            ControlMessage::CacheUrl { url } => {
                json!({ "type": "CACHE_URL", "payload": { "url": url } })
            }
        }
    }
}

/// Reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version { version: String },
    Success { success: bool },
    Error { error: String },
}

impl ControlReply {
    pub fn success() -> Self {
        Self::Success { success: true }
    }

    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    pub fn into_value(self) -> JsonValue {
        match self {
            ControlReply::Version { version } => json!({ "version": version }),
            ControlReply::Success { success } => json!({ "success": success }),
            ControlReply::Error { error } => json!({ "error": error }),
        }
    }
}

/// A message plus the port its reply goes to.
#[derive(Debug)]
pub struct MessageEnvelope {
    pub data: JsonValue,
    pub reply_to: Option<oneshot::Sender<JsonValue>>,
}

impl MessageEnvelope {
    /// Message expecting a reply.
    pub fn request(data: JsonValue) -> (Self, oneshot::Receiver<JsonValue>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                data,
                reply_to: Some(tx),
            },
            rx,
        )
    }

    /// Fire-and-forget message.
    pub fn notify(data: JsonValue) -> Self {
        Self {
            data,
            reply_to: None,
        }
    }
}

/// Client end of the channel to a running worker.
#[derive(Debug, Clone)]
pub struct MessagePort {
    tx: mpsc::Sender<MessageEnvelope>,
}

impl MessagePort {
    pub fn new(tx: mpsc::Sender<MessageEnvelope>) -> Self {
        Self { tx }
    }

    /// Send a message and wait for its reply. `None` when the command has no reply.
    pub async fn post_message(
        &self,
        data: JsonValue,
    ) -> Result<Option<JsonValue>, ServiceWorkerError> {
        let (envelope, reply) = MessageEnvelope::request(data);
        self.tx
            .send(envelope)
            .await
            .map_err(|_| ServiceWorkerError::StateError("worker is gone".to_string()))?;
        Ok(reply.await.ok())
    }

    /// Send a message without waiting for anything.
    pub async fn notify(&self, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(MessageEnvelope::notify(data))
            .await
            .map_err(|_| ServiceWorkerError::StateError("worker is gone".to_string()))
    }
}
