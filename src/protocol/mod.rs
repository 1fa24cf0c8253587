//! Coordinator ↔ worker message protocol.
//!
//! Every message is a flat record; which fields are populated depends on `type`.
//! Any message expecting a reply carries an `id`, and the worker answers it with
//! exactly one `Ack` bearing the same `id`.

pub mod codec;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{CorrelationId, Digest, Error};

// =============================================================================
// Message Types
// =============================================================================

/// Discriminator carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Deploy,
    Invoke,
    Undeploy,
    SetConfig,
    Ping,
    GracefulShutdown,
    Ack,
    UncaughtException,
    /// Any type this build does not understand. Receivers ignore it.
    #[serde(other)]
    Unknown,
}

/// Outcome flag on an `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error,
}

/// A single coordinator ↔ worker message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "source_b64")]
    pub source: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
    /// Grace period in milliseconds (GracefulShutdown).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl WorkerMessage {
    fn of(kind: MessageType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn deploy(digest: Digest, source: Bytes) -> Self {
        Self {
            digest: Some(digest),
            source: Some(source),
            ..Self::of(MessageType::Deploy)
        }
    }

    pub fn invoke(digest: Digest, context: Value) -> Self {
        Self {
            digest: Some(digest),
            context: Some(context),
            ..Self::of(MessageType::Invoke)
        }
    }

    pub fn undeploy(digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..Self::of(MessageType::Undeploy)
        }
    }

    pub fn set_config(config: Map<String, Value>) -> Self {
        Self {
            config: Some(config),
            ..Self::of(MessageType::SetConfig)
        }
    }

    pub fn ping() -> Self {
        Self::of(MessageType::Ping)
    }

    pub fn graceful_shutdown(ttl_ms: u64) -> Self {
        Self {
            ttl: Some(ttl_ms),
            ..Self::of(MessageType::GracefulShutdown)
        }
    }

    pub fn ack_ok(id: CorrelationId, response: Value) -> Self {
        Self {
            id: Some(id),
            response: Some(response),
            status: Some(Status::Ok),
            ..Self::of(MessageType::Ack)
        }
    }

    pub fn ack_err(id: CorrelationId, error: impl Into<String>, code: Option<i64>) -> Self {
        Self {
            id: Some(id),
            error: Some(error.into()),
            error_code: code,
            status: Some(Status::Error),
            ..Self::of(MessageType::Ack)
        }
    }

    pub fn uncaught_exception(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            status: Some(Status::Error),
            ..Self::of(MessageType::UncaughtException)
        }
    }

    /// Set the correlation id, replacing any existing one.
    pub fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Interpret an `Ack` as the outcome of the request it answers.
    pub fn into_outcome(self) -> Result<Value, Error> {
        match self.status {
            Some(Status::Error) => Err(Error::worker(
                self.error.unwrap_or_else(|| "worker reported an error".to_string()),
                self.error_code,
            )),
            _ => Ok(self.response.unwrap_or(Value::Null)),
        }
    }
}

/// Base64 encoding of source bytes so arbitrary payloads survive JSON framing.
mod source_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(source: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match source {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|encoded| {
            STANDARD
                .decode(encoded.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let id = CorrelationId::from_string("c1").unwrap();
        let msg = WorkerMessage::ack_err(id, "Digest was not found", Some(404));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "Ack",
                "id": "c1",
                "error": "Digest was not found",
                "errorCode": 404,
                "status": "ERROR",
            })
        );
    }

    #[test]
    fn test_source_is_base64_on_the_wire() {
        let digest = Digest::from_string("d1").unwrap();
        let msg = WorkerMessage::deploy(digest, Bytes::from_static(b"double"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["source"], json!("ZG91Ymxl"));

        let back: WorkerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back.source.as_deref(), Some(&b"double"[..]));
    }

    #[test]
    fn test_unknown_type_decodes() {
        let msg: WorkerMessage =
            serde_json::from_value(json!({"type": "EXPAND_SANDBOX", "id": "x"})).unwrap();
        assert_eq!(msg.kind, Some(MessageType::Unknown));
    }

    #[test]
    fn test_ack_outcome() {
        let id = CorrelationId::new();
        let ok = WorkerMessage::ack_ok(id.clone(), json!({"value": 4}));
        assert_eq!(ok.into_outcome().unwrap(), json!({"value": 4}));

        let err = WorkerMessage::ack_err(id, "handler missing", Some(404))
            .into_outcome()
            .unwrap_err();
        assert_eq!(err.worker_code(), Some(404));
        assert!(err.to_string().contains("handler missing"));
    }
}
