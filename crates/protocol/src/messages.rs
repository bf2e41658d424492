//! Gateway message envelopes.
//!
//! Every message on the subscription channel is one JSON object:
//! a correlation `id`, a `type` tag, an optional `payload`, and an
//! optional `error`. Requests carry client-chosen ids; acks and error
//! replies echo the request id, while server-initiated events mint
//! their own.

use depot_core::ProgressSnapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message types flowing over the subscription gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Inbound (client -> gateway)
    Subscribe,
    Unsubscribe,
    Ping,
    // Outbound (gateway -> client)
    Subscribed,
    Unsubscribed,
    Progress,
    Complete,
    Failed,
    Pong,
    Error,
}

/// Error details carried by an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: i32,
    pub message: String,
}

/// Why a message's payload could not be extracted.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("missing payload")]
    Missing,

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Envelope for all gateway communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

impl GatewayMessage {
    /// A message with no payload (pings, pongs, bare acks).
    pub fn bare(id: impl Into<String>, msg_type: MessageType) -> Self {
        Self {
            id: id.into(),
            msg_type,
            payload: None,
            error: None,
        }
    }

    /// A message carrying a serialized payload.
    pub fn with_payload<T: Serialize>(
        id: impl Into<String>,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut message = Self::bare(id, msg_type);
        message.payload = Some(serde_json::to_value(payload)?);
        Ok(message)
    }

    /// An `error` message with a code and description.
    pub fn failure(id: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        let mut reply = Self::bare(id, MessageType::Error);
        reply.error = Some(GatewayError {
            code,
            message: message.into(),
        });
        reply
    }

    /// A payload-free reply correlated to this request.
    pub fn ack(&self, msg_type: MessageType) -> Self {
        Self::bare(&self.id, msg_type)
    }

    /// A payload-carrying reply correlated to this request.
    pub fn ack_with<T: Serialize>(
        &self,
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Self::with_payload(&self.id, msg_type, payload)
    }

    /// An error reply correlated to this request.
    pub fn rejection(&self, code: i32, message: impl Into<String>) -> Self {
        Self::failure(&self.id, code, message)
    }

    /// Extract and deserialize the payload. Absent payloads are their
    /// own error so handlers can answer with a precise rejection.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        let value = self.payload.as_ref().ok_or(PayloadError::Missing)?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Payload for `subscribe` and `unsubscribe` requests, and for the
/// matching acks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribePayload {
    pub operation_id: String,
}

/// Payload for `progress` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub operation_id: String,
    pub snapshot: ProgressSnapshot,
}

/// Payload for `complete` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub operation_id: String,
}

/// Payload for `failed` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub operation_id: String,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_payload_roundtrips() {
        let payload = SubscribePayload {
            operation_id: "op-1".into(),
        };
        let msg =
            GatewayMessage::with_payload("m1", MessageType::Subscribe, &payload).unwrap();
        assert_eq!(msg.msg_type, MessageType::Subscribe);
        assert_eq!(msg.payload_as::<SubscribePayload>().unwrap(), payload);
    }

    #[test]
    fn bare_message_omits_optional_fields() {
        let msg = GatewayMessage::bare("m2", MessageType::Ping);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("payload"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn payload_extraction_errors_are_distinct() {
        let msg = GatewayMessage::bare("m3", MessageType::Subscribe);
        assert!(matches!(
            msg.payload_as::<SubscribePayload>(),
            Err(PayloadError::Missing)
        ));

        let mut msg = GatewayMessage::bare("m4", MessageType::Subscribe);
        msg.payload = Some(serde_json::json!({ "wrong_field": 1 }));
        assert!(matches!(
            msg.payload_as::<SubscribePayload>(),
            Err(PayloadError::Malformed(_))
        ));
    }

    #[test]
    fn failure_carries_code_and_message() {
        let msg = GatewayMessage::failure("m5", 404, "unknown operation");
        assert_eq!(msg.msg_type, MessageType::Error);
        let err = msg.error.unwrap();
        assert_eq!(err.code, 404);
        assert_eq!(err.message, "unknown operation");
    }

    #[test]
    fn acks_echo_the_request_id() {
        let request = GatewayMessage::bare("req-9", MessageType::Ping);
        let pong = request.ack(MessageType::Pong);
        assert_eq!(pong.id, "req-9");
        assert_eq!(pong.msg_type, MessageType::Pong);

        let payload = SubscribePayload {
            operation_id: "op-2".into(),
        };
        let ack = request
            .ack_with(MessageType::Subscribed, &payload)
            .unwrap();
        assert_eq!(ack.id, "req-9");

        let rejection = request.rejection(400, "bad");
        assert_eq!(rejection.id, "req-9");
        assert_eq!(rejection.msg_type, MessageType::Error);
    }

    #[test]
    fn wire_roundtrip() {
        let payload = FailedPayload {
            operation_id: "op-3".into(),
            error: "digest_mismatch".into(),
        };
        let msg = GatewayMessage::with_payload("m6", MessageType::Failed, &payload).unwrap();
        let json = serde_json::to_string(&msg).unwrap();

        let parsed: GatewayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.msg_type, MessageType::Failed);
        assert_eq!(parsed.payload_as::<FailedPayload>().unwrap(), payload);
    }

    #[test]
    fn type_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&MessageType::Subscribe).unwrap(),
            "\"subscribe\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::Pong).unwrap(),
            "\"pong\""
        );
    }
}
