#![forbid(unsafe_code)]

// Signaling protocol - request/response envelopes, typed payloads, room events

use crate::media::MediaError;
use mediasoup::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Client -> server request. Every request is answered by exactly one
/// response carrying the same requestId; events are pushed without one.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId", default)]
    pub request_id: Value,
    #[serde(default)]
    pub payload: Value,
}

/// Server -> client response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: Value,
    pub ok: bool,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn ok(request_id: Value, data: Value) -> Self {
        Self {
            kind: "response",
            request_id,
            ok: true,
            data,
        }
    }

    pub fn err(request_id: Value, error: &str) -> Self {
        Self {
            kind: "response",
            request_id,
            ok: false,
            data: json!({ "error": error }),
        }
    }
}

// --- request payloads ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub room_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProducersPayload {
    pub session_id: Option<String>,
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportPayload {
    pub session_id: Option<String>,
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    pub session_id: Option<String>,
    pub direction: Option<String>,
    pub dtls_parameters: Option<DtlsParameters>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducePayload {
    pub session_id: Option<String>,
    pub kind: Option<String>,
    pub rtp_parameters: Option<RtpParameters>,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumePayload {
    pub session_id: Option<String>,
    pub producer_id: Option<String>,
    pub rtp_capabilities: Option<RtpCapabilities>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerControlPayload {
    pub session_id: Option<String>,
    pub producer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerControlPayload {
    pub session_id: Option<String>,
    pub consumer_id: Option<String>,
}

// --- response data ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinData {
    pub room_id: String,
    pub session_id: String,
    pub peer_id: String,
    pub rtp_capabilities: RtpCapabilitiesFinalized,
    pub existing_peers: Vec<PeerSummary>,
    pub existing_producers: Vec<ProducerSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeData {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

// --- events ---

/// Server-pushed events; no requestId.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Sent unsolicited on accept, and again after a successful join or
    /// resumeSession with the room snapshot filled in.
    #[serde(rename_all = "camelCase")]
    Welcome {
        peer_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        hint: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_peers: Option<Vec<PeerSummary>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_producers: Option<Vec<ProducerSummary>>,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
        reason: &'static str,
    },
    #[serde(rename_all = "camelCase")]
    ProducerSpeaking {
        producer_id: String,
        peer_id: String,
        speaking: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        volume: Option<i8>,
    },
}

/// Protocol-level failures. Display strings are the wire surface carried in
/// response `data.error`.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("not_authed")]
    NotAuthed,
    #[error("invalid sessionId")]
    InvalidSessionId,
    #[error("roomId required")]
    RoomIdRequired,
    #[error("roomId mismatch")]
    RoomIdMismatch,
    #[error("peerId mismatch")]
    PeerIdMismatch,
    #[error("sessionId mismatch")]
    SessionIdMismatch,
    #[error("peer not found")]
    PeerNotFound,
    #[error("room not found")]
    RoomNotFound,
    #[error("room not joined")]
    RoomNotJoined,
    #[error("invalid direction")]
    InvalidDirection,
    #[error("invalid kind")]
    InvalidKind,
    #[error("missing dtlsParameters")]
    MissingDtlsParameters,
    #[error("missing rtpParameters")]
    MissingRtpParameters,
    #[error("missing rtpCapabilities")]
    MissingRtpCapabilities,
    #[error("transport not found")]
    TransportNotFound,
    #[error("send transport not ready")]
    SendTransportNotReady,
    #[error("recv transport not ready")]
    RecvTransportNotReady,
    #[error("producer not found")]
    ProducerNotFound,
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error("cannot consume")]
    CannotConsume,
    #[error("cannot consume self")]
    CannotConsumeSelf,
    #[error("unknown type")]
    UnknownType,
    #[error("bad payload: {0}")]
    BadPayload(String),
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope_parses_with_numeric_request_id() {
        let envelope: RequestEnvelope = serde_json::from_str(
            r#"{"type":"join","requestId":1,"payload":{"roomId":"r1","sessionId":"s1"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.kind, "join");
        assert_eq!(envelope.request_id, json!(1));

        let payload: JoinPayload = serde_json::from_value(envelope.payload).unwrap();
        assert_eq!(payload.room_id.as_deref(), Some("r1"));
        assert_eq!(payload.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn request_envelope_tolerates_missing_payload() {
        let envelope: RequestEnvelope =
            serde_json::from_str(r#"{"type":"listProducers","requestId":"abc"}"#).unwrap();
        assert_eq!(envelope.payload, Value::Null);
        let payload: ListProducersPayload = serde_json::from_value(json!({})).unwrap();
        assert!(payload.session_id.is_none());
    }

    #[test]
    fn response_envelope_shapes() {
        let ok = ResponseEnvelope::ok(json!(7), json!({ "producerId": "P" }));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["requestId"], 7);
        assert_eq!(value["ok"], true);
        assert_eq!(value["data"]["producerId"], "P");

        let err = ResponseEnvelope::err(json!(8), &SignalError::RoomNotJoined.to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["data"]["error"], "room not joined");
    }

    #[test]
    fn events_carry_camel_case_tags() {
        let event = ServerEvent::PeerJoined {
            peer_id: "p2".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "peerJoined");
        assert_eq!(value["peerId"], "p2");

        let event = ServerEvent::NewProducer {
            producer_id: "P".to_string(),
            peer_id: "p1".to_string(),
            kind: MediaKind::Audio,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "newProducer");
        assert_eq!(value["kind"], "audio");

        let event = ServerEvent::ProducerClosed {
            producer_id: "P".to_string(),
            peer_id: "p1".to_string(),
            kind: MediaKind::Audio,
            reason: "left",
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "producerClosed");
        assert_eq!(value["reason"], "left");
    }

    #[test]
    fn speaking_event_omits_volume_when_absent() {
        let stopped = ServerEvent::ProducerSpeaking {
            producer_id: "P".to_string(),
            peer_id: "p1".to_string(),
            speaking: false,
            volume: None,
        };
        let value = serde_json::to_value(&stopped).unwrap();
        assert_eq!(value["type"], "producerSpeaking");
        assert_eq!(value["speaking"], false);
        assert!(value.get("volume").is_none());

        let speaking = ServerEvent::ProducerSpeaking {
            producer_id: "P".to_string(),
            peer_id: "p1".to_string(),
            speaking: true,
            volume: Some(-42),
        };
        let value = serde_json::to_value(&speaking).unwrap();
        assert_eq!(value["volume"], -42);
    }

    #[test]
    fn welcome_omits_snapshot_until_join() {
        let greeting = ServerEvent::Welcome {
            peer_id: "p1".to_string(),
            session_id: None,
            hint: "send join or resumeSession".to_string(),
            existing_peers: None,
            existing_producers: None,
        };
        let value = serde_json::to_value(&greeting).unwrap();
        assert_eq!(value["type"], "welcome");
        assert_eq!(value["peerId"], "p1");
        assert!(value.get("sessionId").is_none());
        assert!(value.get("existingPeers").is_none());
    }

    #[test]
    fn error_strings_match_the_wire_surface() {
        assert_eq!(SignalError::NotAuthed.to_string(), "not_authed");
        assert_eq!(SignalError::InvalidSessionId.to_string(), "invalid sessionId");
        assert_eq!(SignalError::RoomIdRequired.to_string(), "roomId required");
        assert_eq!(SignalError::RoomIdMismatch.to_string(), "roomId mismatch");
        assert_eq!(SignalError::PeerIdMismatch.to_string(), "peerId mismatch");
        assert_eq!(
            SignalError::SendTransportNotReady.to_string(),
            "send transport not ready"
        );
        assert_eq!(
            SignalError::MissingDtlsParameters.to_string(),
            "missing dtlsParameters"
        );
        assert_eq!(
            SignalError::CannotConsumeSelf.to_string(),
            "cannot consume self"
        );
        assert_eq!(SignalError::UnknownType.to_string(), "unknown type");
    }
}
