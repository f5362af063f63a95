//! JSON wire codec for the gateway protocol.
//!
//! Every frame is an envelope `{"type": ..., "payload": {...}}`. Payload
//! keys are lowercase and unseparated (`callsid`, `voiceeventsid`); the
//! structs here carry the rename attributes so the rest of the crate can
//! use normal field names.

use crate::signaling::SignalingEvent;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unrecognized frame type {0:?}")]
    UnknownType(String),
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn envelope(kind: &str, payload: Value) -> String {
    json!({ "type": kind, "payload": payload }).to_string()
}

fn payload_as<T: DeserializeOwned + Default>(value: Value) -> Result<T, FrameError> {
    if value.is_null() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenLifetime {
    /// Remaining token validity in seconds.
    #[serde(default)]
    pub ttl: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConnectedInfo {
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub edge: Option<String>,
    /// Gateway URI owning this session, echoed back as the preferred URI.
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub token: Option<TokenLifetime>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InviteNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default)]
    pub parameters: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RingingNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    /// Client-generated id this notice retires, present on outgoing calls.
    #[serde(default, rename = "tempcallsid")]
    pub temp_call_sid: Option<String>,
    #[serde(default)]
    pub sdp: Option<String>,
}

impl RingingNotice {
    pub fn has_early_media(&self) -> bool {
        self.sdp.as_deref().is_some_and(|sdp| !sdp.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnswerNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default, rename = "tempcallsid")]
    pub temp_call_sid: Option<String>,
    /// Token for resuming this leg after a signaling outage.
    #[serde(default)]
    pub reconnect: Option<String>,
    #[serde(default)]
    pub edge: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CancelNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<u32>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "voiceeventsid")]
    pub voice_event_sid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HangupNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<ErrorBody>,
}

impl HangupNotice {
    pub fn error_code(&self) -> Option<u32> {
        self.error.as_ref().and_then(|e| e.code)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.message.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AckNotice {
    #[serde(default, rename = "acktype")]
    pub ack_type: String,
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default, rename = "voiceeventsid")]
    pub voice_event_sid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MessageNotice {
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default, rename = "contenttype")]
    pub content_type: Option<String>,
    #[serde(default, rename = "messagetype")]
    pub message_type: String,
    #[serde(default, rename = "voiceeventsid")]
    pub voice_event_sid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorNotice {
    #[serde(default)]
    pub error: Option<ErrorBody>,
    #[serde(default, rename = "callsid")]
    pub call_sid: Option<String>,
    #[serde(default, rename = "voiceeventsid")]
    pub voice_event_sid: Option<String>,
}

impl ErrorNotice {
    pub fn code(&self) -> Option<u32> {
        self.error.as_ref().and_then(|e| e.code)
    }

    pub fn message(&self) -> Option<&str> {
        self.error.as_ref().and_then(|e| e.message.as_deref())
    }

    /// Correlation id, accepted both at the top level and nested in the
    /// error body since the gateway has used both placements.
    pub fn voice_event_sid(&self) -> Option<&str> {
        self.voice_event_sid
            .as_deref()
            .or_else(|| self.error.as_ref().and_then(|e| e.voice_event_sid.as_deref()))
    }
}

/// An in-call message as it travels on the wire, both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessageFrame {
    #[serde(rename = "callsid")]
    pub call_sid: String,
    pub content: Value,
    #[serde(rename = "contenttype")]
    pub content_type: String,
    #[serde(rename = "messagetype")]
    pub message_type: String,
    #[serde(rename = "voiceeventsid")]
    pub voice_event_sid: String,
}

pub fn decode_frame(text: &str) -> Result<SignalingEvent, FrameError> {
    let frame: InboundFrame = serde_json::from_str(text)?;
    let event = match frame.kind.as_str() {
        "connected" => SignalingEvent::Connected(payload_as(frame.payload)?),
        "ready" => SignalingEvent::Ready,
        "offline" => SignalingEvent::Offline,
        "invite" => SignalingEvent::Invite(payload_as(frame.payload)?),
        "ringing" => SignalingEvent::Ringing(payload_as(frame.payload)?),
        "answer" => SignalingEvent::Answer(payload_as(frame.payload)?),
        "cancel" => SignalingEvent::Cancel(payload_as(frame.payload)?),
        "hangup" => SignalingEvent::Hangup(payload_as(frame.payload)?),
        "ack" => SignalingEvent::Ack(payload_as(frame.payload)?),
        "message" => SignalingEvent::Message(payload_as(frame.payload)?),
        "error" => SignalingEvent::Error(payload_as(frame.payload)?),
        other => return Err(FrameError::UnknownType(other.to_string())),
    };
    Ok(event)
}

pub fn listen(token: &str) -> String {
    envelope("listen", json!({ "token": token }))
}

pub fn register(available: bool) -> String {
    envelope("register", json!({ "available": available }))
}

pub fn invite(call_id: &str, sdp: &str, params: &IndexMap<String, String>) -> String {
    envelope(
        "invite",
        json!({
            "callsid": call_id,
            "sdp": sdp,
            "params": crate::token::encode_custom_parameters(params),
        }),
    )
}

pub fn answer(call_sid: &str, sdp: &str) -> String {
    envelope("answer", json!({ "callsid": call_sid, "sdp": sdp }))
}

pub fn reconnect(sdp: &str, call_sid: &str, reconnect_token: &str) -> String {
    envelope(
        "reconnect",
        json!({ "callsid": call_sid, "sdp": sdp, "reconnect": reconnect_token }),
    )
}

pub fn hangup(call_sid: &str, message: Option<&str>) -> String {
    let mut payload = json!({ "callsid": call_sid });
    if let (Some(message), Some(map)) = (message, payload.as_object_mut()) {
        map.insert("message".to_string(), Value::String(message.to_string()));
    }
    envelope("hangup", payload)
}

pub fn reject(call_sid: &str) -> String {
    envelope("reject", json!({ "callsid": call_sid }))
}

pub fn dtmf(call_sid: &str, digit: char) -> String {
    envelope("dtmf", json!({ "callsid": call_sid, "dtmf": digit.to_string() }))
}

pub fn call_message(frame: &CallMessageFrame) -> Result<String, FrameError> {
    Ok(envelope("message", serde_json::to_value(frame)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connected_with_token_ttl() {
        let text = r#"{"type":"connected","payload":{"region":"us1","edge":"ashburn","token":{"ttl":600}}}"#;
        let SignalingEvent::Connected(info) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(info.region.as_deref(), Some("us1"));
        assert_eq!(info.edge.as_deref(), Some("ashburn"));
        assert_eq!(info.token, Some(TokenLifetime { ttl: 600 }));
    }

    #[test]
    fn test_decode_connected_without_payload() {
        let SignalingEvent::Connected(info) = decode_frame(r#"{"type":"connected"}"#).unwrap()
        else {
            panic!("wrong event");
        };
        assert_eq!(info, ConnectedInfo::default());
    }

    #[test]
    fn test_decode_invite_keeps_raw_parameters() {
        let text = r#"{"type":"invite","payload":{"callsid":"CA1","sdp":"v=0","parameters":{"From":"client:bob","Params":"a=1&b=2"}}}"#;
        let SignalingEvent::Invite(invite) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(invite.call_sid.as_deref(), Some("CA1"));
        assert_eq!(invite.parameters.get("Params").map(String::as_str), Some("a=1&b=2"));
    }

    #[test]
    fn test_decode_ringing_early_media() {
        let text = r#"{"type":"ringing","payload":{"callsid":"CA1","tempcallsid":"TJ1","sdp":"v=0"}}"#;
        let SignalingEvent::Ringing(ringing) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert!(ringing.has_early_media());
        assert_eq!(ringing.temp_call_sid.as_deref(), Some("TJ1"));

        let text = r#"{"type":"ringing","payload":{"callsid":"CA1"}}"#;
        let SignalingEvent::Ringing(ringing) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert!(!ringing.has_early_media());
    }

    #[test]
    fn test_decode_error_nested_voice_event_sid() {
        let text = r#"{"type":"error","payload":{"callsid":"CA1","error":{"code":31210,"message":"bad type","voiceeventsid":"KX1"}}}"#;
        let SignalingEvent::Error(notice) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(notice.code(), Some(31210));
        assert_eq!(notice.voice_event_sid(), Some("KX1"));

        let text = r#"{"type":"error","payload":{"voiceeventsid":"KX2","error":{"code":31212}}}"#;
        let SignalingEvent::Error(notice) = decode_frame(text).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(notice.voice_event_sid(), Some("KX2"));
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_bad_json() {
        assert!(matches!(
            decode_frame(r#"{"type":"party","payload":{}}"#),
            Err(FrameError::UnknownType(t)) if t == "party"
        ));
        assert!(matches!(decode_frame("{nope"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_encode_register_and_listen() {
        let frame: Value = serde_json::from_str(&register(true)).unwrap();
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["payload"]["available"], true);

        let frame: Value = serde_json::from_str(&listen("jwt")).unwrap();
        assert_eq!(frame["type"], "listen");
        assert_eq!(frame["payload"]["token"], "jwt");
    }

    #[test]
    fn test_encode_hangup_omits_missing_message() {
        let frame: Value = serde_json::from_str(&hangup("CA1", None)).unwrap();
        assert!(frame["payload"].get("message").is_none());

        let frame: Value = serde_json::from_str(&hangup("CA1", Some("busy"))).unwrap();
        assert_eq!(frame["payload"]["message"], "busy");
    }

    #[test]
    fn test_call_message_round_trip() {
        let frame = CallMessageFrame {
            call_sid: "CA1".to_string(),
            content: json!({"k": "v"}),
            content_type: "application/json".to_string(),
            message_type: "user-defined-message".to_string(),
            voice_event_sid: "KX1".to_string(),
        };
        let text = call_message(&frame).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["payload"]["callsid"], "CA1");
        assert_eq!(value["payload"]["voiceeventsid"], "KX1");

        let SignalingEvent::Message(notice) = decode_frame(&text).unwrap() else {
            panic!("wrong event");
        };
        assert_eq!(notice.voice_event_sid.as_deref(), Some("KX1"));
        assert_eq!(notice.content, json!({"k": "v"}));
    }
}
