//! Connect token codec.
//!
//! A connect token is the opaque string handed out when a call reaches the
//! answered state. It packs everything needed to re-dial the same call leg
//! later: the original invite parameters, the custom parameter map and the
//! gateway's signaling reconnect token. The wire form is
//! `base64(urlencode(json))`.

use crate::errors::VoiceError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectToken {
    pub parameters: IndexMap<String, String>,
    #[serde(default)]
    pub custom_parameters: IndexMap<String, String>,
    pub signaling_reconnect_token: String,
}

impl ConnectToken {
    pub fn encode(&self) -> Result<String, VoiceError> {
        let json = serde_json::to_string(self)
            .map_err(|e| VoiceError::InvalidArgument(format!("token serialization: {e}")))?;
        Ok(BASE64.encode(urlencoding::encode(&json).as_bytes()))
    }

    pub fn decode(raw: &str) -> Result<Self, VoiceError> {
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|e| VoiceError::InvalidArgument(format!("token is not base64: {e}")))?;
        let encoded = String::from_utf8(bytes)
            .map_err(|e| VoiceError::InvalidArgument(format!("token is not utf-8: {e}")))?;
        let json = urlencoding::decode(&encoded)
            .map_err(|e| VoiceError::InvalidArgument(format!("token is not url-encoded: {e}")))?;
        let token: ConnectToken = serde_json::from_str(&json)
            .map_err(|e| VoiceError::InvalidArgument(format!("token is not valid json: {e}")))?;
        token.validate()?;
        Ok(token)
    }

    fn validate(&self) -> Result<(), VoiceError> {
        if !self.parameters.contains_key("CallSid") {
            return Err(VoiceError::InvalidArgument(
                "connect token is missing the CallSid parameter".to_string(),
            ));
        }
        if self.signaling_reconnect_token.is_empty() {
            return Err(VoiceError::InvalidArgument(
                "connect token is missing the signaling reconnect token".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_sid(&self) -> &str {
        self.parameters
            .get("CallSid")
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Serializes a custom parameter map into the `Params` form used on the
/// invite wire, `key=value` pairs joined by `&`, both sides url-encoded.
pub(crate) fn encode_custom_parameters(params: &IndexMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Inverse of [`encode_custom_parameters`]. A pair without `=` is kept as
/// a key with an empty value. Undecodable fragments are kept verbatim.
pub(crate) fn parse_custom_parameters(raw: &str) -> IndexMap<String, String> {
    let mut out = IndexMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = urlencoding::decode(key)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| value.to_string());
        out.insert(key, value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_token() -> ConnectToken {
        let mut parameters = IndexMap::new();
        parameters.insert("CallSid".to_string(), "CA00000000000000000000000000000000".to_string());
        parameters.insert("From".to_string(), "client:alice".to_string());
        let mut custom_parameters = IndexMap::new();
        custom_parameters.insert("team".to_string(), "support desk".to_string());
        ConnectToken {
            parameters,
            custom_parameters,
            signaling_reconnect_token: "rt-12345".to_string(),
        }
    }

    #[test]
    fn test_round_trip() {
        let token = sample_token();
        let raw = token.encode().unwrap();
        let decoded = ConnectToken::decode(&raw).unwrap();
        assert_eq!(decoded, token);
        assert_eq!(decoded.call_sid(), "CA00000000000000000000000000000000");
    }

    #[test]
    fn test_decode_accepts_minimal_token() {
        // Older gateways omit customParameters entirely.
        let json = r#"{"parameters":{"CallSid":"CA00000000000000000000000000000000"},"signalingReconnectToken":"rt-12345"}"#;
        let raw = BASE64.encode(urlencoding::encode(json).as_bytes());
        let token = ConnectToken::decode(&raw).unwrap();
        assert_eq!(token.call_sid(), "CA00000000000000000000000000000000");
        assert_eq!(token.signaling_reconnect_token, "rt-12345");
        assert!(token.custom_parameters.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ConnectToken::decode("not base64 at all!!!").is_err());
        let not_json = BASE64.encode(urlencoding::encode("hello world").as_bytes());
        assert!(ConnectToken::decode(&not_json).is_err());
    }

    #[test]
    fn test_decode_requires_call_sid_and_reconnect_token() {
        let mut token = sample_token();
        token.parameters.shift_remove("CallSid");
        let raw = token.encode().unwrap();
        assert!(ConnectToken::decode(&raw).is_err());

        let mut token = sample_token();
        token.signaling_reconnect_token.clear();
        let raw = token.encode().unwrap();
        assert!(ConnectToken::decode(&raw).is_err());
    }

    #[test]
    fn test_custom_parameter_wire_form() {
        let mut params = IndexMap::new();
        params.insert("team".to_string(), "support desk".to_string());
        params.insert("priority".to_string(), "a&b".to_string());
        let wire = encode_custom_parameters(&params);
        assert_eq!(wire, "team=support%20desk&priority=a%26b");
        assert_eq!(parse_custom_parameters(&wire), params);
    }

    #[test]
    fn test_parse_tolerates_bare_keys() {
        let parsed = parse_custom_parameters("flag&k=v");
        assert_eq!(parsed.get("flag").map(String::as_str), Some(""));
        assert_eq!(parsed.get("k").map(String::as_str), Some("v"));
    }
}
