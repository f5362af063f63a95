//! Error taxonomy: synchronous API errors plus the numeric protocol
//! error catalog shared with the gateway.

use crate::signaling::SignalingError;
use thiserror::Error;

/// Synchronous failures returned by `Device` and `Call` methods.
///
/// Asynchronous protocol failures never surface here; they are delivered
/// through the `error` event channels as [`ProtocolError`] values.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("registration failed: {0}")]
    Registration(String),
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("media error: {0}")]
    Media(#[from] crate::media::MediaError),
}

/// Broad grouping of the numeric protocol error space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authorization,
    General,
    MalformedRequest,
    UserMedia,
    Client,
    SipServer,
    Signaling,
    Media,
    Other,
}

pub fn category_for_code(code: u32) -> ErrorCategory {
    match code {
        20100..=20199 | 31200..=31299 => ErrorCategory::Authorization,
        31000..=31099 => ErrorCategory::General,
        31100..=31199 => ErrorCategory::MalformedRequest,
        31401 | 31402 => ErrorCategory::UserMedia,
        31400..=31499 => ErrorCategory::Client,
        31600..=31699 | 31800..=31899 => ErrorCategory::SipServer,
        53000..=53099 => ErrorCategory::Signaling,
        53400..=53499 => ErrorCategory::Media,
        _ => ErrorCategory::Other,
    }
}

/// Every named error the gateway or the client can raise, keyed by its
/// numeric code. Codes without a named kind still resolve to a category
/// through [`category_for_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // 201xx access token validation
    AccessTokenInvalid,
    AccessTokenHeaderInvalid,
    AccessTokenIssuerInvalid,
    AccessTokenExpired,
    AccessTokenNotYetValid,
    AccessTokenGrantsInvalid,
    AuthenticationFailed,
    // 310xx general
    Unknown,
    ApplicationNotFound,
    ConnectionDeclined,
    ConnectionTimeout,
    ConnectionError,
    CallCancelled,
    TransportError,
    // 311xx malformed request
    MalformedRequest,
    MissingParameter,
    AuthorizationTokenMissing,
    MaxParameterLengthExceeded,
    InvalidBridgeToken,
    InvalidClientName,
    ReconnectParameterInvalid,
    // 312xx authorization
    AuthorizationError,
    InvalidJwtToken,
    TokenExpired,
    RateExceeded,
    CallMessageEventTypeInvalid,
    PayloadSizeExceeded,
    // 314xx user media
    PermissionDenied,
    AcquisitionFailed,
    // 314xx client
    BadRequest,
    Forbidden,
    NotFound,
    RequestTimeout,
    TemporarilyUnavailable,
    CallDoesNotExist,
    AddressIncomplete,
    BusyHere,
    RequestTerminated,
    // 316xx SIP server
    BusyEverywhere,
    Decline,
    DoesNotExistAnywhere,
    // 530xx signaling
    SignalingConnectionError,
    SignalingConnectionDisconnected,
    SignalingConnectionTimeout,
    // 534xx media
    ClientLocalDescFailed,
    ClientRemoteDescFailed,
    MediaConnectionError,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            ErrorKind::AccessTokenInvalid => 20101,
            ErrorKind::AccessTokenHeaderInvalid => 20102,
            ErrorKind::AccessTokenIssuerInvalid => 20103,
            ErrorKind::AccessTokenExpired => 20104,
            ErrorKind::AccessTokenNotYetValid => 20105,
            ErrorKind::AccessTokenGrantsInvalid => 20106,
            ErrorKind::AuthenticationFailed => 20151,
            ErrorKind::Unknown => 31000,
            ErrorKind::ApplicationNotFound => 31001,
            ErrorKind::ConnectionDeclined => 31002,
            ErrorKind::ConnectionTimeout => 31003,
            ErrorKind::ConnectionError => 31005,
            ErrorKind::CallCancelled => 31008,
            ErrorKind::TransportError => 31009,
            ErrorKind::MalformedRequest => 31100,
            ErrorKind::MissingParameter => 31101,
            ErrorKind::AuthorizationTokenMissing => 31102,
            ErrorKind::MaxParameterLengthExceeded => 31103,
            ErrorKind::InvalidBridgeToken => 31104,
            ErrorKind::InvalidClientName => 31105,
            ErrorKind::ReconnectParameterInvalid => 31107,
            ErrorKind::AuthorizationError => 31201,
            ErrorKind::InvalidJwtToken => 31204,
            ErrorKind::TokenExpired => 31205,
            ErrorKind::RateExceeded => 31206,
            ErrorKind::CallMessageEventTypeInvalid => 31210,
            ErrorKind::PayloadSizeExceeded => 31212,
            ErrorKind::PermissionDenied => 31401,
            ErrorKind::AcquisitionFailed => 31402,
            ErrorKind::BadRequest => 31400,
            ErrorKind::Forbidden => 31403,
            ErrorKind::NotFound => 31404,
            ErrorKind::RequestTimeout => 31408,
            ErrorKind::TemporarilyUnavailable => 31480,
            ErrorKind::CallDoesNotExist => 31481,
            ErrorKind::AddressIncomplete => 31484,
            ErrorKind::BusyHere => 31486,
            ErrorKind::RequestTerminated => 31487,
            ErrorKind::BusyEverywhere => 31600,
            ErrorKind::Decline => 31603,
            ErrorKind::DoesNotExistAnywhere => 31604,
            ErrorKind::SignalingConnectionError => 53000,
            ErrorKind::SignalingConnectionDisconnected => 53001,
            ErrorKind::SignalingConnectionTimeout => 53002,
            ErrorKind::ClientLocalDescFailed => 53400,
            ErrorKind::ClientRemoteDescFailed => 53402,
            ErrorKind::MediaConnectionError => 53405,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::AccessTokenInvalid => "Invalid access token",
            ErrorKind::AccessTokenHeaderInvalid => "Invalid access token header",
            ErrorKind::AccessTokenIssuerInvalid => "Invalid access token issuer or subject",
            ErrorKind::AccessTokenExpired => "Access token expired or expiration date invalid",
            ErrorKind::AccessTokenNotYetValid => "Access token not yet valid",
            ErrorKind::AccessTokenGrantsInvalid => "Invalid access token grants",
            ErrorKind::AuthenticationFailed => "Authentication failed",
            ErrorKind::Unknown => "Unknown error",
            ErrorKind::ApplicationNotFound => "Application not found",
            ErrorKind::ConnectionDeclined => "Connection declined",
            ErrorKind::ConnectionTimeout => "Connection timeout",
            ErrorKind::ConnectionError => "Connection error",
            ErrorKind::CallCancelled => "Call cancelled",
            ErrorKind::TransportError => "Transport error",
            ErrorKind::MalformedRequest => "Malformed request",
            ErrorKind::MissingParameter => "Missing parameter array in request",
            ErrorKind::AuthorizationTokenMissing => "Authorization token missing in request",
            ErrorKind::MaxParameterLengthExceeded => "Length of parameters or headers exceeded",
            ErrorKind::InvalidBridgeToken => "Invalid bridge token",
            ErrorKind::InvalidClientName => "Invalid client name",
            ErrorKind::ReconnectParameterInvalid => "Reconnect parameter is invalid",
            ErrorKind::AuthorizationError => "Authorization error",
            ErrorKind::InvalidJwtToken => "Invalid JWT token",
            ErrorKind::TokenExpired => "JWT token expired",
            ErrorKind::RateExceeded => "Rate exceeded authorized limit",
            ErrorKind::CallMessageEventTypeInvalid => "Call message event type invalid",
            ErrorKind::PayloadSizeExceeded => "Call message payload size exceeded authorized limit",
            ErrorKind::PermissionDenied => "User denied access to microphone",
            ErrorKind::AcquisitionFailed => "Error acquiring media",
            ErrorKind::BadRequest => "Bad request",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not found",
            ErrorKind::RequestTimeout => "Request terminated",
            ErrorKind::TemporarilyUnavailable => "Temporarily unavailable",
            ErrorKind::CallDoesNotExist => "Call transaction does not exist",
            ErrorKind::AddressIncomplete => "Address incomplete",
            ErrorKind::BusyHere => "Busy here",
            ErrorKind::RequestTerminated => "Request terminated",
            ErrorKind::BusyEverywhere => "Busy everywhere",
            ErrorKind::Decline => "Decline",
            ErrorKind::DoesNotExistAnywhere => "Does not exist anywhere",
            ErrorKind::SignalingConnectionError => "Signaling connection error",
            ErrorKind::SignalingConnectionDisconnected => "Signaling connection disconnected",
            ErrorKind::SignalingConnectionTimeout => "Signaling connection timeout",
            ErrorKind::ClientLocalDescFailed => {
                "Client is unable to create or apply a local media description"
            }
            ErrorKind::ClientRemoteDescFailed => {
                "Client is unable to apply a remote media description"
            }
            ErrorKind::MediaConnectionError => "Media connection failed",
        }
    }

    pub fn causes(&self) -> &'static [&'static str] {
        match self {
            ErrorKind::AccessTokenExpired => {
                &["The access token TTL elapsed before the session was established."]
            }
            ErrorKind::TokenExpired => &["The token lifetime ran out while registered."],
            ErrorKind::ConnectionTimeout => {
                &["The gateway could not be reached before the dial timeout elapsed."]
            }
            ErrorKind::PermissionDenied => {
                &["The user or the platform policy refused microphone access."]
            }
            ErrorKind::AcquisitionFailed => &[
                "No input device is available.",
                "The input device is in use by another application.",
            ],
            ErrorKind::SignalingConnectionDisconnected => {
                &["The signaling websocket dropped unexpectedly."]
            }
            ErrorKind::MediaConnectionError => &[
                "The ICE connection was lost and could not be restored.",
                "A firewall is blocking the media ports.",
            ],
            ErrorKind::PayloadSizeExceeded => {
                &["The message content serialized to more bytes than the gateway accepts."]
            }
            ErrorKind::RateExceeded => &["Messages were sent faster than the authorized rate."],
            _ => &[],
        }
    }

    pub fn solutions(&self) -> &'static [&'static str] {
        match self {
            ErrorKind::AccessTokenExpired | ErrorKind::TokenExpired => {
                &["Fetch a new token and call update_token before the current one expires."]
            }
            ErrorKind::PermissionDenied => {
                &["Prompt the user to grant microphone access and retry the call."]
            }
            ErrorKind::AcquisitionFailed => {
                &["Verify an input device exists and is not held by another process."]
            }
            ErrorKind::MediaConnectionError => {
                &["Check network connectivity and any firewall rules for UDP media traffic."]
            }
            ErrorKind::PayloadSizeExceeded => {
                &["Reduce the message content below the documented size limit."]
            }
            _ => &[],
        }
    }

    pub fn category(&self) -> ErrorCategory {
        category_for_code(self.code())
    }
}

pub fn kind_for_code(code: u32) -> Option<ErrorKind> {
    Some(match code {
        20101 => ErrorKind::AccessTokenInvalid,
        20102 => ErrorKind::AccessTokenHeaderInvalid,
        20103 => ErrorKind::AccessTokenIssuerInvalid,
        20104 => ErrorKind::AccessTokenExpired,
        20105 => ErrorKind::AccessTokenNotYetValid,
        20106 => ErrorKind::AccessTokenGrantsInvalid,
        20151 => ErrorKind::AuthenticationFailed,
        31000 => ErrorKind::Unknown,
        31001 => ErrorKind::ApplicationNotFound,
        31002 => ErrorKind::ConnectionDeclined,
        31003 => ErrorKind::ConnectionTimeout,
        31005 => ErrorKind::ConnectionError,
        31008 => ErrorKind::CallCancelled,
        31009 => ErrorKind::TransportError,
        31100 => ErrorKind::MalformedRequest,
        31101 => ErrorKind::MissingParameter,
        31102 => ErrorKind::AuthorizationTokenMissing,
        31103 => ErrorKind::MaxParameterLengthExceeded,
        31104 => ErrorKind::InvalidBridgeToken,
        31105 => ErrorKind::InvalidClientName,
        31107 => ErrorKind::ReconnectParameterInvalid,
        31201 => ErrorKind::AuthorizationError,
        31204 => ErrorKind::InvalidJwtToken,
        31205 => ErrorKind::TokenExpired,
        31206 => ErrorKind::RateExceeded,
        31210 => ErrorKind::CallMessageEventTypeInvalid,
        31212 => ErrorKind::PayloadSizeExceeded,
        31400 => ErrorKind::BadRequest,
        31401 => ErrorKind::PermissionDenied,
        31402 => ErrorKind::AcquisitionFailed,
        31403 => ErrorKind::Forbidden,
        31404 => ErrorKind::NotFound,
        31408 => ErrorKind::RequestTimeout,
        31480 => ErrorKind::TemporarilyUnavailable,
        31481 => ErrorKind::CallDoesNotExist,
        31484 => ErrorKind::AddressIncomplete,
        31486 => ErrorKind::BusyHere,
        31487 => ErrorKind::RequestTerminated,
        31600 => ErrorKind::BusyEverywhere,
        31603 => ErrorKind::Decline,
        31604 => ErrorKind::DoesNotExistAnywhere,
        53000 => ErrorKind::SignalingConnectionError,
        53001 => ErrorKind::SignalingConnectionDisconnected,
        53002 => ErrorKind::SignalingConnectionTimeout,
        53400 => ErrorKind::ClientLocalDescFailed,
        53402 => ErrorKind::ClientRemoteDescFailed,
        53405 => ErrorKind::MediaConnectionError,
        _ => return None,
    })
}

/// Signaling codes that older gateway revisions reported as a generic
/// failure. They surface with their own kind only when the improved
/// precision option is enabled; otherwise they collapse to the caller's
/// fallback kind.
pub(crate) const PRECISE_SIGNALING_ERROR_CODES: &[u32] = &[
    31001, 31002, 31003, 31101, 31102, 31103, 31104, 31105, 31107, 31201, 31204, 31205, 31206,
    31404, 31480, 31486, 31603,
];

/// An asynchronous failure reported through an `error` event.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolError {
    pub kind: ErrorKind,
    pub message: String,
    /// Code as received from the gateway, kept even when `kind` is a
    /// collapsed fallback.
    pub raw_code: Option<u32>,
}

impl ProtocolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw_code: Some(kind.code()),
        }
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.kind.code(), self.kind.description())?;
        if !self.message.is_empty() {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

/// Resolves a gateway-reported code into a [`ProtocolError`], applying the
/// legacy precision collapse. `fallback` is the generic kind for the caller's
/// scope (device handlers use [`ErrorKind::Unknown`], call handlers use
/// [`ErrorKind::ConnectionError`]).
pub fn resolve_protocol_error(
    code: Option<u32>,
    message: Option<&str>,
    improved_precision: bool,
    fallback: ErrorKind,
) -> ProtocolError {
    let message = message.unwrap_or_default().to_string();
    let kind = match code {
        Some(c) => match kind_for_code(c) {
            Some(kind) if improved_precision || !PRECISE_SIGNALING_ERROR_CODES.contains(&c) => kind,
            Some(_) => fallback,
            None => ErrorKind::Unknown,
        },
        None => ErrorKind::Unknown,
    };
    ProtocolError {
        kind,
        message,
        raw_code: code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_round_trip() {
        for code in [20104, 31000, 31100, 31205, 31210, 31401, 31486, 53405] {
            let kind = kind_for_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
        assert!(kind_for_code(99999).is_none());
    }

    #[test]
    fn test_categories_by_range() {
        assert_eq!(category_for_code(20104), ErrorCategory::Authorization);
        assert_eq!(category_for_code(31201), ErrorCategory::Authorization);
        assert_eq!(category_for_code(31005), ErrorCategory::General);
        assert_eq!(category_for_code(31100), ErrorCategory::MalformedRequest);
        assert_eq!(category_for_code(31401), ErrorCategory::UserMedia);
        assert_eq!(category_for_code(31486), ErrorCategory::Client);
        assert_eq!(category_for_code(31603), ErrorCategory::SipServer);
        // SIP 318xx codes have no named kinds but still categorize.
        assert_eq!(category_for_code(31830), ErrorCategory::SipServer);
        assert!(kind_for_code(31830).is_none());
        assert_eq!(category_for_code(53001), ErrorCategory::Signaling);
        assert_eq!(category_for_code(53400), ErrorCategory::Media);
        assert_eq!(category_for_code(12345), ErrorCategory::Other);
    }

    #[test]
    fn test_precision_collapse_when_disabled() {
        let err = resolve_protocol_error(Some(31480), None, false, ErrorKind::ConnectionError);
        assert_eq!(err.kind, ErrorKind::ConnectionError);
        assert_eq!(err.raw_code, Some(31480));

        let err = resolve_protocol_error(Some(31480), None, false, ErrorKind::Unknown);
        assert_eq!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_precise_kind_when_enabled() {
        let err = resolve_protocol_error(Some(31480), None, true, ErrorKind::ConnectionError);
        assert_eq!(err.kind, ErrorKind::TemporarilyUnavailable);
        assert_eq!(err.code(), 31480);
    }

    #[test]
    fn test_codes_outside_legacy_set_always_precise() {
        // 31210 is not in the legacy set, so it surfaces regardless of the option.
        let err = resolve_protocol_error(Some(31210), None, false, ErrorKind::ConnectionError);
        assert_eq!(err.kind, ErrorKind::CallMessageEventTypeInvalid);
    }

    #[test]
    fn test_unrecognized_code_falls_back_to_unknown() {
        let err = resolve_protocol_error(Some(42), Some("boom"), true, ErrorKind::ConnectionError);
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert_eq!(err.raw_code, Some(42));
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_display_includes_code_and_message() {
        let err = ProtocolError::new(ErrorKind::TokenExpired, "ttl elapsed");
        assert_eq!(format!("{err}"), "error 31205: JWT token expired (ttl elapsed)");
    }
}
