//! Signaling channel contract and shared event vocabulary.
//!
//! A [`SignalingChannel`] owns one persistent connection to the voice
//! gateway, keeps it alive across drops, and turns inbound frames into
//! [`SignalingEvent`]s consumed by a single dispatch task. Commands are
//! methods; everything the gateway pushes arrives on the event receiver
//! handed out by the [`SignalingFactory`].

pub mod protocol;
pub mod websocket;

use crate::config::BackoffPolicy;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use protocol::{
    AckNotice, AnswerNotice, CallMessageFrame, CancelNotice, ConnectedInfo, ErrorBody,
    ErrorNotice, HangupNotice, InviteNotice, MessageNotice, RingingNotice, TokenLifetime,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel is offline")]
    Offline,
    #[error("signaling channel is destroyed")]
    Destroyed,
    #[error("signaling send failed: {0}")]
    Send(String),
}

/// Transport-level state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelStatus {
    Connecting = 0,
    Connected = 1,
    Offline = 2,
    Destroyed = 3,
}

impl ChannelStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelStatus::Connecting,
            1 => ChannelStatus::Connected,
            2 => ChannelStatus::Offline,
            _ => ChannelStatus::Destroyed,
        }
    }
}

/// Everything the gateway pushes to the client, plus the transport-level
/// markers the channel synthesizes itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Gateway acknowledged the session and reported its location.
    Connected(ConnectedInfo),
    /// Registration is in effect; incoming calls will be delivered.
    Ready,
    /// Registration lapsed on the gateway side.
    Offline,
    Invite(InviteNotice),
    Ringing(RingingNotice),
    Answer(AnswerNotice),
    Cancel(CancelNotice),
    Hangup(HangupNotice),
    Ack(AckNotice),
    Message(MessageNotice),
    Error(ErrorNotice),
    /// The underlying socket dropped; the channel is redialing.
    TransportClose,
    /// Terminal close after `destroy`. Nothing follows this event.
    Close,
}

/// Configuration captured by the factory when a channel is created.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Gateway URIs in preference order. Never empty.
    pub uris: Vec<String>,
    pub token: String,
    pub reconnect: BackoffPolicy,
    /// How long redials stay pinned to the preferred URI before rotating
    /// through the full list. Zero disables pinning.
    pub max_preferred_duration: Duration,
}

/// One persistent signaling session.
///
/// Command methods resolve when the frame is handed to the transport, not
/// when the gateway reacts; reactions come back as [`SignalingEvent`]s.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Announces (or withdraws) availability for incoming calls.
    async fn register(&self, available: bool) -> Result<(), SignalingError>;

    /// Dials an outgoing call. `call_id` is the client-generated id the
    /// gateway later replaces with a real CallSid.
    async fn invite(
        &self,
        call_id: &str,
        sdp: &str,
        params: &IndexMap<String, String>,
    ) -> Result<(), SignalingError>;

    /// Accepts an incoming call with the local answer description.
    async fn answer(&self, call_sid: &str, sdp: &str) -> Result<(), SignalingError>;

    /// Resumes a previously answered call leg on a fresh connection.
    async fn reconnect(
        &self,
        sdp: &str,
        call_sid: &str,
        reconnect_token: &str,
    ) -> Result<(), SignalingError>;

    async fn hangup(&self, call_sid: &str, message: Option<&str>) -> Result<(), SignalingError>;

    async fn reject(&self, call_sid: &str) -> Result<(), SignalingError>;

    async fn dtmf(&self, call_sid: &str, digit: char) -> Result<(), SignalingError>;

    async fn send_message(&self, frame: CallMessageFrame) -> Result<(), SignalingError>;

    /// Replaces the access token. A connected channel re-announces itself
    /// with the new token immediately.
    async fn set_token(&self, token: &str) -> Result<(), SignalingError>;

    /// Pins redials to the gateway URI that owns the active call.
    async fn update_preferred_uri(&self, uri: Option<&str>);

    fn status(&self) -> ChannelStatus;

    /// Permanently closes the channel. Emits [`SignalingEvent::Close`] as
    /// the final event.
    async fn destroy(&self);
}

#[async_trait]
pub trait SignalingFactory: Send + Sync {
    async fn create(
        &self,
        config: SignalingConfig,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>), SignalingError>;
}

/// Channel slot shared between a device and its calls. Empty until the
/// device first connects, swapped on URI reconfiguration, cleared on
/// destroy.
pub type SharedSignaling = Arc<tokio::sync::RwLock<Option<Arc<dyn SignalingChannel>>>>;

/// Sends a command through the shared slot, failing with
/// [`SignalingError::Offline`] when no channel exists.
pub(crate) async fn with_channel(
    slot: &SharedSignaling,
) -> Result<Arc<dyn SignalingChannel>, SignalingError> {
    slot.read()
        .await
        .as_ref()
        .cloned()
        .ok_or(SignalingError::Offline)
}
