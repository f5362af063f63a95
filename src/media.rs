//! Media transport contract.
//!
//! The crate never touches RTP or ICE directly. A [`MediaHandler`] wraps
//! whatever peer connection stack the embedding application provides and
//! reports its lifecycle through a channel of [`MediaEvent`]s, the same
//! split used for the signaling side.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// A session description in SDP text form.
pub type Sdp = String;

/// Handle to an acquired audio input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStream {
    pub id: String,
}

impl InputStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media handler closed")]
    Closed,
    #[error("failed to create local description: {0}")]
    LocalDescription(String),
    #[error("failed to apply remote description: {0}")]
    RemoteDescription(String),
    #[error("media error: {0}")]
    Other(String),
}

/// Lifecycle notifications from a media handler.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The peer connection reached the open state and audio is flowing.
    Open,
    /// The peer connection was closed locally.
    Closed,
    /// The transport recovered on its own after a `Disconnected`.
    Connected,
    /// The transport lost connectivity and is trying to recover.
    Disconnected,
    /// An ICE restart completed and media is flowing again.
    Reconnected,
    /// ICE candidate gathering produced no usable pair.
    IceGatheringFailed,
    /// The transport failed and will not recover without a restart.
    Failed,
    Error {
        code: u32,
        message: String,
    },
    Volume {
        input_level: f32,
        output_level: f32,
    },
}

/// One media session for one call.
///
/// Handlers are created per call by a [`MediaHandlerFactory`] and report
/// through the receiver returned alongside. All methods must be safe to
/// call after `close`; they should fail with [`MediaError::Closed`].
#[async_trait]
pub trait MediaHandler: Send + Sync {
    /// Attaches the acquired input stream before any description exchange.
    async fn open(&self, input: &InputStream) -> Result<(), MediaError>;

    /// Applies the caller's offer and produces the local answer.
    async fn answer_incoming_call(&self, remote_sdp: &str) -> Result<Sdp, MediaError>;

    /// Produces the local offer for an outgoing call. `reconnect_token`
    /// marks the offer as a resume of an earlier leg, which requires the
    /// handler to request an ICE restart in the offer.
    async fn make_outgoing_call(
        &self,
        call_id: &str,
        reconnect_token: Option<&str>,
    ) -> Result<Sdp, MediaError>;

    async fn set_input_tracks_from_stream(&self, input: &InputStream) -> Result<(), MediaError>;

    async fn mute(&self, muted: bool) -> Result<(), MediaError>;

    async fn is_muted(&self) -> bool;

    /// Starts an ICE restart attempt. Completion is reported through the
    /// event channel, not the return value.
    async fn ice_restart(&self) -> Result<(), MediaError>;

    async fn local_description(&self) -> Option<Sdp>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaHandlerFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn MediaHandler>, mpsc::Receiver<MediaEvent>), MediaError>;
}
