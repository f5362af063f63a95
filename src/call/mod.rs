//! Call sessions.
//!
//! A [`Call`] is created by the device for each incoming invite or outgoing
//! dial and lives until it reaches the closed state. The device's dispatch
//! task feeds it signaling notices; a spawned task per call consumes media
//! handler events. User-facing methods re-check state after every await
//! since notices can land between them.

pub mod state;

pub use state::{CallState, CallTransition, DisconnectReason, InvalidTransition};

use crate::audio::{AudioError, AudioHelper, SoundPlayer};
use crate::config::{AcceptOptions, BackoffPolicy, VoiceEventSidGenerator};
use crate::dtmf;
use crate::errors::{ErrorKind, ProtocolError, VoiceError, resolve_protocol_error};
use crate::events::{self, CallEventBus};
use crate::media::{InputStream, MediaEvent, MediaHandler, MediaHandlerFactory};
use crate::publisher::{EventPublisher, TelemetryEvent};
use crate::signaling::{
    AnswerNotice, CallMessageFrame, ErrorNotice, HangupNotice, MessageNotice, RingingNotice,
    SharedSignaling, SignalingChannel, with_channel,
};
use crate::token::{ConnectToken, parse_custom_parameters};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use log::{debug, info, warn};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

pub const USER_DEFINED_MESSAGE: &str = "user-defined-message";
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// An in-call message, either to send or as received.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMessage {
    pub content: Value,
    pub content_type: String,
    pub message_type: String,
}

impl CallMessage {
    pub fn user_defined(content: Value) -> Self {
        Self {
            content,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            message_type: USER_DEFINED_MESSAGE.to_string(),
        }
    }
}

pub(crate) fn random_sid(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("{prefix}{}", hex::encode(bytes))
}

pub type CallHook = Box<dyn Fn(Arc<Call>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callbacks the owning device installs to track call lifecycle without
/// holding a reference cycle.
pub struct CallHooks {
    /// Fired when the call leaves pending, before any setup awaits.
    pub on_accepted: CallHook,
    /// Fired exactly once when the call reaches the closed state.
    pub on_terminal: CallHook,
}

impl CallHooks {
    pub fn noop() -> Self {
        Self {
            on_accepted: Box::new(|_| Box::pin(async {})),
            on_terminal: Box::new(|_| Box::pin(async {})),
        }
    }
}

/// Collaborators a call borrows from its device.
pub struct CallDeps {
    pub signaling: SharedSignaling,
    pub media_factory: Arc<dyn MediaHandlerFactory>,
    pub audio: Arc<dyn AudioHelper>,
    pub sounds: Arc<dyn SoundPlayer>,
    pub publisher: Arc<dyn EventPublisher>,
    pub improved_error_precision: bool,
    pub ice_restart: BackoffPolicy,
    pub voice_event_sid_generator: Option<Arc<VoiceEventSidGenerator>>,
}

pub struct Call {
    pub events: CallEventBus,
    direction: Direction,
    /// Client-generated id used on the wire until the gateway assigns a
    /// real CallSid.
    temp_call_id: Option<String>,
    call_sid: RwLock<Option<String>>,
    parameters: RwLock<IndexMap<String, String>>,
    custom_parameters: RwLock<IndexMap<String, String>>,
    reconnect_token: RwLock<Option<String>>,
    invite_sdp: RwLock<Option<String>>,
    media: RwLock<Option<Arc<dyn MediaHandler>>>,
    /// Sent messages awaiting ack or error, keyed by voiceeventsid.
    pending_messages: Mutex<HashMap<String, CallMessage>>,
    state: Mutex<CallState>,
    /// Signaling answer exchange completed (incoming: answer sent,
    /// outgoing: answer notice received). Gates the open transition.
    answered: AtomicBool,
    media_open: AtomicBool,
    /// A signaling reconnect is owed on the next connected notice.
    reconnect_pending: AtomicBool,
    /// A reconnect command is in flight; the next answer notice completes
    /// the recovery.
    resuming: AtomicBool,
    /// An ICE restart episode is running.
    media_reconnecting: AtomicBool,
    /// Set on close; a detached call can no longer reach signaling.
    signaling_detached: AtomicBool,
    shutdown: Notify,
    deps: CallDeps,
    hooks: CallHooks,
}

impl Call {
    pub(crate) fn new_incoming(
        call_sid: String,
        sdp: String,
        parameters: IndexMap<String, String>,
        deps: CallDeps,
        hooks: CallHooks,
    ) -> Arc<Self> {
        let custom_parameters = parameters
            .get("Params")
            .map(|raw| parse_custom_parameters(raw))
            .unwrap_or_default();
        Arc::new(Self {
            events: CallEventBus::new(),
            direction: Direction::Incoming,
            temp_call_id: None,
            call_sid: RwLock::new(Some(call_sid)),
            parameters: RwLock::new(parameters),
            custom_parameters: RwLock::new(custom_parameters),
            reconnect_token: RwLock::new(None),
            invite_sdp: RwLock::new(Some(sdp)),
            media: RwLock::new(None),
            pending_messages: Mutex::new(HashMap::new()),
            state: Mutex::new(CallState::default()),
            answered: AtomicBool::new(false),
            media_open: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            resuming: AtomicBool::new(false),
            media_reconnecting: AtomicBool::new(false),
            signaling_detached: AtomicBool::new(false),
            shutdown: Notify::new(),
            deps,
            hooks,
        })
    }

    pub(crate) fn new_outgoing(
        params: IndexMap<String, String>,
        deps: CallDeps,
        hooks: CallHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            events: CallEventBus::new(),
            direction: Direction::Outgoing,
            temp_call_id: Some(random_sid("TJ")),
            call_sid: RwLock::new(None),
            parameters: RwLock::new(IndexMap::new()),
            custom_parameters: RwLock::new(params),
            reconnect_token: RwLock::new(None),
            invite_sdp: RwLock::new(None),
            media: RwLock::new(None),
            pending_messages: Mutex::new(HashMap::new()),
            state: Mutex::new(CallState::default()),
            answered: AtomicBool::new(false),
            media_open: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            resuming: AtomicBool::new(false),
            media_reconnecting: AtomicBool::new(false),
            signaling_detached: AtomicBool::new(false),
            shutdown: Notify::new(),
            deps,
            hooks,
        })
    }

    pub(crate) fn new_resumed(token: ConnectToken, deps: CallDeps, hooks: CallHooks) -> Arc<Self> {
        let call_sid = token.call_sid().to_string();
        Arc::new(Self {
            events: CallEventBus::new(),
            direction: Direction::Outgoing,
            temp_call_id: None,
            call_sid: RwLock::new(Some(call_sid)),
            parameters: RwLock::new(token.parameters),
            custom_parameters: RwLock::new(token.custom_parameters),
            reconnect_token: RwLock::new(Some(token.signaling_reconnect_token)),
            invite_sdp: RwLock::new(None),
            media: RwLock::new(None),
            pending_messages: Mutex::new(HashMap::new()),
            state: Mutex::new(CallState::default()),
            answered: AtomicBool::new(false),
            media_open: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            resuming: AtomicBool::new(false),
            media_reconnecting: AtomicBool::new(false),
            signaling_detached: AtomicBool::new(false),
            shutdown: Notify::new(),
            deps,
            hooks,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn temp_call_id(&self) -> Option<&str> {
        self.temp_call_id.as_deref()
    }

    pub async fn state(&self) -> CallState {
        self.state.lock().await.clone()
    }

    pub async fn call_sid(&self) -> Option<String> {
        self.call_sid.read().await.clone()
    }

    pub async fn parameters(&self) -> IndexMap<String, String> {
        self.parameters.read().await.clone()
    }

    pub async fn custom_parameters(&self) -> IndexMap<String, String> {
        self.custom_parameters.read().await.clone()
    }

    pub async fn is_muted(&self) -> bool {
        match self.media.read().await.as_ref() {
            Some(media) => media.is_muted().await,
            None => false,
        }
    }

    /// Opaque token for re-dialing this call leg later. Available once the
    /// call was answered and the gateway supplied a reconnect token.
    pub async fn connect_token(&self) -> Result<String, VoiceError> {
        let reconnect_token = self.reconnect_token.read().await.clone().ok_or_else(|| {
            VoiceError::InvalidState("call has no reconnect token yet".to_string())
        })?;
        let parameters = self.parameters.read().await.clone();
        if !parameters.contains_key("CallSid") {
            return Err(VoiceError::InvalidState(
                "call has no CallSid yet".to_string(),
            ));
        }
        ConnectToken {
            parameters,
            custom_parameters: self.custom_parameters.read().await.clone(),
            signaling_reconnect_token: reconnect_token,
        }
        .encode()
    }

    /// Id this call is addressed by on the wire right now.
    pub(crate) async fn wire_id(&self) -> Option<String> {
        let sid = self.call_sid.read().await.clone();
        sid.or_else(|| self.temp_call_id.clone())
    }

    /// Records the gateway-assigned CallSid once it is known.
    pub(crate) async fn upgrade_call_sid(&self, sid: &str) {
        let mut call_sid = self.call_sid.write().await;
        if call_sid.as_deref() == Some(sid) {
            return;
        }
        debug!(target: "Call", "Call {:?} is now {sid}", self.temp_call_id);
        *call_sid = Some(sid.to_string());
        drop(call_sid);
        self.parameters
            .write()
            .await
            .insert("CallSid".to_string(), sid.to_string());
    }

    pub(crate) async fn matches_id(&self, id: &str) -> bool {
        if self.temp_call_id.as_deref() == Some(id) {
            return true;
        }
        self.call_sid.read().await.as_deref() == Some(id)
    }

    pub(crate) async fn is_live(&self) -> bool {
        self.state.lock().await.is_live()
    }

    async fn still_connecting(&self) -> bool {
        matches!(*self.state.lock().await, CallState::Connecting { .. })
    }

    async fn log_id(&self) -> String {
        self.wire_id()
            .await
            .unwrap_or_else(|| "<unassigned>".to_string())
    }

    async fn publish_info(&self, group: &str, name: &str) {
        let call_sid = self.call_sid.read().await.clone();
        self.deps
            .publisher
            .publish(TelemetryEvent::info(group, name).with_call_sid(call_sid))
            .await;
    }

    /// Starts the call: acquires audio, builds the media session and runs
    /// the signaling handshake for this direction. A no-op unless the call
    /// is still pending. Setup failures after this point surface as error
    /// events followed by disconnect, never as an `Err` return.
    pub async fn accept(self: &Arc<Self>, options: AcceptOptions) -> Result<(), VoiceError> {
        {
            let mut state = self.state.lock().await;
            if !state.can_accept() {
                debug!(target: "Call", "Ignoring accept while {:?}", *state);
                return Ok(());
            }
            state
                .apply_transition(CallTransition::Accepted)
                .map_err(|e| VoiceError::InvalidState(e.to_string()))?;
        }
        info!(target: "Call", "Accepting {:?} call {}", self.direction, self.log_id().await);
        (self.hooks.on_accepted)(self.clone()).await;
        self.deps.sounds.stop_incoming().await;
        let telemetry_name = match self.direction {
            Direction::Incoming => "accepted-by-local",
            Direction::Outgoing => "outgoing",
        };
        self.publish_info("connection", telemetry_name).await;

        self.deps.audio.input_device_ready().await;
        if !self.still_connecting().await {
            return Ok(());
        }

        let input = match options.input_stream {
            Some(stream) => stream,
            None => match self.deps.audio.acquire_input().await {
                Ok(stream) => stream,
                Err(err) => {
                    self.handle_acquisition_failure(err).await;
                    return Ok(());
                }
            },
        };
        if !self.still_connecting().await {
            return Ok(());
        }

        let media = match self.setup_media(&input).await {
            Some(media) => media,
            None => return Ok(()),
        };
        if !self.still_connecting().await {
            return Ok(());
        }

        let channel = match with_channel(&self.deps.signaling).await {
            Ok(channel) => channel,
            Err(e) => {
                self.fail_setup(ErrorKind::TransportError, e.to_string()).await;
                return Ok(());
            }
        };

        match self.direction {
            Direction::Incoming => {
                let remote_sdp = self.invite_sdp.read().await.clone().unwrap_or_default();
                let local_sdp = match media.answer_incoming_call(&remote_sdp).await {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        self.fail_setup(ErrorKind::ClientRemoteDescFailed, e.to_string())
                            .await;
                        return Ok(());
                    }
                };
                if !self.still_connecting().await {
                    return Ok(());
                }
                let call_sid = self.call_sid.read().await.clone().unwrap_or_default();
                if let Err(e) = channel.answer(&call_sid, &local_sdp).await {
                    self.fail_setup(ErrorKind::TransportError, e.to_string()).await;
                    return Ok(());
                }
                self.answered.store(true, Ordering::Relaxed);
            }
            Direction::Outgoing => {
                let reconnect_token = self.reconnect_token.read().await.clone();
                let wire_id = self.wire_id().await.unwrap_or_default();
                let local_sdp = match media
                    .make_outgoing_call(&wire_id, reconnect_token.as_deref())
                    .await
                {
                    Ok(sdp) => sdp,
                    Err(e) => {
                        self.fail_setup(ErrorKind::ClientLocalDescFailed, e.to_string())
                            .await;
                        return Ok(());
                    }
                };
                if !self.still_connecting().await {
                    return Ok(());
                }
                let send_result = match (&reconnect_token, self.call_sid.read().await.clone()) {
                    (Some(token), Some(call_sid)) => {
                        channel.reconnect(&local_sdp, &call_sid, token).await
                    }
                    _ => {
                        let params = self.custom_parameters.read().await.clone();
                        channel.invite(&wire_id, &local_sdp, &params).await
                    }
                };
                if let Err(e) = send_result {
                    self.fail_setup(ErrorKind::TransportError, e.to_string()).await;
                    return Ok(());
                }
            }
        }

        // Media may have opened while the handshake was in flight.
        self.maybe_open().await;
        Ok(())
    }

    async fn setup_media(self: &Arc<Self>, input: &InputStream) -> Option<Arc<dyn MediaHandler>> {
        let (media, media_events) = match self.deps.media_factory.create().await {
            Ok(pair) => pair,
            Err(e) => {
                self.fail_setup(ErrorKind::ClientLocalDescFailed, e.to_string())
                    .await;
                return None;
            }
        };
        *self.media.write().await = Some(media.clone());
        tokio::task::spawn(self.clone().media_events_loop(media_events));
        if let Err(e) = media.open(input).await {
            self.fail_setup(ErrorKind::ClientLocalDescFailed, e.to_string())
                .await;
            return None;
        }
        Some(media)
    }

    /// Hangs up a live call. A no-op while pending or already closed.
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), VoiceError> {
        if !self.is_live().await {
            debug!(target: "Call", "Ignoring disconnect, call is not live");
            return Ok(());
        }
        if let Some(id) = self.wire_id().await {
            match with_channel(&self.deps.signaling).await {
                Ok(channel) => {
                    if let Err(e) = channel.hangup(&id, None).await {
                        warn!(target: "Call", "Hangup command failed for {id}: {e}");
                    }
                }
                Err(e) => warn!(target: "Call", "Hangup not sent for {id}: {e}"),
            }
        }
        self.publish_info("connection", "disconnected-by-local").await;
        self.finalize(DisconnectReason::LocalHangup, true).await;
        Ok(())
    }

    /// Declines a pending incoming call. The caller hears the reject.
    /// A no-op once the call has left `Pending`.
    pub async fn reject(self: &Arc<Self>) -> Result<(), VoiceError> {
        if !self.state.lock().await.can_reject() {
            debug!(target: "Call", "Ignoring reject, call is no longer pending");
            return Ok(());
        }
        if let Some(id) = self.wire_id().await {
            match with_channel(&self.deps.signaling).await {
                Ok(channel) => {
                    if let Err(e) = channel.reject(&id).await {
                        warn!(target: "Call", "Reject command failed for {id}: {e}");
                    }
                }
                Err(e) => warn!(target: "Call", "Reject not sent for {id}: {e}"),
            }
        }
        self.publish_info("connection", "rejected-by-local").await;
        self.finalize(DisconnectReason::Rejected, false).await;
        Ok(())
    }

    /// Drops a pending incoming call locally without telling the gateway;
    /// the caller keeps ringing until timeout or cancel. A no-op once the
    /// call has left `Pending`.
    pub async fn ignore(self: &Arc<Self>) -> Result<(), VoiceError> {
        if !self.state.lock().await.can_reject() {
            debug!(target: "Call", "Ignore skipped, call is no longer pending");
            return Ok(());
        }
        debug!(target: "Call", "Ignoring call {}", self.log_id().await);
        self.finalize(DisconnectReason::Ignored, false).await;
        Ok(())
    }

    pub async fn mute(&self, muted: bool) -> Result<(), VoiceError> {
        let media = self
            .media
            .read()
            .await
            .clone()
            .ok_or_else(|| VoiceError::InvalidState("call has no media session".to_string()))?;
        if media.is_muted().await == muted {
            return Ok(());
        }
        media.mute(muted).await?;
        let _ = self.events.mute.send(Arc::new(events::MuteChanged { muted }));
        Ok(())
    }

    /// Sends DTMF digits, paced one per interval. `w` inserts a pause.
    pub async fn send_digits(self: &Arc<Self>, digits: &str) -> Result<(), VoiceError> {
        dtmf::validate_digits(digits)?;
        if !self.is_live().await {
            return Err(VoiceError::InvalidState(
                "digits can only be sent on a live call".to_string(),
            ));
        }
        let call = self.clone();
        let digits = digits.to_string();
        tokio::task::spawn(async move { call.digit_pacer(digits).await });
        Ok(())
    }

    async fn digit_pacer(self: Arc<Self>, digits: String) {
        for (index, digit) in digits.chars().enumerate() {
            if index > 0 {
                tokio::select! {
                    biased;
                    _ = self.shutdown.notified() => return,
                    _ = tokio::time::sleep(dtmf::DIGIT_INTERVAL) => {}
                }
            }
            if !self.is_live().await {
                return;
            }
            if digit == 'w' {
                continue;
            }
            if let Some(tone) = dtmf::tone_name(digit) {
                let _ = self.deps.sounds.play_dtmf(tone).await;
            }
            let Some(id) = self.wire_id().await else { return };
            match with_channel(&self.deps.signaling).await {
                Ok(channel) => {
                    if let Err(e) = channel.dtmf(&id, digit).await {
                        warn!(target: "Call", "Failed to send digit {digit:?}: {e}");
                    }
                }
                Err(e) => warn!(target: "Call", "Dropping digit {digit:?}: {e}"),
            }
        }
    }

    /// The device's channel, refused once this call has closed and
    /// detached from signaling.
    async fn attached_channel(&self) -> Result<Arc<dyn SignalingChannel>, VoiceError> {
        if self.signaling_detached.load(Ordering::SeqCst) {
            return Err(VoiceError::InvalidState(
                "signaling is no longer attached to this call".to_string(),
            ));
        }
        with_channel(&self.deps.signaling)
            .await
            .map_err(|_| VoiceError::InvalidState("signaling channel is unavailable".to_string()))
    }

    /// Sends an in-call message and returns its correlation id. The
    /// outcome arrives later as a `message_sent` event (acked) or an
    /// `error` event carrying the same id. Usable as soon as the call
    /// has a CallSid, even while an incoming call is still ringing.
    pub async fn send_message(&self, message: CallMessage) -> Result<String, VoiceError> {
        if message.message_type.trim().is_empty() {
            return Err(VoiceError::InvalidArgument(
                "message type must not be empty".to_string(),
            ));
        }
        if message.content.is_null() {
            return Err(VoiceError::InvalidArgument(
                "message content must not be null".to_string(),
            ));
        }
        // Fixed before any await so the caller always learns the id the
        // frame will carry.
        let voice_event_sid = match &self.deps.voice_event_sid_generator {
            Some(generator) => generator(),
            None => random_sid("KX"),
        };
        let channel = self.attached_channel().await?;
        let call_sid = self.call_sid.read().await.clone().ok_or_else(|| {
            VoiceError::InvalidState("call has no CallSid yet".to_string())
        })?;
        let content_type = if message.content_type.is_empty() {
            DEFAULT_CONTENT_TYPE.to_string()
        } else {
            message.content_type.clone()
        };
        let frame = CallMessageFrame {
            call_sid,
            content: message.content.clone(),
            content_type,
            message_type: message.message_type.clone(),
            voice_event_sid: voice_event_sid.clone(),
        };

        self.pending_messages
            .lock()
            .await
            .insert(voice_event_sid.clone(), message);
        if let Err(e) = channel.send_message(frame).await {
            self.pending_messages.lock().await.remove(&voice_event_sid);
            return Err(e.into());
        }
        debug!(target: "Call", "Sent call message {voice_event_sid}");
        Ok(voice_event_sid)
    }

    // ---- notice handlers, called from the device dispatch task ----

    pub(crate) async fn handle_ringing(self: &Arc<Self>, notice: &RingingNotice) {
        if let Some(sid) = notice.call_sid.as_deref() {
            self.upgrade_call_sid(sid).await;
        }
        let has_early_media = notice.has_early_media();
        {
            let mut state = self.state.lock().await;
            if state
                .apply_transition(CallTransition::EarlyMedia { has_early_media })
                .is_err()
            {
                debug!(target: "Call", "Ignoring ringing notice in state {:?}", *state);
                return;
            }
        }
        self.publish_info("connection", "ringing").await;
        let _ = self
            .events
            .ringing
            .send(Arc::new(events::Ringing { has_early_media }));
    }

    pub(crate) async fn handle_answer(self: &Arc<Self>, notice: &AnswerNotice) {
        if let Some(sid) = notice.call_sid.as_deref() {
            self.upgrade_call_sid(sid).await;
        }
        if let Some(token) = notice.reconnect.as_deref() {
            *self.reconnect_token.write().await = Some(token.to_string());
        }
        self.answered.store(true, Ordering::Relaxed);
        if self.resuming.swap(false, Ordering::SeqCst) {
            info!(target: "Call", "Signaling resumed for call {}", self.log_id().await);
            let _ = self.events.reconnected.send(Arc::new(events::Reconnected));
        }
        self.maybe_open().await;
    }

    pub(crate) async fn handle_cancel(self: &Arc<Self>) {
        if !self.state.lock().await.can_reject() {
            debug!(target: "Call", "Ignoring cancel for call {} past pending", self.log_id().await);
            return;
        }
        info!(target: "Call", "Call {} cancelled by remote", self.log_id().await);
        self.finalize(DisconnectReason::Cancelled, false).await;
    }

    pub(crate) async fn handle_hangup(self: &Arc<Self>, notice: &HangupNotice) {
        if let Some(code) = notice.error_code() {
            let error = resolve_protocol_error(
                Some(code),
                notice.error_message().or(notice.message.as_deref()),
                self.deps.improved_error_precision,
                ErrorKind::ConnectionError,
            );
            warn!(target: "Call", "Call {} hung up with {error}", self.log_id().await);
            let _ = self.events.error.send(Arc::new(events::CallError {
                error,
                voice_event_sid: None,
            }));
            self.finalize(DisconnectReason::Error, true).await;
        } else {
            info!(target: "Call", "Call {} hung up by remote", self.log_id().await);
            self.finalize(DisconnectReason::RemoteHangup, true).await;
        }
    }

    pub(crate) async fn handle_message(&self, notice: &MessageNotice) {
        let Some(voice_event_sid) = notice
            .voice_event_sid
            .clone()
            .filter(|sid| !sid.is_empty())
        else {
            debug!(target: "Call", "Dropping call message without voiceeventsid");
            return;
        };
        let message = CallMessage {
            content: notice.content.clone(),
            content_type: notice
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            message_type: notice.message_type.clone(),
        };
        let _ = self.events.message_received.send(Arc::new(events::MessageReceived {
            message,
            voice_event_sid,
        }));
    }

    pub(crate) async fn handle_ack(&self, notice: &crate::signaling::AckNotice) {
        if notice.ack_type != "message" {
            debug!(target: "Call", "Ignoring ack of type {:?}", notice.ack_type);
            return;
        }
        let Some(sid) = notice.voice_event_sid.as_deref() else {
            debug!(target: "Call", "Ignoring message ack without voiceeventsid");
            return;
        };
        match self.pending_messages.lock().await.remove(sid) {
            Some(message) => {
                let _ = self.events.message_sent.send(Arc::new(events::MessageSent {
                    message,
                    voice_event_sid: sid.to_string(),
                }));
            }
            None => {
                debug!(target: "Call", "Ack for already resolved voiceeventsid {sid}");
            }
        }
    }

    pub(crate) async fn handle_error_notice(&self, notice: &ErrorNotice) {
        if let Some(sid) = notice.voice_event_sid() {
            // A reply to a sent message resolves it exactly once.
            if self.pending_messages.lock().await.remove(sid).is_none() {
                debug!(target: "Call", "Error for already resolved voiceeventsid {sid}");
                return;
            }
            let error = resolve_protocol_error(
                notice.code(),
                notice.message(),
                self.deps.improved_error_precision,
                ErrorKind::Unknown,
            );
            warn!(target: "Call", "Call message {sid} failed: {error}");
            let _ = self.events.error.send(Arc::new(events::CallError {
                error,
                voice_event_sid: Some(sid.to_string()),
            }));
            return;
        }
        let error = resolve_protocol_error(
            notice.code(),
            notice.message(),
            self.deps.improved_error_precision,
            ErrorKind::ConnectionError,
        );
        warn!(target: "Call", "Call {} error: {error}", self.log_id().await);
        let _ = self.events.error.send(Arc::new(events::CallError {
            error,
            voice_event_sid: None,
        }));
    }

    /// The signaling socket dropped. A call that was never answered dies
    /// here; an answered call waits for the channel to redial.
    pub(crate) async fn handle_transport_close(self: &Arc<Self>) {
        if self.state.lock().await.can_reject() {
            info!(target: "Call", "Pending call {} lost its transport", self.log_id().await);
            self.finalize(DisconnectReason::Cancelled, false).await;
            return;
        }
        if !self.is_live().await {
            return;
        }
        let _ = self.events.transport_close.send(Arc::new(events::TransportClosed));
        if self.reconnect_token.read().await.is_none() {
            let error = ProtocolError::new(
                ErrorKind::SignalingConnectionDisconnected,
                "signaling connection dropped before the call was resumable",
            );
            let _ = self.events.error.send(Arc::new(events::CallError {
                error,
                voice_event_sid: None,
            }));
            self.finalize(DisconnectReason::Error, true).await;
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(target: "Call", "Transport lost for call {}, will resume", self.log_id().await);
        self.publish_info("connection", "transport-close").await;
        let error = ProtocolError::new(
            ErrorKind::SignalingConnectionDisconnected,
            "signaling connection lost, attempting to resume",
        );
        let _ = self
            .events
            .reconnecting
            .send(Arc::new(events::Reconnecting { error }));
    }

    /// The channel re-established its socket. Issues the owed reconnect
    /// command at most once per outage.
    pub(crate) async fn handle_signaling_connected(self: &Arc<Self>) {
        if !self.reconnect_pending.swap(false, Ordering::SeqCst) {
            return;
        }
        if !self.is_live().await {
            return;
        }
        let call_sid = self.call_sid.read().await.clone();
        let reconnect_token = self.reconnect_token.read().await.clone();
        let (Some(call_sid), Some(token)) = (call_sid, reconnect_token) else {
            return;
        };
        let Some(media) = self.media.read().await.clone() else {
            return;
        };
        let Some(sdp) = media.local_description().await else {
            warn!(target: "Call", "No local description to resume call {call_sid}");
            return;
        };
        match with_channel(&self.deps.signaling).await {
            Ok(channel) => {
                self.resuming.store(true, Ordering::SeqCst);
                if let Err(e) = channel.reconnect(&sdp, &call_sid, &token).await {
                    warn!(target: "Call", "Resume of call {call_sid} failed: {e}");
                    self.resuming.store(false, Ordering::SeqCst);
                    // Try again on the next connected notice.
                    self.reconnect_pending.store(true, Ordering::SeqCst);
                } else {
                    info!(target: "Call", "Resume command sent for call {call_sid}");
                }
            }
            Err(e) => {
                warn!(target: "Call", "Resume of call {call_sid} not sent: {e}");
                self.reconnect_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    // ---- media event handling ----

    async fn media_events_loop(self: Arc<Self>, mut events: mpsc::Receiver<MediaEvent>) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_media_event(event).await;
                }
            }
        }
        debug!(target: "Call/Media", "Media event loop finished for call {}", self.log_id().await);
    }

    async fn handle_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::Open => {
                self.media_open.store(true, Ordering::Relaxed);
                self.maybe_open().await;
            }
            MediaEvent::Volume {
                input_level,
                output_level,
            } => {
                let _ = self.events.volume.send(Arc::new(events::VolumeSample {
                    input_level,
                    output_level,
                }));
            }
            MediaEvent::Error { code, message } => {
                let error = resolve_protocol_error(
                    Some(code),
                    Some(&message),
                    self.deps.improved_error_precision,
                    ErrorKind::MediaConnectionError,
                );
                warn!(target: "Call/Media", "Media error on call {}: {error}", self.log_id().await);
                let _ = self.events.error.send(Arc::new(events::CallError {
                    error,
                    voice_event_sid: None,
                }));
            }
            MediaEvent::Disconnected | MediaEvent::Failed | MediaEvent::IceGatheringFailed => {
                self.on_media_failure(&event).await;
            }
            MediaEvent::Connected | MediaEvent::Reconnected => {
                self.on_media_recovered().await;
            }
            MediaEvent::Closed => {
                debug!(target: "Call/Media", "Media session closed for call {}", self.log_id().await);
            }
        }
    }

    async fn on_media_failure(self: &Arc<Self>, event: &MediaEvent) {
        let recoverable = {
            let state = self.state.lock().await;
            state.is_open() || matches!(*state, CallState::Reconnecting { .. })
        };
        if !recoverable {
            if !self.is_live().await {
                return;
            }
            let error = ProtocolError::new(
                ErrorKind::MediaConnectionError,
                format!("media setup failed: {event:?}"),
            );
            let _ = self.events.error.send(Arc::new(events::CallError {
                error,
                voice_event_sid: None,
            }));
            self.finalize(DisconnectReason::Error, true).await;
            return;
        }
        if self.media_reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.apply_transition(CallTransition::MediaLost).is_err() {
                self.media_reconnecting.store(false, Ordering::SeqCst);
                return;
            }
        }
        warn!(target: "Call/Media", "Media lost on call {}, starting ICE restarts", self.log_id().await);
        self.deps
            .publisher
            .publish(
                TelemetryEvent::error("media", "reconnecting")
                    .with_call_sid(self.call_sid.read().await.clone()),
            )
            .await;
        let error = ProtocolError::new(
            ErrorKind::MediaConnectionError,
            "media connection lost, restarting ICE",
        );
        let _ = self
            .events
            .reconnecting
            .send(Arc::new(events::Reconnecting { error }));
        tokio::task::spawn(self.clone().ice_restart_loop());
    }

    async fn ice_restart_loop(self: Arc<Self>) {
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if !self.media_reconnecting.load(Ordering::Relaxed) {
                return;
            }
            if !matches!(*self.state.lock().await, CallState::Reconnecting { .. }) {
                return;
            }
            if self.deps.ice_restart.should_give_up(started.elapsed()) {
                warn!(target: "Call/Media", "Giving up on media recovery for call {}", self.log_id().await);
                let error = ProtocolError::new(
                    ErrorKind::MediaConnectionError,
                    "media connection could not be restored",
                );
                let _ = self.events.error.send(Arc::new(events::CallError {
                    error,
                    voice_event_sid: None,
                }));
                self.finalize(DisconnectReason::Error, true).await;
                return;
            }
            if let Some(media) = self.media.read().await.clone() {
                debug!(target: "Call/Media", "ICE restart attempt {} for call {}", attempt + 1, self.log_id().await);
                if let Err(e) = media.ice_restart().await {
                    warn!(target: "Call/Media", "ICE restart attempt failed: {e}");
                }
            } else {
                return;
            }
            let delay = self.deps.ice_restart.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn on_media_recovered(self: &Arc<Self>) {
        if !self.media_reconnecting.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.apply_transition(CallTransition::MediaRestored).is_err() {
                return;
            }
        }
        info!(target: "Call/Media", "Media restored on call {}", self.log_id().await);
        self.publish_info("media", "reconnected").await;
        let _ = self.events.reconnected.send(Arc::new(events::Reconnected));
    }

    /// Moves to open once media flows and the answer exchange finished.
    async fn maybe_open(self: &Arc<Self>) {
        if !self.media_open.load(Ordering::Relaxed) || !self.answered.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut state = self.state.lock().await;
            if !matches!(
                *state,
                CallState::Connecting { .. } | CallState::Ringing { .. }
            ) {
                return;
            }
            if state.apply_transition(CallTransition::MediaOpen).is_err() {
                return;
            }
        }
        info!(target: "Call", "Call {} is open", self.log_id().await);
        self.publish_info("connection", "connected").await;
        let _ = self.events.accept.send(Arc::new(events::Accepted));
    }

    async fn handle_acquisition_failure(self: &Arc<Self>, err: AudioError) {
        let (kind, telemetry_name) = match &err {
            AudioError::PermissionDenied => (ErrorKind::PermissionDenied, "denied"),
            AudioError::AcquisitionFailed(_) => (ErrorKind::AcquisitionFailed, "failed"),
        };
        warn!(target: "Call", "Audio input unavailable: {err}");
        self.deps
            .publisher
            .publish(
                TelemetryEvent::error("get-user-media", telemetry_name)
                    .with_call_sid(self.call_sid.read().await.clone()),
            )
            .await;
        let error = ProtocolError::new(kind, err.to_string());
        let _ = self.events.error.send(Arc::new(events::CallError {
            error,
            voice_event_sid: None,
        }));
        self.finalize(DisconnectReason::Error, true).await;
    }

    async fn fail_setup(self: &Arc<Self>, kind: ErrorKind, message: String) {
        warn!(target: "Call", "Setup of call {} failed: {message}", self.log_id().await);
        let error = ProtocolError::new(kind, message);
        let _ = self.events.error.send(Arc::new(events::CallError {
            error,
            voice_event_sid: None,
        }));
        self.finalize(DisconnectReason::Error, true).await;
    }

    /// Closes the call exactly once: stops timers and media, emits the
    /// terminal event for the reason and notifies the owner.
    pub(crate) async fn finalize(self: &Arc<Self>, reason: DisconnectReason, emit_disconnect: bool) {
        {
            let mut state = self.state.lock().await;
            if state.is_terminal() {
                return;
            }
            if state
                .apply_transition(CallTransition::Ended { reason })
                .is_err()
            {
                return;
            }
        }
        info!(target: "Call", "Call {} closed: {reason:?}", self.log_id().await);
        self.signaling_detached.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(media) = self.media.write().await.take() {
            media.close().await;
        }
        self.deps.sounds.stop_incoming().await;
        if matches!(
            reason,
            DisconnectReason::LocalHangup | DisconnectReason::RemoteHangup
        ) {
            let _ = self.deps.sounds.play_disconnect().await;
        }
        match reason {
            DisconnectReason::Rejected => {
                let _ = self.events.reject.send(Arc::new(events::Rejected));
            }
            DisconnectReason::Cancelled => {
                let _ = self.events.cancel.send(Arc::new(events::Cancelled));
            }
            DisconnectReason::Ignored => {}
            _ => {
                if emit_disconnect {
                    let _ = self.events.disconnect.send(Arc::new(events::Disconnected));
                }
            }
        }
        (self.hooks.on_terminal)(self.clone()).await;
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("direction", &self.direction)
            .field("temp_call_id", &self.temp_call_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::call_fixture;
    use serde_json::json;

    #[test]
    fn test_random_sid_shape() {
        let sid = random_sid("KX");
        assert!(sid.starts_with("KX"));
        assert_eq!(sid.len(), 34);
        assert!(sid[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_sid("KX"), sid);
    }

    #[test]
    fn test_user_defined_message_defaults() {
        let message = CallMessage::user_defined(json!({"k": "v"}));
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.message_type, "user-defined-message");
    }

    #[tokio::test]
    async fn test_incoming_call_parses_custom_parameters() {
        let fixture = call_fixture();
        let mut parameters = IndexMap::new();
        parameters.insert("From".to_string(), "client:alice".to_string());
        parameters.insert(
            "Params".to_string(),
            "team=support%20desk&tier=1&agent=undefined".to_string(),
        );
        let call = Call::new_incoming(
            "CA1".to_string(),
            "v=0".to_string(),
            parameters,
            fixture.call_deps(),
            CallHooks::noop(),
        );
        let custom = call.custom_parameters().await;
        assert_eq!(custom.get("team").map(String::as_str), Some("support desk"));
        assert_eq!(custom.get("tier").map(String::as_str), Some("1"));
        // Whatever the caller sent is preserved, even a literal "undefined".
        assert_eq!(custom.get("agent").map(String::as_str), Some("undefined"));
        assert!(call.matches_id("CA1").await);
        assert!(!call.matches_id("CA2").await);
    }

    #[tokio::test]
    async fn test_send_message_validation() {
        let fixture = call_fixture();
        let call = Call::new_incoming(
            "CA1".to_string(),
            "v=0".to_string(),
            IndexMap::new(),
            fixture.call_deps(),
            CallHooks::noop(),
        );

        let no_type = CallMessage {
            content: json!({}),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            message_type: "  ".to_string(),
        };
        assert!(matches!(
            call.send_message(no_type).await,
            Err(VoiceError::InvalidArgument(_))
        ));

        let null_content = CallMessage {
            content: Value::Null,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            message_type: USER_DEFINED_MESSAGE.to_string(),
        };
        assert!(matches!(
            call.send_message(null_content).await,
            Err(VoiceError::InvalidArgument(_))
        ));

        // A valid message flows while the call is still pending; the
        // invite already named the CallSid it needs.
        let sid = call
            .send_message(CallMessage::user_defined(json!({"a": 1})))
            .await
            .unwrap();
        assert!(sid.starts_with("KX"));

        // Closing detaches the call from signaling.
        call.finalize(DisconnectReason::Cancelled, false).await;
        assert!(matches!(
            call.send_message(CallMessage::user_defined(json!({"a": 2}))).await,
            Err(VoiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_accept_after_close_is_a_no_op() {
        let fixture = call_fixture();
        let call = Call::new_incoming(
            "CA1".to_string(),
            "v=0".to_string(),
            IndexMap::new(),
            fixture.call_deps(),
            CallHooks::noop(),
        );
        call.finalize(DisconnectReason::Cancelled, false).await;
        call.accept(AcceptOptions::default()).await.unwrap();
        assert!(call.state().await.is_terminal());
        assert!(
            fixture.signaling.commands().await.is_empty(),
            "a dead call must not touch signaling"
        );
    }

    #[tokio::test]
    async fn test_outgoing_call_wire_id_upgrades() {
        let fixture = call_fixture();
        let call = Call::new_outgoing(IndexMap::new(), fixture.call_deps(), CallHooks::noop());
        let temp = call.temp_call_id().expect("temp id").to_string();
        assert!(temp.starts_with("TJ"));
        assert_eq!(call.wire_id().await, Some(temp.clone()));

        call.upgrade_call_sid("CA9").await;
        assert_eq!(call.wire_id().await, Some("CA9".to_string()));
        assert!(call.matches_id(&temp).await);
        assert!(call.matches_id("CA9").await);
        assert_eq!(
            call.parameters().await.get("CallSid").map(String::as_str),
            Some("CA9")
        );
    }
}
