//! Device registration and call intake.
//!
//! A [`Device`] owns the signaling channel slot, tracks presence against
//! the gateway and hands out [`Call`] sessions. One spawned dispatch task
//! per channel routes inbound notices either to the device itself or to
//! the call they address.

use crate::audio::{AudioHelper, NullSoundPlayer, SoundPlayer, StaticAudioHelper};
use crate::call::{Call, CallDeps, CallHook, CallHooks};
use crate::config::{AcceptOptions, ConnectOptions, DeviceOptions};
use crate::edge::{DEFAULT_EDGE, chunder_host, edge_for_region, signaling_url};
use crate::errors::{ErrorKind, ProtocolError, VoiceError, resolve_protocol_error};
use crate::events::{self, DeviceEventBus};
use crate::media::MediaHandlerFactory;
use crate::publisher::{EventPublisher, LogPublisher};
use crate::signaling::{
    AckNotice, AnswerNotice, CancelNotice, ChannelStatus, ConnectedInfo, ErrorNotice, HangupNotice,
    InviteNotice, MessageNotice, RingingNotice, SharedSignaling, SignalingChannel, SignalingConfig,
    SignalingEvent, SignalingFactory, with_channel,
};
use crate::token::ConnectToken;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};

/// How often an active registration is re-announced to the gateway.
pub const REGISTRATION_INTERVAL: Duration = Duration::from_secs(30);

/// How long incoming call delivery waits for the ringtone to start.
const RINGTONE_START_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Unregistered,
    Registering,
    Registered,
    Destroyed,
}

pub struct Device {
    pub events: DeviceEventBus,
    state: watch::Sender<DeviceState>,
    token: RwLock<String>,
    options: RwLock<DeviceOptions>,
    identity: RwLock<Option<String>>,
    region: RwLock<Option<String>>,
    edge: RwLock<Option<String>>,
    home: RwLock<Option<String>>,
    preferred_uri: RwLock<Option<String>>,
    signaling: SharedSignaling,
    signaling_factory: Arc<dyn SignalingFactory>,
    media_factory: Arc<dyn MediaHandlerFactory>,
    audio: Arc<dyn AudioHelper>,
    sounds: Arc<dyn SoundPlayer>,
    publisher: Arc<dyn EventPublisher>,
    active_call: RwLock<Option<Arc<Call>>>,
    pending_calls: RwLock<Vec<Arc<Call>>>,
    /// The user asked for registration; reconnects re-announce it.
    want_registered: AtomicBool,
    /// Stops re-announcing without dropping the channel, set when the
    /// gateway tells us further registrations are pointless.
    registration_halted: AtomicBool,
    registration_loop_running: AtomicBool,
    registration_stop: Notify,
    /// Invalidates outstanding token expiry timers when bumped.
    token_expiry_generation: AtomicU64,
    /// Serializes channel creation and teardown.
    setup_lock: Mutex<()>,
}

impl Device {
    pub fn new(
        token: impl Into<String>,
        options: DeviceOptions,
        signaling_factory: Arc<dyn SignalingFactory>,
        media_factory: Arc<dyn MediaHandlerFactory>,
    ) -> Arc<Self> {
        let sounds = options
            .sounds
            .clone()
            .unwrap_or_else(|| Arc::new(NullSoundPlayer));
        let audio = options
            .audio
            .clone()
            .unwrap_or_else(|| Arc::new(StaticAudioHelper::default()));
        let publisher = options
            .publisher
            .clone()
            .unwrap_or_else(|| Arc::new(LogPublisher));
        let (state, _) = watch::channel(DeviceState::Unregistered);
        Arc::new(Self {
            events: DeviceEventBus::new(),
            state,
            token: RwLock::new(token.into()),
            options: RwLock::new(options),
            identity: RwLock::new(None),
            region: RwLock::new(None),
            edge: RwLock::new(None),
            home: RwLock::new(None),
            preferred_uri: RwLock::new(None),
            signaling: Arc::new(tokio::sync::RwLock::new(None)),
            signaling_factory,
            media_factory,
            audio,
            sounds,
            publisher,
            active_call: RwLock::new(None),
            pending_calls: RwLock::new(Vec::new()),
            want_registered: AtomicBool::new(false),
            registration_halted: AtomicBool::new(false),
            registration_loop_running: AtomicBool::new(false),
            registration_stop: Notify::new(),
            token_expiry_generation: AtomicU64::new(0),
            setup_lock: Mutex::new(()),
        })
    }

    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Watch handle for registration state changes.
    pub fn state_changes(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    pub async fn identity(&self) -> Option<String> {
        self.identity.read().await.clone()
    }

    pub async fn region(&self) -> Option<String> {
        self.region.read().await.clone()
    }

    pub async fn edge(&self) -> Option<String> {
        self.edge.read().await.clone()
    }

    pub async fn home(&self) -> Option<String> {
        self.home.read().await.clone()
    }

    /// The gateway URI the channel is currently pinned to, once a
    /// connected or answer notice has named one.
    pub async fn preferred_uri(&self) -> Option<String> {
        self.preferred_uri.read().await.clone()
    }

    /// Candidate gateway URIs derived from the configured edges.
    pub async fn chunder_uris(&self) -> Vec<String> {
        self.options.read().await.resolved_signaling_uris()
    }

    pub async fn active_call(&self) -> Option<Arc<Call>> {
        self.active_call.read().await.clone()
    }

    /// True while the active call is live. A busy device refuses
    /// `connect` and, by default, drops further invites.
    pub async fn is_busy(&self) -> bool {
        self.busy().await
    }

    pub async fn pending_calls(&self) -> Vec<Arc<Call>> {
        self.pending_calls.read().await.clone()
    }

    fn set_state(&self, next: DeviceState) {
        self.state.send_replace(next);
    }

    /// Registers for incoming calls. Resolves once the gateway confirms
    /// with a ready notice.
    pub async fn register(self: &Arc<Self>) -> Result<(), VoiceError> {
        match self.state() {
            DeviceState::Destroyed => {
                return Err(VoiceError::InvalidState("device is destroyed".to_string()));
            }
            DeviceState::Registering | DeviceState::Registered => {
                return Err(VoiceError::InvalidState(
                    "device is already registering or registered".to_string(),
                ));
            }
            DeviceState::Unregistered => {}
        }
        let mut state_rx = self.state.subscribe();
        self.want_registered.store(true, Ordering::Relaxed);
        self.registration_halted.store(false, Ordering::Relaxed);
        self.set_state(DeviceState::Registering);
        let _ = self.events.registering.send(Arc::new(events::Registering));
        info!(target: "Device", "Registering for incoming calls");

        if let Err(e) = self.start_registration().await {
            self.want_registered.store(false, Ordering::Relaxed);
            self.set_state(DeviceState::Unregistered);
            let _ = self.events.unregistered.send(Arc::new(events::Unregistered));
            return Err(e);
        }

        loop {
            match *state_rx.borrow_and_update() {
                DeviceState::Registered => return Ok(()),
                DeviceState::Unregistered => {
                    return Err(VoiceError::Registration(
                        "registration did not complete".to_string(),
                    ));
                }
                DeviceState::Destroyed => {
                    return Err(VoiceError::InvalidState(
                        "device was destroyed while registering".to_string(),
                    ));
                }
                DeviceState::Registering => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(VoiceError::Registration("device dropped".to_string()));
            }
        }
    }

    async fn start_registration(self: &Arc<Self>) -> Result<(), VoiceError> {
        self.ensure_signaling().await?;
        // When the channel is still dialing, the connected handler sends
        // the register command as soon as the socket is up.
        let channel = with_channel(&self.signaling).await?;
        if channel.status() == ChannelStatus::Connected {
            channel.register(true).await?;
        }
        Ok(())
    }

    /// Withdraws availability for incoming calls and resolves once the
    /// gateway confirms with an offline notice. The channel stays up for
    /// outgoing calls.
    pub async fn unregister(self: &Arc<Self>) -> Result<(), VoiceError> {
        if self.state() != DeviceState::Registered {
            return Err(VoiceError::InvalidState(
                "device is not registered".to_string(),
            ));
        }
        let mut state_rx = self.state.subscribe();
        self.want_registered.store(false, Ordering::Relaxed);
        self.halt_registration_resend();
        let channel = with_channel(&self.signaling).await?;
        channel.register(false).await?;

        loop {
            match *state_rx.borrow_and_update() {
                DeviceState::Unregistered => {
                    info!(target: "Device", "Unregistered");
                    return Ok(());
                }
                DeviceState::Destroyed => {
                    return Err(VoiceError::InvalidState(
                        "device was destroyed while unregistering".to_string(),
                    ));
                }
                DeviceState::Registering | DeviceState::Registered => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(VoiceError::Registration("device dropped".to_string()));
            }
        }
    }

    fn halt_registration_resend(&self) {
        self.registration_halted.store(true, Ordering::Relaxed);
        self.registration_stop.notify_waiters();
    }

    fn spawn_registration_loop(self: &Arc<Self>) {
        if self.registration_loop_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let device = self.clone();
        tokio::task::spawn(async move {
            let _guard = scopeguard::guard(device.clone(), |d| {
                d.registration_loop_running.store(false, Ordering::SeqCst);
            });
            loop {
                tokio::select! {
                    biased;
                    _ = device.registration_stop.notified() => break,
                    _ = tokio::time::sleep(REGISTRATION_INTERVAL) => {}
                }
                if device.state() != DeviceState::Registered
                    || device.registration_halted.load(Ordering::Relaxed)
                {
                    break;
                }
                match with_channel(&device.signaling).await {
                    Ok(channel) => {
                        debug!(target: "Device/Registration", "Refreshing registration");
                        if let Err(e) = channel.register(true).await {
                            warn!(target: "Device/Registration", "Registration refresh failed: {e}");
                        }
                    }
                    Err(e) => {
                        debug!(target: "Device/Registration", "Registration refresh skipped: {e}");
                    }
                }
            }
            debug!(target: "Device/Registration", "Registration refresh loop stopped");
        });
    }

    async fn ensure_signaling(self: &Arc<Self>) -> Result<(), VoiceError> {
        let _guard = self.setup_lock.lock().await;
        if self.signaling.read().await.is_some() {
            return Ok(());
        }
        self.create_channel().await
    }

    /// Builds a fresh channel into the shared slot. Caller holds
    /// `setup_lock`.
    async fn create_channel(self: &Arc<Self>) -> Result<(), VoiceError> {
        let options = self.options.read().await.clone();
        let config = SignalingConfig {
            uris: options.resolved_signaling_uris(),
            token: self.token.read().await.clone(),
            reconnect: options.signaling_reconnect_policy(),
            max_preferred_duration: options.max_call_signaling_timeout,
        };
        let (channel, event_rx) = self.signaling_factory.create(config).await?;
        *self.signaling.write().await = Some(channel.clone());
        tokio::task::spawn(self.clone().dispatch_loop(channel, event_rx));
        Ok(())
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        channel: Arc<dyn SignalingChannel>,
        mut event_rx: mpsc::Receiver<SignalingEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            self.handle_signaling_event(&channel, event).await;
        }
        debug!(target: "Device", "Signaling dispatch finished");
    }

    async fn handle_signaling_event(
        self: &Arc<Self>,
        channel: &Arc<dyn SignalingChannel>,
        event: SignalingEvent,
    ) {
        match event {
            SignalingEvent::Connected(info) => self.on_connected(info).await,
            SignalingEvent::Ready => self.on_ready().await,
            SignalingEvent::Offline => self.on_offline().await,
            SignalingEvent::Invite(notice) => self.on_invite(notice).await,
            SignalingEvent::Ringing(notice) => self.on_ringing(notice).await,
            SignalingEvent::Answer(notice) => self.on_answer(notice).await,
            SignalingEvent::Cancel(notice) => self.on_cancel(notice).await,
            SignalingEvent::Hangup(notice) => self.on_hangup(notice).await,
            SignalingEvent::Ack(notice) => self.on_ack(notice).await,
            SignalingEvent::Message(notice) => self.on_message(notice).await,
            SignalingEvent::Error(notice) => self.on_error(notice).await,
            SignalingEvent::TransportClose => self.on_transport_close().await,
            SignalingEvent::Close => self.on_close(channel).await,
        }
    }

    /// A permanently closed channel releases its slot; a replacement that
    /// already took the slot is left alone. The device state is untouched,
    /// an offline notice is expected to have preceded this.
    async fn on_close(&self, closed: &Arc<dyn SignalingChannel>) {
        let mut slot = self.signaling.write().await;
        if let Some(current) = slot.as_ref()
            && Arc::ptr_eq(current, closed)
        {
            *slot = None;
            debug!(target: "Device", "Signaling channel closed, slot released");
        }
    }

    async fn on_connected(self: &Arc<Self>, info: ConnectedInfo) {
        info!(
            target: "Device",
            "Signaling connected, region {:?}, edge {:?}",
            info.region, info.edge
        );
        *self.identity.write().await = info.identity.clone();
        *self.region.write().await = info.region.clone();
        *self.home.write().await = info.home.clone();
        let edge = info
            .edge
            .clone()
            .or_else(|| {
                info.region
                    .as_deref()
                    .and_then(edge_for_region)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_EDGE.to_string());
        *self.edge.write().await = Some(edge);

        if let Some(home) = info.home.as_deref() {
            *self.preferred_uri.write().await = Some(home.to_string());
            if let Ok(channel) = with_channel(&self.signaling).await {
                channel.update_preferred_uri(Some(home)).await;
            }
        }
        if let Some(lifetime) = &info.token {
            self.arm_token_expiry(lifetime.ttl).await;
        }
        if self.want_registered.load(Ordering::Relaxed)
            && !self.registration_halted.load(Ordering::Relaxed)
            && let Ok(channel) = with_channel(&self.signaling).await
            && let Err(e) = channel.register(true).await
        {
            warn!(target: "Device", "Register command failed after connect: {e}");
        }
        if let Some(call) = self.active_call.read().await.clone() {
            call.handle_signaling_connected().await;
        }
    }

    /// Schedules the token expiry warning one refresh interval before the
    /// reported lifetime runs out. Re-arming supersedes earlier timers.
    async fn arm_token_expiry(self: &Arc<Self>, ttl_seconds: u64) {
        let generation = self.token_expiry_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let lead = self.options.read().await.token_refresh();
        let ttl = Duration::from_secs(ttl_seconds);
        let wait = ttl.saturating_sub(lead);
        let device = self.clone();
        tokio::task::spawn(async move {
            tokio::time::sleep(wait).await;
            if device.token_expiry_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if device.state() == DeviceState::Destroyed {
                return;
            }
            let expires_in = ttl.saturating_sub(wait);
            info!(target: "Device", "Access token expires in {expires_in:?}");
            let _ = device
                .events
                .token_will_expire
                .send(Arc::new(events::TokenWillExpire { expires_in }));
        });
    }

    async fn on_ready(self: &Arc<Self>) {
        if self.state() == DeviceState::Destroyed {
            return;
        }
        if !self.want_registered.load(Ordering::Relaxed) {
            debug!(target: "Device", "Ready notice while not registering");
            return;
        }
        if self.state() != DeviceState::Registered {
            info!(target: "Device", "Registered");
            self.set_state(DeviceState::Registered);
            let _ = self.events.registered.send(Arc::new(events::Registered));
        }
        self.spawn_registration_loop();
    }

    async fn on_offline(self: &Arc<Self>) {
        *self.region.write().await = None;
        *self.edge.write().await = None;
        *self.home.write().await = None;
        *self.preferred_uri.write().await = None;
        if self.state() == DeviceState::Destroyed {
            return;
        }
        if self.state() != DeviceState::Unregistered {
            if self.want_registered.load(Ordering::Relaxed) {
                warn!(target: "Device", "Gateway reported this device offline");
            } else {
                info!(target: "Device", "Offline confirmed by gateway");
            }
            self.set_state(DeviceState::Unregistered);
            let _ = self.events.unregistered.send(Arc::new(events::Unregistered));
        }
    }

    async fn on_invite(self: &Arc<Self>, notice: InviteNotice) {
        if self.state() == DeviceState::Destroyed {
            return;
        }
        let (Some(call_sid), Some(sdp)) = (notice.call_sid.clone(), notice.sdp.clone()) else {
            warn!(target: "Device", "Malformed invite, missing callsid or sdp");
            let error = ProtocolError::new(
                ErrorKind::MalformedRequest,
                "invite notice missing callsid or sdp",
            );
            let _ = self.events.error.send(Arc::new(events::DeviceError {
                error,
                call_sid: notice.call_sid.clone(),
            }));
            return;
        };
        let options = self.options.read().await.clone();
        if self.busy().await && !options.allow_incoming_while_busy {
            debug!(target: "Device", "Dropping invite {call_sid} while busy");
            return;
        }
        if self.find_call(&call_sid).await.is_some() {
            debug!(target: "Device", "Duplicate invite for call {call_sid}");
            return;
        }
        let call = Call::new_incoming(
            call_sid.clone(),
            sdp,
            notice.parameters.clone(),
            self.call_deps(&options),
            self.call_hooks(),
        );
        self.pending_calls.write().await.push(call.clone());
        info!(target: "Device", "Incoming call {call_sid}");

        // The ringtone gets a bounded head start; a player that never
        // resolves must not hold up delivery.
        match tokio::time::timeout(RINGTONE_START_TIMEOUT, self.sounds.play_incoming()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target: "Device", "Incoming ringtone failed: {e}"),
            Err(_) => {
                warn!(target: "Device", "Incoming ringtone did not start in {RINGTONE_START_TIMEOUT:?}")
            }
        }
        let _ = self.events.incoming.send(call);
    }

    async fn on_ringing(&self, notice: RingingNotice) {
        let Some(call) = self
            .route_to_call(&[notice.temp_call_sid.as_deref(), notice.call_sid.as_deref()])
            .await
        else {
            debug!(target: "Device", "Ringing notice for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_ringing(&notice).await;
    }

    async fn on_answer(self: &Arc<Self>, notice: AnswerNotice) {
        if let Some(edge) = notice.edge.as_deref() {
            *self.edge.write().await = Some(edge.to_string());
            let uri = signaling_url(&chunder_host(edge));
            *self.preferred_uri.write().await = Some(uri.clone());
            if let Ok(channel) = with_channel(&self.signaling).await {
                channel.update_preferred_uri(Some(&uri)).await;
            }
        }
        let Some(call) = self
            .route_to_call(&[notice.temp_call_sid.as_deref(), notice.call_sid.as_deref()])
            .await
        else {
            debug!(target: "Device", "Answer notice for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_answer(&notice).await;
    }

    async fn on_cancel(&self, notice: CancelNotice) {
        let Some(call) = self.route_to_call(&[notice.call_sid.as_deref()]).await else {
            debug!(target: "Device", "Cancel notice for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_cancel().await;
    }

    async fn on_hangup(&self, notice: HangupNotice) {
        let Some(call) = self.route_to_call(&[notice.call_sid.as_deref()]).await else {
            debug!(target: "Device", "Hangup notice for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_hangup(&notice).await;
    }

    async fn on_ack(&self, notice: AckNotice) {
        let Some(call) = self.route_to_call(&[notice.call_sid.as_deref()]).await else {
            debug!(target: "Device", "Ack for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_ack(&notice).await;
    }

    async fn on_message(&self, notice: MessageNotice) {
        let Some(call) = self.route_to_call(&[notice.call_sid.as_deref()]).await else {
            debug!(target: "Device", "Message for unknown call {:?}", notice.call_sid);
            return;
        };
        call.handle_message(&notice).await;
    }

    async fn on_error(self: &Arc<Self>, notice: ErrorNotice) {
        if notice.error.is_none() {
            debug!(target: "Device", "Error notice without an error body, ignoring");
            return;
        }
        if let Some(call) = self.route_to_call(&[notice.call_sid.as_deref()]).await {
            call.handle_error_notice(&notice).await;
            return;
        }
        if notice.voice_event_sid().is_some() {
            debug!(target: "Device", "Error reply for unknown voiceeventsid");
            return;
        }
        if notice.code() == Some(31205) {
            // The token expired; further re-registrations with it are
            // pointless until the application refreshes it.
            warn!(target: "Device", "Token expired, halting registration refresh");
            self.halt_registration_resend();
        }
        let options = self.options.read().await.clone();
        let error = resolve_protocol_error(
            notice.code(),
            notice.message(),
            options.improved_signaling_error_precision,
            ErrorKind::Unknown,
        );
        warn!(target: "Device", "Signaling error: {error}");
        let _ = self.events.error.send(Arc::new(events::DeviceError {
            error,
            call_sid: notice.call_sid.clone(),
        }));
    }

    async fn on_transport_close(&self) {
        warn!(target: "Device", "Signaling transport closed");
        for call in self.all_calls().await {
            call.handle_transport_close().await;
        }
    }

    /// Dials an outgoing call, or resumes one when the options carry a
    /// connect token. Pending incoming calls are dropped locally first.
    pub async fn connect(self: &Arc<Self>, options: ConnectOptions) -> Result<Arc<Call>, VoiceError> {
        if self.state() == DeviceState::Destroyed {
            return Err(VoiceError::InvalidState("device is destroyed".to_string()));
        }
        if self.busy().await {
            return Err(VoiceError::InvalidState(
                "another call is already active".to_string(),
            ));
        }
        self.ensure_signaling().await?;
        let device_options = self.options.read().await.clone();
        let deps = self.call_deps(&device_options);
        let call = match options.connect_token.as_deref() {
            Some(token) => {
                let token = ConnectToken::decode(token)?;
                info!(target: "Device", "Resuming call {}", token.call_sid());
                Call::new_resumed(token, deps, self.call_hooks())
            }
            None => Call::new_outgoing(options.params.clone(), deps, self.call_hooks()),
        };
        for pending in self.drain_pending().await {
            let _ = pending.ignore().await;
        }
        call.accept(AcceptOptions {
            input_stream: options.input_stream.clone(),
        })
        .await?;
        Ok(call)
    }

    /// Replaces the access token used for signaling.
    pub async fn update_token(&self, token: &str) -> Result<(), VoiceError> {
        if token.is_empty() {
            return Err(VoiceError::InvalidArgument(
                "token must not be empty".to_string(),
            ));
        }
        if self.state() == DeviceState::Destroyed {
            return Err(VoiceError::InvalidState("device is destroyed".to_string()));
        }
        *self.token.write().await = token.to_string();
        // The next registration cycle may succeed with the new token.
        self.registration_halted.store(false, Ordering::Relaxed);
        if let Ok(channel) = with_channel(&self.signaling).await {
            channel.set_token(token).await?;
        }
        Ok(())
    }

    /// Applies new options. Changing the gateway targets tears the channel
    /// down and redials, which is refused while a call is active.
    pub async fn update_options(self: &Arc<Self>, new_options: DeviceOptions) -> Result<(), VoiceError> {
        if self.state() == DeviceState::Destroyed {
            return Err(VoiceError::InvalidState("device is destroyed".to_string()));
        }
        let transport_changed = {
            let current = self.options.read().await;
            current.edges != new_options.edges || current.signaling_uris != new_options.signaling_uris
        };
        if transport_changed && self.busy().await {
            return Err(VoiceError::InvalidState(
                "cannot change signaling hosts during an active call".to_string(),
            ));
        }
        *self.options.write().await = new_options;
        if transport_changed {
            let _guard = self.setup_lock.lock().await;
            let existing = self.signaling.write().await.take();
            if let Some(channel) = existing {
                channel.destroy().await;
                // Redial only when a connection already existed; otherwise
                // the next register or connect dials with the new targets.
                self.create_channel().await?;
            }
        }
        Ok(())
    }

    /// Tears the device down: pending calls are rejected, the active call
    /// hung up, the channel closed. Irreversible and idempotent.
    pub async fn destroy(self: &Arc<Self>) {
        if self.state() == DeviceState::Destroyed {
            return;
        }
        info!(target: "Device", "Destroying device");
        self.want_registered.store(false, Ordering::Relaxed);
        self.halt_registration_resend();
        self.token_expiry_generation.fetch_add(1, Ordering::SeqCst);
        for call in self.drain_pending().await {
            let _ = call.reject().await;
        }
        // Snapshot the call so the slot's read guard is released before
        // disconnect; finalize re-enters the slot via release_call.
        let active = self.active_call.read().await.clone();
        if let Some(call) = active {
            let _ = call.disconnect().await;
        }
        {
            let _guard = self.setup_lock.lock().await;
            if let Some(channel) = self.signaling.write().await.take() {
                channel.destroy().await;
            }
        }
        self.set_state(DeviceState::Destroyed);
        let _ = self.events.destroyed.send(Arc::new(events::Destroyed));
    }

    fn call_deps(&self, options: &DeviceOptions) -> CallDeps {
        CallDeps {
            signaling: self.signaling.clone(),
            media_factory: self.media_factory.clone(),
            audio: self.audio.clone(),
            sounds: self.sounds.clone(),
            publisher: self.publisher.clone(),
            improved_error_precision: options.improved_signaling_error_precision,
            ice_restart: options.ice_restart_policy(),
            voice_event_sid_generator: options.voice_event_sid_generator.clone(),
        }
    }

    fn call_hooks(self: &Arc<Self>) -> CallHooks {
        let on_accepted: CallHook = {
            let device = Arc::downgrade(self);
            Box::new(move |call: Arc<Call>| -> BoxFuture<'static, ()> {
                let device = device.clone();
                Box::pin(async move {
                    if let Some(device) = device.upgrade() {
                        device.claim_active(call).await;
                    }
                })
            })
        };
        let on_terminal: CallHook = {
            let device = Arc::downgrade(self);
            Box::new(move |call: Arc<Call>| -> BoxFuture<'static, ()> {
                let device = device.clone();
                Box::pin(async move {
                    if let Some(device) = device.upgrade() {
                        device.release_call(call).await;
                    }
                })
            })
        };
        CallHooks {
            on_accepted,
            on_terminal,
        }
    }

    /// An accepted call takes the active slot. Anything already holding
    /// it is hung up first; the device carries one live call at a time.
    async fn claim_active(&self, call: Arc<Call>) {
        self.pending_calls
            .write()
            .await
            .retain(|c| !Arc::ptr_eq(c, &call));
        let previous = {
            let mut active = self.active_call.write().await;
            match active.as_ref() {
                Some(current) if Arc::ptr_eq(current, &call) => None,
                _ => active.replace(call),
            }
        };
        if let Some(previous) = previous {
            let _ = previous.disconnect().await;
        }
    }

    async fn release_call(&self, call: Arc<Call>) {
        self.pending_calls
            .write()
            .await
            .retain(|c| !Arc::ptr_eq(c, &call));
        let mut active = self.active_call.write().await;
        if let Some(current) = active.as_ref()
            && Arc::ptr_eq(current, &call)
        {
            *active = None;
        }
    }

    async fn busy(&self) -> bool {
        let active = self.active_call.read().await.clone();
        match active {
            Some(call) => call.is_live().await,
            None => false,
        }
    }

    async fn drain_pending(&self) -> Vec<Arc<Call>> {
        std::mem::take(&mut *self.pending_calls.write().await)
    }

    async fn find_call(&self, id: &str) -> Option<Arc<Call>> {
        let active = self.active_call.read().await.clone();
        if let Some(call) = active
            && call.matches_id(id).await
        {
            return Some(call);
        }
        let pending = self.pending_calls.read().await.clone();
        for call in pending {
            if call.matches_id(id).await {
                return Some(call);
            }
        }
        None
    }

    async fn route_to_call(&self, ids: &[Option<&str>]) -> Option<Arc<Call>> {
        for id in ids.iter().flatten() {
            if let Some(call) = self.find_call(id).await {
                return Some(call);
            }
        }
        None
    }

    async fn all_calls(&self) -> Vec<Arc<Call>> {
        let mut calls = self.pending_calls.read().await.clone();
        if let Some(active) = self.active_call.read().await.clone() {
            calls.push(active);
        }
        calls
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
