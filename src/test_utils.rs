//! Shared fakes and fixtures for unit and integration tests.
//!
//! The fakes stand in at the same seams a production build plugs into:
//! the signaling factory, the media handler factory, audio acquisition
//! and sound playback. Commands sent through them are recorded so tests
//! can assert on the exact wire traffic a scenario produces.

use crate::audio::{AudioError, AudioHelper, SoundPlayer};
use crate::call::{Call, CallDeps};
use crate::config::{BackoffPolicy, ConnectOptions, DeviceOptions};
use crate::device::Device;
use crate::media::{
    InputStream, MediaError, MediaEvent, MediaHandler, MediaHandlerFactory, Sdp,
};
use crate::publisher::{EventPublisher, TelemetryEvent};
use crate::signaling::{
    AnswerNotice, CallMessageFrame, ChannelStatus, ConnectedInfo, InviteNotice, RingingNotice,
    SharedSignaling, SignalingChannel, SignalingConfig, SignalingError, SignalingEvent,
    SignalingFactory,
};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};

/// Everything a [`FakeSignaling`] channel was asked to send.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    Register {
        available: bool,
    },
    Invite {
        call_id: String,
        sdp: String,
        params: IndexMap<String, String>,
    },
    Answer {
        call_sid: String,
        sdp: String,
    },
    Reconnect {
        sdp: String,
        call_sid: String,
        reconnect_token: String,
    },
    Hangup {
        call_sid: String,
        message: Option<String>,
    },
    Reject {
        call_sid: String,
    },
    Dtmf {
        call_sid: String,
        digit: char,
    },
    Message(CallMessageFrame),
    SetToken(String),
    PreferredUri(Option<String>),
    Destroy,
}

/// In-memory signaling channel. Tests push gateway notices with
/// [`FakeSignaling::push`] and read back sent commands in order.
pub struct FakeSignaling {
    status: AtomicU8,
    fail_sends: AtomicBool,
    commands: Mutex<Vec<RecordedCommand>>,
    command_tx: mpsc::UnboundedSender<RecordedCommand>,
    command_rx: Mutex<mpsc::UnboundedReceiver<RecordedCommand>>,
    event_tx: mpsc::Sender<SignalingEvent>,
}

impl FakeSignaling {
    fn new(event_tx: mpsc::Sender<SignalingEvent>) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            status: AtomicU8::new(ChannelStatus::Connected as u8),
            fail_sends: AtomicBool::new(false),
            commands: Mutex::new(Vec::new()),
            command_tx,
            command_rx: Mutex::new(command_rx),
            event_tx,
        })
    }

    /// Channel with its event receiver, for tests that drive a call
    /// directly without a device.
    pub fn standalone() -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        (Self::new(event_tx), event_rx)
    }

    /// Delivers a gateway notice to whoever consumes the event receiver.
    pub async fn push(&self, event: SignalingEvent) {
        self.event_tx
            .send(event)
            .await
            .expect("event receiver should be alive");
    }

    pub fn set_status(&self, status: ChannelStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub async fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().await.clone()
    }

    /// Next recorded command, waiting up to a second for it to arrive.
    pub async fn next_command(&self) -> RecordedCommand {
        let mut rx = self.command_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("a command within 1s")
            .expect("command sender should be alive")
    }

    async fn record(&self, command: RecordedCommand) -> Result<(), SignalingError> {
        match ChannelStatus::from_u8(self.status.load(Ordering::SeqCst)) {
            ChannelStatus::Destroyed => return Err(SignalingError::Destroyed),
            ChannelStatus::Offline | ChannelStatus::Connecting => {
                return Err(SignalingError::Offline);
            }
            ChannelStatus::Connected => {}
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SignalingError::Send("forced failure".to_string()));
        }
        self.commands.lock().await.push(command.clone());
        let _ = self.command_tx.send(command);
        Ok(())
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn register(&self, available: bool) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Register { available }).await
    }

    async fn invite(
        &self,
        call_id: &str,
        sdp: &str,
        params: &IndexMap<String, String>,
    ) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Invite {
            call_id: call_id.to_string(),
            sdp: sdp.to_string(),
            params: params.clone(),
        })
        .await
    }

    async fn answer(&self, call_sid: &str, sdp: &str) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Answer {
            call_sid: call_sid.to_string(),
            sdp: sdp.to_string(),
        })
        .await
    }

    async fn reconnect(
        &self,
        sdp: &str,
        call_sid: &str,
        reconnect_token: &str,
    ) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Reconnect {
            sdp: sdp.to_string(),
            call_sid: call_sid.to_string(),
            reconnect_token: reconnect_token.to_string(),
        })
        .await
    }

    async fn hangup(&self, call_sid: &str, message: Option<&str>) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Hangup {
            call_sid: call_sid.to_string(),
            message: message.map(str::to_string),
        })
        .await
    }

    async fn reject(&self, call_sid: &str) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Reject {
            call_sid: call_sid.to_string(),
        })
        .await
    }

    async fn dtmf(&self, call_sid: &str, digit: char) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Dtmf {
            call_sid: call_sid.to_string(),
            digit,
        })
        .await
    }

    async fn send_message(&self, frame: CallMessageFrame) -> Result<(), SignalingError> {
        self.record(RecordedCommand::Message(frame)).await
    }

    async fn set_token(&self, token: &str) -> Result<(), SignalingError> {
        self.record(RecordedCommand::SetToken(token.to_string())).await
    }

    async fn update_preferred_uri(&self, uri: Option<&str>) {
        let _ = self
            .record(RecordedCommand::PreferredUri(uri.map(str::to_string)))
            .await;
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    async fn destroy(&self) {
        self.commands.lock().await.push(RecordedCommand::Destroy);
        let _ = self.command_tx.send(RecordedCommand::Destroy);
        self.status
            .store(ChannelStatus::Destroyed as u8, Ordering::SeqCst);
        let _ = self.event_tx.send(SignalingEvent::Close).await;
    }
}

/// Factory handing out [`FakeSignaling`] channels and remembering them.
#[derive(Default)]
pub struct FakeSignalingFactory {
    channels: std::sync::Mutex<Vec<Arc<FakeSignaling>>>,
    configs: std::sync::Mutex<Vec<SignalingConfig>>,
    created: Notify,
}

impl FakeSignalingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn channel(&self, index: usize) -> Arc<FakeSignaling> {
        self.channels.lock().unwrap()[index].clone()
    }

    pub fn configs(&self) -> Vec<SignalingConfig> {
        self.configs.lock().unwrap().clone()
    }

    /// Most recent channel, waiting for one to be created if necessary.
    pub async fn wait_for_channel(&self) -> Arc<FakeSignaling> {
        loop {
            if let Some(channel) = self.channels.lock().unwrap().last().cloned() {
                return channel;
            }
            self.created.notified().await;
        }
    }
}

#[async_trait]
impl SignalingFactory for FakeSignalingFactory {
    async fn create(
        &self,
        config: SignalingConfig,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>), SignalingError> {
        let (event_tx, event_rx) = mpsc::channel(100);
        let channel = FakeSignaling::new(event_tx);
        self.configs.lock().unwrap().push(config);
        self.channels.lock().unwrap().push(channel.clone());
        self.created.notify_one();
        Ok((channel, event_rx))
    }
}

/// Scripted media handler. With `auto_open` the open event fires as soon
/// as the session is opened; everything else is injected with
/// [`FakeMedia::emit`].
pub struct FakeMedia {
    auto_open: bool,
    fail_open: bool,
    muted: AtomicBool,
    open_calls: AtomicU32,
    close_calls: AtomicU32,
    ice_restarts: AtomicU32,
    local_sdp: Mutex<Option<Sdp>>,
    event_tx: mpsc::Sender<MediaEvent>,
}

impl FakeMedia {
    pub async fn emit(&self, event: MediaEvent) {
        let _ = self.event_tx.send(event).await;
    }

    pub fn ice_restarts(&self) -> u32 {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> bool {
        self.open_calls.load(Ordering::SeqCst) > 0
    }

    pub fn closed(&self) -> bool {
        self.close_calls.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl MediaHandler for FakeMedia {
    async fn open(&self, _input: &InputStream) -> Result<(), MediaError> {
        if self.fail_open {
            return Err(MediaError::Other("forced open failure".to_string()));
        }
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.auto_open {
            let _ = self.event_tx.send(MediaEvent::Open).await;
        }
        Ok(())
    }

    async fn answer_incoming_call(&self, remote_sdp: &str) -> Result<Sdp, MediaError> {
        let sdp = format!("answer-to:{remote_sdp}");
        *self.local_sdp.lock().await = Some(sdp.clone());
        Ok(sdp)
    }

    async fn make_outgoing_call(
        &self,
        call_id: &str,
        _reconnect_token: Option<&str>,
    ) -> Result<Sdp, MediaError> {
        let sdp = format!("offer-for:{call_id}");
        *self.local_sdp.lock().await = Some(sdp.clone());
        Ok(sdp)
    }

    async fn set_input_tracks_from_stream(&self, _input: &InputStream) -> Result<(), MediaError> {
        Ok(())
    }

    async fn mute(&self, muted: bool) -> Result<(), MediaError> {
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    async fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    async fn ice_restart(&self) -> Result<(), MediaError> {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn local_description(&self) -> Option<Sdp> {
        self.local_sdp.lock().await.clone()
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeMediaFactory {
    auto_open: AtomicBool,
    fail_open: AtomicBool,
    fail_create: AtomicBool,
    handlers: std::sync::Mutex<Vec<Arc<FakeMedia>>>,
}

impl FakeMediaFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            auto_open: AtomicBool::new(true),
            fail_open: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            handlers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn set_auto_open(&self, auto_open: bool) {
        self.auto_open.store(auto_open, Ordering::SeqCst);
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn last_handler(&self) -> Arc<FakeMedia> {
        self.handlers
            .lock()
            .unwrap()
            .last()
            .expect("a media handler was created")
            .clone()
    }
}

#[async_trait]
impl MediaHandlerFactory for FakeMediaFactory {
    async fn create(&self) -> Result<(Arc<dyn MediaHandler>, mpsc::Receiver<MediaEvent>), MediaError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(MediaError::Other("forced create failure".to_string()));
        }
        let (event_tx, event_rx) = mpsc::channel(100);
        let media = Arc::new(FakeMedia {
            auto_open: self.auto_open.load(Ordering::SeqCst),
            fail_open: self.fail_open.load(Ordering::SeqCst),
            muted: AtomicBool::new(false),
            open_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            ice_restarts: AtomicU32::new(0),
            local_sdp: Mutex::new(None),
            event_tx,
        });
        self.handlers.lock().unwrap().push(media.clone());
        Ok((media, event_rx))
    }
}

/// Audio helper whose acquisition can be made to fail like a denied
/// microphone permission.
pub struct GatedAudioHelper {
    deny: AtomicBool,
    stream: InputStream,
}

impl Default for GatedAudioHelper {
    fn default() -> Self {
        Self {
            deny: AtomicBool::new(false),
            stream: InputStream::new("test-input"),
        }
    }
}

impl GatedAudioHelper {
    pub fn deny_input(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioHelper for GatedAudioHelper {
    async fn input_device_ready(&self) {}

    async fn acquire_input(&self) -> Result<InputStream, AudioError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(AudioError::PermissionDenied);
        }
        Ok(self.stream.clone())
    }
}

/// Sound player that counts playbacks instead of producing audio. With
/// `block_incoming` the ringtone never resolves, which exercises the
/// bounded wait on invite delivery.
#[derive(Default)]
pub struct RecordingSounds {
    incoming_started: AtomicU32,
    incoming_stopped: AtomicU32,
    disconnect_played: AtomicU32,
    dtmf_tones: std::sync::Mutex<Vec<String>>,
    block_incoming: AtomicBool,
}

impl RecordingSounds {
    pub fn block_incoming(&self, block: bool) {
        self.block_incoming.store(block, Ordering::SeqCst);
    }

    pub fn incoming_started(&self) -> u32 {
        self.incoming_started.load(Ordering::SeqCst)
    }

    pub fn incoming_stopped(&self) -> u32 {
        self.incoming_stopped.load(Ordering::SeqCst)
    }

    pub fn disconnect_played(&self) -> u32 {
        self.disconnect_played.load(Ordering::SeqCst)
    }

    pub fn dtmf_tones(&self) -> Vec<String> {
        self.dtmf_tones.lock().unwrap().clone()
    }
}

#[async_trait]
impl SoundPlayer for RecordingSounds {
    async fn play_incoming(&self) -> Result<(), anyhow::Error> {
        if self.block_incoming.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.incoming_started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_incoming(&self) {
        self.incoming_stopped.fetch_add(1, Ordering::SeqCst);
    }

    async fn play_dtmf(&self, tone: &str) -> Result<(), anyhow::Error> {
        self.dtmf_tones.lock().unwrap().push(tone.to_string());
        Ok(())
    }

    async fn play_disconnect(&self) -> Result<(), anyhow::Error> {
        self.disconnect_played.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: std::sync::Mutex<Vec<TelemetryEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Recorded events as `group/name` strings, in publish order.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| format!("{}/{}", e.group, e.name))
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Deterministic backoff for tests: short, no jitter.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(10),
        multiplier: 2.0,
        max_delay: Duration::from_millis(40),
        give_up_after: Some(Duration::from_secs(5)),
        jitter: false,
    }
}

pub fn test_options() -> DeviceOptions {
    DeviceOptions {
        signaling_uris: Some(vec!["wss://gateway.test/signal".to_string()]),
        signaling_reconnect: Some(fast_backoff()),
        ice_restart: Some(fast_backoff()),
        ..Default::default()
    }
}

/// A device wired to fakes, with handles to all of them.
pub struct TestHarness {
    pub device: Arc<Device>,
    pub signaling_factory: Arc<FakeSignalingFactory>,
    pub media_factory: Arc<FakeMediaFactory>,
    pub audio: Arc<GatedAudioHelper>,
    pub sounds: Arc<RecordingSounds>,
    pub publisher: Arc<RecordingPublisher>,
}

pub fn test_harness() -> TestHarness {
    test_harness_with(test_options())
}

pub fn test_harness_with(mut options: DeviceOptions) -> TestHarness {
    let audio = Arc::new(GatedAudioHelper::default());
    let sounds = Arc::new(RecordingSounds::default());
    let publisher = Arc::new(RecordingPublisher::default());
    options.audio = Some(audio.clone());
    options.sounds = Some(sounds.clone());
    options.publisher = Some(publisher.clone());
    let signaling_factory = FakeSignalingFactory::new();
    let media_factory = FakeMediaFactory::new();
    let device = Device::new(
        "test-token",
        options,
        signaling_factory.clone(),
        media_factory.clone(),
    );
    TestHarness {
        device,
        signaling_factory,
        media_factory,
        audio,
        sounds,
        publisher,
    }
}

/// Registers the harness device, driving the fake gateway through the
/// confirmation, and returns the channel it registered on.
pub async fn register_device(harness: &TestHarness) -> Arc<FakeSignaling> {
    let device = harness.device.clone();
    let register_task = tokio::task::spawn(async move { device.register().await });
    let channel = harness.signaling_factory.wait_for_channel().await;
    assert_eq!(
        channel.next_command().await,
        RecordedCommand::Register { available: true }
    );
    channel.push(SignalingEvent::Ready).await;
    register_task
        .await
        .expect("register task should not panic")
        .expect("registration should succeed");
    channel
}

pub const OUTGOING_CALL_SID: &str = "CA-outgoing-1";
pub const RECONNECT_TOKEN: &str = "rt-test-1";

/// Dials an outgoing call and walks the fake gateway through ringing and
/// answer until it is open. Returns the call and its channel.
pub async fn open_outgoing_call(harness: &TestHarness) -> (Arc<Call>, Arc<FakeSignaling>) {
    let call = harness
        .device
        .connect(ConnectOptions::default())
        .await
        .expect("connect should succeed");
    let channel = harness.signaling_factory.wait_for_channel().await;
    let RecordedCommand::Invite { call_id, .. } = channel.next_command().await else {
        panic!("expected an invite command");
    };
    channel
        .push(SignalingEvent::Ringing(RingingNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            temp_call_sid: Some(call_id),
            sdp: None,
        }))
        .await;
    channel
        .push(SignalingEvent::Answer(AnswerNotice {
            call_sid: Some(OUTGOING_CALL_SID.to_string()),
            temp_call_sid: None,
            reconnect: Some(RECONNECT_TOKEN.to_string()),
            edge: None,
        }))
        .await;
    wait_until("call to open", || {
        let call = call.clone();
        async move { call.state().await.is_open() }
    })
    .await;
    (call, channel)
}

/// A plausible invite notice for `call_sid`.
pub fn invite_notice(call_sid: &str) -> InviteNotice {
    let mut parameters = IndexMap::new();
    parameters.insert("From".to_string(), "client:alice".to_string());
    parameters.insert("To".to_string(), "client:bob".to_string());
    InviteNotice {
        call_sid: Some(call_sid.to_string()),
        sdp: Some("v=0 remote-offer".to_string()),
        parameters,
    }
}

pub fn connected_info() -> ConnectedInfo {
    ConnectedInfo {
        identity: Some("client:bob".to_string()),
        region: Some("us1".to_string()),
        edge: Some("ashburn".to_string()),
        home: Some("wss://chunderw-vpc-gll-ashburn.ringline.io/signal".to_string()),
        token: None,
    }
}

/// Standalone call dependencies for unit tests that bypass the device.
pub struct CallFixture {
    pub signaling: Arc<FakeSignaling>,
    pub media: Arc<FakeMediaFactory>,
    pub audio: Arc<GatedAudioHelper>,
    pub sounds: Arc<RecordingSounds>,
    pub publisher: Arc<RecordingPublisher>,
    pub slot: SharedSignaling,
    _signaling_events: mpsc::Receiver<SignalingEvent>,
}

impl CallFixture {
    pub fn call_deps(&self) -> CallDeps {
        CallDeps {
            signaling: self.slot.clone(),
            media_factory: self.media.clone(),
            audio: self.audio.clone(),
            sounds: self.sounds.clone(),
            publisher: self.publisher.clone(),
            improved_error_precision: true,
            ice_restart: fast_backoff(),
            voice_event_sid_generator: None,
        }
    }
}

pub fn call_fixture() -> CallFixture {
    let (signaling, signaling_events) = FakeSignaling::standalone();
    let slot: SharedSignaling = Arc::new(tokio::sync::RwLock::new(Some(
        signaling.clone() as Arc<dyn SignalingChannel>,
    )));
    CallFixture {
        signaling,
        media: FakeMediaFactory::new(),
        audio: Arc::new(GatedAudioHelper::default()),
        sounds: Arc::new(RecordingSounds::default()),
        publisher: Arc::new(RecordingPublisher::default()),
        slot,
        _signaling_events: signaling_events,
    }
}

/// Receives the next broadcast event, failing the test after a second.
pub async fn recv<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("an event within 1s")
        .expect("event channel should be open")
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
