//! WebSocket-backed signaling channel.
//!
//! One spawned task owns the socket for the channel's whole life: it dials,
//! reads frames into events, and redials with backoff when the socket
//! drops. Commands from any task go through the writer half behind a
//! mutex. `destroy` is the only way the task ends.

use crate::signaling::protocol::{self, FrameError};
use crate::signaling::{
    CallMessageFrame, ChannelStatus, SignalingChannel, SignalingConfig, SignalingError,
    SignalingEvent, SignalingFactory,
};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct WebSocketSignaling {
    config: SignalingConfig,
    token: RwLock<String>,
    preferred_uri: RwLock<Option<String>>,
    status: AtomicU8,
    destroyed: AtomicBool,
    shutdown: Notify,
    writer: Mutex<Option<WsSink>>,
    events: mpsc::Sender<SignalingEvent>,
}

impl WebSocketSignaling {
    fn new(config: SignalingConfig, events: mpsc::Sender<SignalingEvent>) -> Self {
        Self {
            token: RwLock::new(config.token.clone()),
            preferred_uri: RwLock::new(None),
            status: AtomicU8::new(ChannelStatus::Connecting as u8),
            destroyed: AtomicBool::new(false),
            shutdown: Notify::new(),
            writer: Mutex::new(None),
            events,
            config,
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        let mut rotation = 0usize;
        let mut outage_started = Instant::now();
        loop {
            if self.destroyed.load(Ordering::Relaxed) {
                break;
            }
            let uri = self.pick_uri(&mut rotation, outage_started).await;
            self.status
                .store(ChannelStatus::Connecting as u8, Ordering::Relaxed);
            match self.connect_and_read(&uri).await {
                Ok(()) => {
                    attempt = 0;
                    outage_started = Instant::now();
                }
                Err(e) => {
                    warn!(target: "Signaling", "Connection to {uri} failed: {e}");
                }
            }
            if self.destroyed.load(Ordering::Relaxed) {
                break;
            }
            self.status
                .store(ChannelStatus::Offline as u8, Ordering::Relaxed);
            let _ = self.events.send(SignalingEvent::TransportClose).await;

            let delay = self.config.reconnect.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            debug!(target: "Signaling", "Redialing in {delay:?} (attempt {attempt})");
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.status
            .store(ChannelStatus::Destroyed as u8, Ordering::Relaxed);
        *self.writer.lock().await = None;
        let _ = self.events.send(SignalingEvent::Close).await;
        debug!(target: "Signaling", "Channel task finished");
    }

    /// Dials, announces the session and pumps frames until the socket
    /// drops. `Ok` means a session was established; `Err` means the dial
    /// itself failed.
    async fn connect_and_read(&self, uri: &str) -> Result<(), String> {
        info!(target: "Signaling", "Dialing {uri}");
        let dial = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(uri));
        let (stream, _response) = tokio::select! {
            biased;
            _ = self.shutdown.notified() => return Ok(()),
            result = dial => match result {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err("connect timed out".to_string()),
            },
        };

        let (sink, mut reader) = stream.split();
        *self.writer.lock().await = Some(sink);
        self.status
            .store(ChannelStatus::Connected as u8, Ordering::Relaxed);

        let token = self.token.read().await.clone();
        if let Err(e) = self.send_text(protocol::listen(&token)).await {
            warn!(target: "Signaling", "Failed to announce session: {e}");
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                msg = reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match protocol::decode_frame(text.as_str()) {
                            Ok(event) => {
                                if self.events.send(event).await.is_err() {
                                    debug!(target: "Signaling", "Event receiver dropped, closing");
                                    break;
                                }
                            }
                            Err(FrameError::UnknownType(kind)) => {
                                debug!(target: "Signaling", "Ignoring frame of unknown type {kind:?}");
                            }
                            Err(e) => {
                                warn!(target: "Signaling", "Dropping malformed frame: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let mut guard = self.writer.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(target: "Signaling", "Server closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "Signaling", "Socket read error: {e}");
                        break;
                    }
                    None => {
                        debug!(target: "Signaling", "Socket stream ended");
                        break;
                    }
                }
            }
        }

        *self.writer.lock().await = None;
        Ok(())
    }

    /// Preferred URI wins while the outage is younger than the pinning
    /// window; afterwards the configured list is rotated round-robin.
    async fn pick_uri(&self, rotation: &mut usize, outage_started: Instant) -> String {
        if self.config.max_preferred_duration > Duration::ZERO
            && outage_started.elapsed() < self.config.max_preferred_duration
            && let Some(uri) = self.preferred_uri.read().await.clone()
        {
            return uri;
        }
        let uri = self.config.uris[*rotation % self.config.uris.len()].clone();
        *rotation += 1;
        uri
    }

    async fn send_text(&self, text: String) -> Result<(), SignalingError> {
        if self.destroyed.load(Ordering::Relaxed) {
            return Err(SignalingError::Destroyed);
        }
        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(SignalingError::Offline)?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| SignalingError::Send(e.to_string()))
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn register(&self, available: bool) -> Result<(), SignalingError> {
        self.send_text(protocol::register(available)).await
    }

    async fn invite(
        &self,
        call_id: &str,
        sdp: &str,
        params: &IndexMap<String, String>,
    ) -> Result<(), SignalingError> {
        self.send_text(protocol::invite(call_id, sdp, params)).await
    }

    async fn answer(&self, call_sid: &str, sdp: &str) -> Result<(), SignalingError> {
        self.send_text(protocol::answer(call_sid, sdp)).await
    }

    async fn reconnect(
        &self,
        sdp: &str,
        call_sid: &str,
        reconnect_token: &str,
    ) -> Result<(), SignalingError> {
        self.send_text(protocol::reconnect(sdp, call_sid, reconnect_token))
            .await
    }

    async fn hangup(&self, call_sid: &str, message: Option<&str>) -> Result<(), SignalingError> {
        self.send_text(protocol::hangup(call_sid, message)).await
    }

    async fn reject(&self, call_sid: &str) -> Result<(), SignalingError> {
        self.send_text(protocol::reject(call_sid)).await
    }

    async fn dtmf(&self, call_sid: &str, digit: char) -> Result<(), SignalingError> {
        self.send_text(protocol::dtmf(call_sid, digit)).await
    }

    async fn send_message(&self, frame: CallMessageFrame) -> Result<(), SignalingError> {
        let text = protocol::call_message(&frame)
            .map_err(|e| SignalingError::Send(e.to_string()))?;
        self.send_text(text).await
    }

    async fn set_token(&self, token: &str) -> Result<(), SignalingError> {
        *self.token.write().await = token.to_string();
        if self.status() == ChannelStatus::Connected {
            self.send_text(protocol::listen(token)).await
        } else {
            Ok(())
        }
    }

    async fn update_preferred_uri(&self, uri: Option<&str>) {
        *self.preferred_uri.write().await = uri.map(str::to_string);
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "Signaling", "Destroying channel");
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.shutdown.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct WebSocketSignalingFactory;

impl WebSocketSignalingFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingFactory for WebSocketSignalingFactory {
    async fn create(
        &self,
        mut config: SignalingConfig,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<SignalingEvent>), SignalingError> {
        if config.uris.is_empty() {
            config.uris = crate::edge::chunder_uris(&[]);
        }
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let channel = Arc::new(WebSocketSignaling::new(config, event_tx));
        tokio::task::spawn(channel.clone().run());
        Ok((channel as Arc<dyn SignalingChannel>, event_rx))
    }
}
