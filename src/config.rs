//! Device, connect and accept options plus retry backoff policies.

use crate::audio::{AudioHelper, SoundPlayer};
use crate::media::InputStream;
use crate::publisher::EventPublisher;
use indexmap::IndexMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Exponential backoff schedule used for signaling reconnects and for
/// media ICE restart episodes.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// An episode running longer than this is abandoned. `None` retries
    /// forever.
    pub give_up_after: Option<Duration>,
    /// Full jitter: each delay is sampled uniformly from zero to the
    /// computed value. Disabled in tests.
    pub jitter: bool,
}

impl BackoffPolicy {
    pub fn signaling_default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            give_up_after: None,
            jitter: true,
        }
    }

    pub fn ice_restart_default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(20),
            give_up_after: Some(Duration::from_secs(30)),
            jitter: true,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(31) as i32);
        let raw = self.initial.mul_f64(factor);
        let capped = raw.min(self.max_delay);
        if self.jitter {
            capped.mul_f64(rand::rng().random_range(0.0..=1.0))
        } else {
            capped
        }
    }

    pub fn should_give_up(&self, elapsed: Duration) -> bool {
        self.give_up_after.is_some_and(|limit| elapsed >= limit)
    }
}

pub type VoiceEventSidGenerator = dyn Fn() -> String + Send + Sync;

/// Behavior knobs for a [`Device`](crate::device::Device). All fields have
/// working defaults; collaborator slots left as `None` fall back to the
/// built-in implementations.
#[derive(Clone, Default)]
pub struct DeviceOptions {
    /// Preferred edges, tried in order. Empty means the global edge.
    pub edges: Vec<String>,
    /// Deliver a second incoming invite while a call is active instead of
    /// dropping it silently.
    pub allow_incoming_while_busy: bool,
    /// Surface the full signaling error catalog instead of collapsing
    /// legacy codes to the generic connection errors.
    pub improved_signaling_error_precision: bool,
    /// How long the channel keeps dialing the preferred gateway URI before
    /// rotating through the fallbacks. Zero rotates immediately.
    pub max_call_signaling_timeout: Duration,
    /// Lead time before token expiry at which `token_will_expire` fires.
    pub token_refresh_ms: u64,
    pub signaling_reconnect: Option<BackoffPolicy>,
    pub ice_restart: Option<BackoffPolicy>,
    /// Overrides message correlation id generation.
    pub voice_event_sid_generator: Option<Arc<VoiceEventSidGenerator>>,
    /// Overrides the URIs derived from `edges`.
    pub signaling_uris: Option<Vec<String>>,
    pub sounds: Option<Arc<dyn SoundPlayer>>,
    pub audio: Option<Arc<dyn AudioHelper>>,
    pub publisher: Option<Arc<dyn EventPublisher>>,
}

impl DeviceOptions {
    pub const DEFAULT_TOKEN_REFRESH_MS: u64 = 10_000;

    pub fn token_refresh(&self) -> Duration {
        let ms = if self.token_refresh_ms == 0 {
            Self::DEFAULT_TOKEN_REFRESH_MS
        } else {
            self.token_refresh_ms
        };
        Duration::from_millis(ms)
    }

    pub fn signaling_reconnect_policy(&self) -> BackoffPolicy {
        self.signaling_reconnect
            .clone()
            .unwrap_or_else(BackoffPolicy::signaling_default)
    }

    pub fn ice_restart_policy(&self) -> BackoffPolicy {
        self.ice_restart
            .clone()
            .unwrap_or_else(BackoffPolicy::ice_restart_default)
    }

    pub fn resolved_signaling_uris(&self) -> Vec<String> {
        match &self.signaling_uris {
            Some(uris) if !uris.is_empty() => uris.clone(),
            _ => crate::edge::chunder_uris(&self.edges),
        }
    }
}

impl std::fmt::Debug for DeviceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOptions")
            .field("edges", &self.edges)
            .field("allow_incoming_while_busy", &self.allow_incoming_while_busy)
            .field(
                "improved_signaling_error_precision",
                &self.improved_signaling_error_precision,
            )
            .field("max_call_signaling_timeout", &self.max_call_signaling_timeout)
            .field("token_refresh_ms", &self.token_refresh_ms)
            .field("signaling_reconnect", &self.signaling_reconnect)
            .field("ice_restart", &self.ice_restart)
            .field("signaling_uris", &self.signaling_uris)
            .finish_non_exhaustive()
    }
}

/// Options for an outgoing call.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Application parameters forwarded to the gateway on the invite.
    pub params: IndexMap<String, String>,
    /// Resumes a previously answered call leg instead of dialing fresh.
    pub connect_token: Option<String>,
    pub input_stream: Option<InputStream>,
}

/// Options for accepting an incoming call.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    pub input_stream: Option<InputStream>,
}
