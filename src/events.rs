use crate::call::{Call, CallMessage};
use crate::errors::ProtocolError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

// Macro to generate an event bus struct with one broadcast channel per event
macro_rules! define_event_bus {
    ($bus:ident, $(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        /// Subscribers that never listen cost nothing; sends to channels
        /// without receivers are dropped.
        #[derive(Debug)]
        pub struct $bus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl $bus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }

        impl Default for $bus {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

#[derive(Debug, Clone, Default)]
pub struct Registering;

#[derive(Debug, Clone, Default)]
pub struct Registered;

#[derive(Debug, Clone, Default)]
pub struct Unregistered;

#[derive(Debug, Clone, Default)]
pub struct Destroyed;

#[derive(Debug, Clone)]
pub struct DeviceError {
    pub error: ProtocolError,
    /// Set when the failure was reported against a call the device no
    /// longer tracks.
    pub call_sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenWillExpire {
    pub expires_in: Duration,
}

define_event_bus! {
    DeviceEventBus,
    // Registration lifecycle
    (registering, Arc<Registering>),
    (registered, Arc<Registered>),
    (unregistered, Arc<Unregistered>),
    (destroyed, Arc<Destroyed>),

    (incoming, Arc<Call>),
    (error, Arc<DeviceError>),
    (token_will_expire, Arc<TokenWillExpire>),
}

#[derive(Debug, Clone, Default)]
pub struct Accepted;

#[derive(Debug, Clone, Default)]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct Disconnected;

#[derive(Debug, Clone, Default)]
pub struct Rejected;

#[derive(Debug, Clone, Default)]
pub struct Reconnected;

#[derive(Debug, Clone, Default)]
pub struct TransportClosed;

#[derive(Debug, Clone)]
pub struct CallError {
    pub error: ProtocolError,
    /// Correlation id when the failure was a reply to a sent message.
    pub voice_event_sid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Reconnecting {
    pub error: ProtocolError,
}

#[derive(Debug, Clone)]
pub struct Ringing {
    pub has_early_media: bool,
}

#[derive(Debug, Clone)]
pub struct MuteChanged {
    pub muted: bool,
}

#[derive(Debug, Clone)]
pub struct MessageReceived {
    pub message: CallMessage,
    pub voice_event_sid: String,
}

#[derive(Debug, Clone)]
pub struct MessageSent {
    pub message: CallMessage,
    pub voice_event_sid: String,
}

#[derive(Debug, Clone)]
pub struct VolumeSample {
    pub input_level: f32,
    pub output_level: f32,
}

define_event_bus! {
    CallEventBus,
    // Session lifecycle
    (ringing, Arc<Ringing>),
    (accept, Arc<Accepted>),
    (cancel, Arc<Cancelled>),
    (reject, Arc<Rejected>),
    (disconnect, Arc<Disconnected>),

    // Mid-call
    (error, Arc<CallError>),
    (mute, Arc<MuteChanged>),
    (message_received, Arc<MessageReceived>),
    (message_sent, Arc<MessageSent>),
    (volume, Arc<VolumeSample>),

    // Transport recovery
    (transport_close, Arc<TransportClosed>),
    (reconnecting, Arc<Reconnecting>),
    (reconnected, Arc<Reconnected>),
}
