//! Real-time voice client: device registration and presence, call
//! sessions, and the signaling channel carrying both.
//!
//! [`device::Device`] is the entry point. It registers an identity with
//! the voice gateway over a persistent websocket and turns gateway
//! invites into [`call::Call`] sessions; [`Device::connect`](device::Device::connect)
//! dials outgoing ones. Media and audio are behind trait seams so the
//! crate stays transport-agnostic about the actual RTP stack.

pub mod audio;
pub mod call;
pub mod config;
pub mod device;
pub mod dtmf;
pub mod edge;
pub mod errors;
pub mod events;
pub mod media;
pub mod publisher;
pub mod signaling;
pub mod token;

// Shared fakes; also used by the integration tests.
pub mod test_utils;

pub use call::{Call, CallMessage, CallState, Direction, DisconnectReason};
pub use config::{AcceptOptions, BackoffPolicy, ConnectOptions, DeviceOptions};
pub use device::{Device, DeviceState};
pub use errors::{ErrorKind, ProtocolError, VoiceError};
pub use token::ConnectToken;
