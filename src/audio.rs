//! Audio device access and local sound playback contracts.

use crate::media::InputStream;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("microphone access denied")]
    PermissionDenied,
    #[error("failed to acquire input device: {0}")]
    AcquisitionFailed(String),
}

/// Acquires the audio input used for a call. Implemented by the embedding
/// application; the default assumes input is always available.
#[async_trait]
pub trait AudioHelper: Send + Sync {
    /// Waits until the input device is usable. Called before acquisition
    /// so slow device enumeration does not race call setup.
    async fn input_device_ready(&self);

    async fn acquire_input(&self) -> Result<InputStream, AudioError>;
}

/// Plays the built-in call sounds. The default implementation is silent.
#[async_trait]
pub trait SoundPlayer: Send + Sync {
    async fn play_incoming(&self) -> Result<(), anyhow::Error>;

    async fn stop_incoming(&self);

    async fn play_dtmf(&self, tone: &str) -> Result<(), anyhow::Error>;

    async fn play_disconnect(&self) -> Result<(), anyhow::Error>;
}

/// Sound player that swallows every request.
#[derive(Debug, Default)]
pub struct NullSoundPlayer;

#[async_trait]
impl SoundPlayer for NullSoundPlayer {
    async fn play_incoming(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn stop_incoming(&self) {}

    async fn play_dtmf(&self, _tone: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn play_disconnect(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Audio helper that reports a fixed input stream immediately.
#[derive(Debug)]
pub struct StaticAudioHelper {
    stream: InputStream,
}

impl StaticAudioHelper {
    pub fn new(stream: InputStream) -> Self {
        Self { stream }
    }
}

impl Default for StaticAudioHelper {
    fn default() -> Self {
        Self::new(InputStream::new("default-input"))
    }
}

#[async_trait]
impl AudioHelper for StaticAudioHelper {
    async fn input_device_ready(&self) {}

    async fn acquire_input(&self) -> Result<InputStream, AudioError> {
        Ok(self.stream.clone())
    }
}
