//! DTMF digit validation and tone naming.

use crate::errors::VoiceError;
use std::time::Duration;

/// Gap between consecutive digits sent on a call. A `w` consumes one
/// interval without sending anything.
pub const DIGIT_INTERVAL: Duration = Duration::from_millis(200);

pub fn validate_digits(digits: &str) -> Result<(), VoiceError> {
    if digits.is_empty() {
        return Err(VoiceError::InvalidArgument(
            "digits must not be empty".to_string(),
        ));
    }
    if let Some(bad) = digits
        .chars()
        .find(|c| !matches!(c, '0'..='9' | '*' | '#' | 'w'))
    {
        return Err(VoiceError::InvalidArgument(format!(
            "invalid digit {bad:?}, allowed are 0-9, *, # and w"
        )));
    }
    Ok(())
}

/// Name of the local tone sound for a digit, `None` for the pause digit.
pub fn tone_name(digit: char) -> Option<&'static str> {
    Some(match digit {
        '0' => "dtmf0",
        '1' => "dtmf1",
        '2' => "dtmf2",
        '3' => "dtmf3",
        '4' => "dtmf4",
        '5' => "dtmf5",
        '6' => "dtmf6",
        '7' => "dtmf7",
        '8' => "dtmf8",
        '9' => "dtmf9",
        '*' => "dtmfs",
        '#' => "dtmfh",
        _ => return None,
    })
}
