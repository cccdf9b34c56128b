use thiserror::Error;

use super::input::BufferTokensInput;

/// Rejected threshold settings. The message names the offending field the way
/// it appears in [`super::OmConfigInput`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OmConfigError {
    #[error("observation.message_tokens must be greater than zero")]
    InvalidObservationMessageTokens,
    #[error("reflection.observation_tokens must be greater than zero")]
    InvalidReflectionObservationTokens,
    #[error("observation.buffer_tokens ratio must lie strictly between 0 and 1")]
    InvalidObservationBufferTokensRatio,
    #[error("observation.buffer_tokens must resolve to at least one token")]
    InvalidObservationBufferTokensAbsolute,
    #[error("observation.buffer_tokens must stay below observation.message_tokens")]
    ObservationBufferTokensAtOrAboveThreshold,
    #[error("observation.buffer_activation must lie in (0, 1]")]
    InvalidObservationBufferActivation,
    #[error("reflection.buffer_activation must lie in (0, 1]")]
    InvalidReflectionBufferActivation,
    #[error("observation.block_after must be a finite multiplier of at least 1.0")]
    InvalidObservationBlockAfter,
    #[error("reflection.block_after must be a finite multiplier of at least 1.0")]
    InvalidReflectionBlockAfter,
    #[error("observation.max_tokens_per_batch must be greater than zero")]
    InvalidObservationMaxTokensPerBatch,
    #[error("share_token_budget needs observation.buffer_tokens set to Disabled")]
    ShareTokenBudgetRequiresAsyncDisabled,
}

pub(super) const fn positive(value: u32, err: OmConfigError) -> Result<u32, OmConfigError> {
    match value {
        0 => Err(err),
        _ => Ok(value),
    }
}

pub(super) fn activation_ratio(
    value: Option<f32>,
    err: OmConfigError,
) -> Result<Option<f32>, OmConfigError> {
    match value {
        Some(ratio) if !(ratio > 0.0 && ratio <= 1.0) => Err(err),
        other => Ok(other),
    }
}

pub(super) fn block_multiplier(value: f32, err: OmConfigError) -> Result<f32, OmConfigError> {
    (value.is_finite() && value >= 1.0).then_some(value).ok_or(err)
}

/// Token interval between background buffering passes. `Disabled` maps to
/// zero; callers decide separately whether buffering is on at all.
pub(super) fn buffer_interval(
    raw: BufferTokensInput,
    message_tokens: u32,
) -> Result<u32, OmConfigError> {
    let tokens = match raw {
        BufferTokensInput::Disabled => return Ok(0),
        BufferTokensInput::Absolute(tokens) => tokens,
        BufferTokensInput::Ratio(ratio) if ratio > 0.0 && ratio < 1.0 => {
            round_f64_to_u32(f64::from(message_tokens) * ratio).unwrap_or(0)
        }
        BufferTokensInput::Ratio(_) => {
            return Err(OmConfigError::InvalidObservationBufferTokensRatio);
        }
    };
    positive(tokens, OmConfigError::InvalidObservationBufferTokensAbsolute)
}

pub(super) fn round_f64_to_u32(value: f64) -> Option<u32> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 0.0 || rounded > f64::from(u32::MAX) {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "range checked against u32 bounds above"
    )]
    let value = rounded as u32;
    Some(value)
}
