use serde::Serialize;

use crate::om::{OmScope, calculate_dynamic_threshold};

use super::input::{BufferTokensInput, OmConfigInput};
use super::validate::{
    OmConfigError, activation_ratio, block_multiplier, buffer_interval, positive,
    round_f64_to_u32,
};
use super::{
    DEFAULT_BLOCK_AFTER_MULTIPLIER, DEFAULT_OBSERVER_BUFFER_ACTIVATION,
    DEFAULT_OBSERVER_BUFFER_TOKENS_RATIO, DEFAULT_OBSERVER_MAX_TOKENS_PER_BATCH,
    DEFAULT_OBSERVER_MESSAGE_TOKENS, DEFAULT_REFLECTOR_BUFFER_ACTIVATION,
    DEFAULT_REFLECTOR_OBSERVATION_TOKENS,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedObservationConfig {
    pub message_tokens_base: u32,
    pub total_budget: Option<u32>,
    pub max_tokens_per_batch: u32,
    pub buffer_tokens: Option<u32>,
    pub buffer_activation: Option<f32>,
    pub block_after: f32,
}

impl ResolvedObservationConfig {
    #[must_use]
    pub fn dynamic_threshold(&self, current_observation_tokens: u32) -> u32 {
        calculate_dynamic_threshold(
            self.message_tokens_base,
            self.total_budget,
            current_observation_tokens,
        )
    }

    /// Pending-token level at which `observe` waits for the in-flight cycle.
    #[must_use]
    pub fn block_after_threshold(&self, current_observation_tokens: u32) -> u32 {
        scale_threshold(
            self.dynamic_threshold(current_observation_tokens),
            self.block_after,
        )
    }

    #[must_use]
    pub fn buffer_activation_threshold(&self, current_observation_tokens: u32) -> Option<u32> {
        self.buffer_activation.map(|activation| {
            scale_threshold(self.dynamic_threshold(current_observation_tokens), activation)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedReflectionConfig {
    pub observation_tokens: u32,
    pub buffer_activation: Option<f32>,
    pub block_after: f32,
}

impl ResolvedReflectionConfig {
    #[must_use]
    pub fn block_after_threshold(&self) -> u32 {
        scale_threshold(self.observation_tokens, self.block_after)
    }

    #[must_use]
    pub fn buffer_activation_threshold(&self) -> Option<u32> {
        self.buffer_activation
            .map(|activation| scale_threshold(self.observation_tokens, activation))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedOmConfig {
    pub scope: OmScope,
    pub share_token_budget: bool,
    pub async_buffering_disabled: bool,
    pub observation: ResolvedObservationConfig,
    pub reflection: ResolvedReflectionConfig,
}

fn scale_threshold(threshold: u32, factor: f32) -> u32 {
    round_f64_to_u32(f64::from(threshold) * f64::from(factor)).unwrap_or(u32::MAX)
}

fn resolve_async_buffering_disabled(input: OmConfigInput) -> Result<bool, OmConfigError> {
    let disabled = matches!(
        input.observation.buffer_tokens,
        Some(BufferTokensInput::Disabled)
    );
    if input.share_token_budget && !disabled {
        return Err(OmConfigError::ShareTokenBudgetRequiresAsyncDisabled);
    }
    Ok(disabled)
}

/// Fills every unset field from the defaults and rejects settings the
/// scheduler cannot honour.
pub fn resolve_om_config(input: OmConfigInput) -> Result<ResolvedOmConfig, OmConfigError> {
    let observation = input.observation;
    let reflection = input.reflection;

    let message_tokens_base = positive(
        observation
            .message_tokens
            .unwrap_or(DEFAULT_OBSERVER_MESSAGE_TOKENS),
        OmConfigError::InvalidObservationMessageTokens,
    )?;
    let observation_tokens = positive(
        reflection
            .observation_tokens
            .unwrap_or(DEFAULT_REFLECTOR_OBSERVATION_TOKENS),
        OmConfigError::InvalidReflectionObservationTokens,
    )?;
    let max_tokens_per_batch = positive(
        observation
            .max_tokens_per_batch
            .unwrap_or(DEFAULT_OBSERVER_MAX_TOKENS_PER_BATCH),
        OmConfigError::InvalidObservationMaxTokensPerBatch,
    )?;
    let async_buffering_disabled = resolve_async_buffering_disabled(input)?;

    let (buffer_tokens, observation_activation, reflection_activation) =
        if async_buffering_disabled {
            (None, None, None)
        } else {
            let interval = buffer_interval(
                observation
                    .buffer_tokens
                    .unwrap_or(BufferTokensInput::Ratio(DEFAULT_OBSERVER_BUFFER_TOKENS_RATIO)),
                message_tokens_base,
            )?;
            if interval >= message_tokens_base {
                return Err(OmConfigError::ObservationBufferTokensAtOrAboveThreshold);
            }
            (
                Some(interval),
                Some(
                    observation
                        .buffer_activation
                        .unwrap_or(DEFAULT_OBSERVER_BUFFER_ACTIVATION),
                ),
                Some(
                    reflection
                        .buffer_activation
                        .unwrap_or(DEFAULT_REFLECTOR_BUFFER_ACTIVATION),
                ),
            )
        };
    let observation_activation = activation_ratio(
        observation_activation,
        OmConfigError::InvalidObservationBufferActivation,
    )?;
    let reflection_activation = activation_ratio(
        reflection_activation,
        OmConfigError::InvalidReflectionBufferActivation,
    )?;

    let observation_block_after = block_multiplier(
        observation
            .block_after
            .unwrap_or(DEFAULT_BLOCK_AFTER_MULTIPLIER),
        OmConfigError::InvalidObservationBlockAfter,
    )?;
    let reflection_block_after = block_multiplier(
        reflection
            .block_after
            .unwrap_or(DEFAULT_BLOCK_AFTER_MULTIPLIER),
        OmConfigError::InvalidReflectionBlockAfter,
    )?;

    let total_budget = if input.share_token_budget {
        Some(message_tokens_base.saturating_add(observation_tokens))
    } else {
        None
    };

    Ok(ResolvedOmConfig {
        scope: input.scope,
        share_token_budget: input.share_token_budget,
        async_buffering_disabled,
        observation: ResolvedObservationConfig {
            message_tokens_base,
            total_budget,
            max_tokens_per_batch,
            buffer_tokens,
            buffer_activation: observation_activation,
            block_after: observation_block_after,
        },
        reflection: ResolvedReflectionConfig {
            observation_tokens,
            buffer_activation: reflection_activation,
            block_after: reflection_block_after,
        },
    })
}
