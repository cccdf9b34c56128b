//! Caller-facing threshold settings. Every field is optional; unset fields
//! take the defaults in [`super`] when resolved.

use serde::{Deserialize, Serialize};

use crate::om::OmScope;

/// How often the observer pre-computes observations in the background.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum BufferTokensInput {
    /// No background buffering; observation only runs at the threshold.
    Disabled,
    /// Buffer every `n` pending tokens.
    Absolute(u32),
    /// Buffer every `ratio * message_tokens` pending tokens.
    Ratio(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfigInput {
    /// Pending message tokens that trigger an observation cycle.
    pub message_tokens: Option<u32>,
    /// Upper bound on message tokens sent to the observer in one call.
    pub max_tokens_per_batch: Option<u32>,
    pub buffer_tokens: Option<BufferTokensInput>,
    /// Fraction of buffered chunks folded in when the threshold is reached.
    pub buffer_activation: Option<f32>,
    /// Multiplier over `message_tokens` past which `observe` waits for the cycle.
    pub block_after: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfigInput {
    /// Observation-log size that triggers a reflection.
    pub observation_tokens: Option<u32>,
    /// Fraction of `observation_tokens` at which a reflection is buffered early.
    pub buffer_activation: Option<f32>,
    pub block_after: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OmConfigInput {
    #[serde(default = "thread_scope")]
    pub scope: OmScope,
    /// Let unobserved messages borrow room the observation log is not using.
    #[serde(default)]
    pub share_token_budget: bool,
    #[serde(default)]
    pub observation: ObservationConfigInput,
    #[serde(default)]
    pub reflection: ReflectionConfigInput,
}

const fn thread_scope() -> OmScope {
    OmScope::Thread
}

impl OmConfigInput {
    #[must_use]
    pub const fn for_scope(self, scope: OmScope) -> Self {
        Self { scope, ..self }
    }
}

impl Default for OmConfigInput {
    fn default() -> Self {
        Self {
            scope: thread_scope(),
            share_token_budget: false,
            observation: ObservationConfigInput::default(),
            reflection: ReflectionConfigInput::default(),
        }
    }
}
