use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActivationBoundary {
    pub chunks_activated: usize,
    pub message_tokens_activated: u32,
    pub observation_tokens_activated: u32,
    pub activated_message_ids: Vec<String>,
}

pub const BUFFERED_OBSERVATIONS_SEPARATOR: &str = "--- BUFFERED (pending activation) ---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedReflectionSlicePlan {
    pub sliced_observations: String,
    pub reflected_observation_line_count: u32,
    pub slice_token_estimate: u32,
    pub compression_target_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionAction {
    None,
    Buffer,
    Reflect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "each flag is an independent guard on the reflector state"
)]
pub struct ReflectionDecisionInput {
    pub observation_tokens: u32,
    pub threshold: u32,
    pub buffer_activation: Option<f32>,
    pub has_buffered_reflection: bool,
    pub is_buffering_reflection: bool,
    pub is_reflecting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverAction {
    None,
    Buffer,
    Activate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverDecisionInput {
    pub pending_message_tokens: u32,
    pub observation_token_count: u32,
    pub last_buffered_at_tokens: u32,
    pub is_observing: bool,
    pub is_buffering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "decision output is an explicit truth table used by scheduler tests"
)]
pub struct ObserverDecision {
    pub threshold: u32,
    pub threshold_reached: bool,
    pub interval_triggered: bool,
    pub block_after_threshold: u32,
    pub block_after_exceeded: bool,
    pub within_buffer_window: bool,
    pub action: ObserverAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncObservationIntervalState {
    pub interval_tokens: Option<u32>,
    pub crossed_interval_boundary: bool,
    pub new_tokens_since_last_boundary: u32,
    pub min_new_tokens_required: u32,
    pub debounce_passed: bool,
    pub should_trigger: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OmTransformError {
    #[error("missing required identifier for scope: {0}")]
    MissingScopeIdentifier(&'static str),
}
