use crate::om::config::ResolvedObservationConfig;

use super::super::types::{
    AsyncObservationIntervalState, ObserverAction, ObserverDecision, ObserverDecisionInput,
};

#[must_use]
pub const fn should_trigger_observer(total_pending: u32, threshold: u32) -> bool {
    total_pending >= threshold
}

#[must_use]
pub fn evaluate_async_observation_interval(
    current_tokens: u32,
    buffer_tokens: Option<u32>,
    last_buffered_at_tokens: u32,
    min_new_tokens: Option<u32>,
) -> AsyncObservationIntervalState {
    let Some(interval_tokens) = buffer_tokens.filter(|value| *value > 0) else {
        return AsyncObservationIntervalState {
            interval_tokens: None,
            crossed_interval_boundary: false,
            new_tokens_since_last_boundary: 0,
            min_new_tokens_required: 0,
            debounce_passed: false,
            should_trigger: false,
        };
    };

    let current_interval = current_tokens / interval_tokens;
    let last_interval = last_buffered_at_tokens / interval_tokens;
    let crossed_interval_boundary = current_interval > last_interval;
    let new_tokens_since_last_boundary = current_tokens.saturating_sub(last_buffered_at_tokens);
    let min_new_tokens_required = min_new_tokens.unwrap_or_else(|| (interval_tokens / 2).max(1));
    let debounce_passed = new_tokens_since_last_boundary >= min_new_tokens_required;
    let should_trigger = crossed_interval_boundary && debounce_passed;

    AsyncObservationIntervalState {
        interval_tokens: Some(interval_tokens),
        crossed_interval_boundary,
        new_tokens_since_last_boundary,
        min_new_tokens_required,
        debounce_passed,
        should_trigger,
    }
}

/// Activation wins over buffering; buffering only runs inside
/// `[activation point, threshold)` and at most once per interval.
#[must_use]
pub fn decide_observer_action(
    input: ObserverDecisionInput,
    observation_config: ResolvedObservationConfig,
) -> ObserverDecision {
    let threshold = observation_config.dynamic_threshold(input.observation_token_count);
    let threshold_reached = should_trigger_observer(input.pending_message_tokens, threshold);
    let block_after_threshold =
        observation_config.block_after_threshold(input.observation_token_count);
    let block_after_exceeded = input.pending_message_tokens >= block_after_threshold;
    let within_buffer_window = observation_config
        .buffer_activation_threshold(input.observation_token_count)
        .is_some_and(|point| input.pending_message_tokens >= point)
        && !threshold_reached;
    let interval_triggered = evaluate_async_observation_interval(
        input.pending_message_tokens,
        observation_config.buffer_tokens,
        input.last_buffered_at_tokens.min(input.pending_message_tokens),
        None,
    )
    .should_trigger;

    let action = if input.is_observing {
        ObserverAction::None
    } else if threshold_reached {
        ObserverAction::Activate
    } else if within_buffer_window && interval_triggered && !input.is_buffering {
        ObserverAction::Buffer
    } else {
        ObserverAction::None
    };

    ObserverDecision {
        threshold,
        threshold_reached,
        interval_triggered,
        block_after_threshold,
        block_after_exceeded,
        within_buffer_window,
        action,
    }
}
