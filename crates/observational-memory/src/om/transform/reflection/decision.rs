use super::super::types::{ReflectionAction, ReflectionDecisionInput};

#[must_use]
pub const fn should_trigger_reflector(observation_tokens: u32, threshold: u32) -> bool {
    observation_tokens >= threshold
}

/// Chooses between a synchronous reflection, starting a background buffer, or
/// nothing. A reflection already in flight or an empty log always yields
/// [`ReflectionAction::None`].
#[must_use]
pub fn select_reflection_action(input: ReflectionDecisionInput) -> ReflectionAction {
    if input.is_reflecting || input.observation_tokens == 0 {
        return ReflectionAction::None;
    }
    if should_trigger_reflector(input.observation_tokens, input.threshold) {
        return ReflectionAction::Reflect;
    }
    if input.has_buffered_reflection || input.is_buffering_reflection {
        return ReflectionAction::None;
    }

    match input.buffer_activation {
        Some(ratio) if ratio > 0.0 && ratio <= 1.0 => {
            let activation_point = f64::from(input.threshold) * f64::from(ratio);
            if f64::from(input.observation_tokens) >= activation_point {
                ReflectionAction::Buffer
            } else {
                ReflectionAction::None
            }
        }
        _ => ReflectionAction::None,
    }
}
