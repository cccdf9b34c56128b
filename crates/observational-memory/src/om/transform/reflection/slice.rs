use super::super::helpers::{Rounding, clamp_f64_to_u32};
use super::super::types::BufferedReflectionSlicePlan;

/// Picks the oldest lines whose estimated size fits under the activation point
/// and derives the token target the buffered reflection has to meet.
#[must_use]
pub fn plan_buffered_reflection_slice(
    full_observations: &str,
    observation_token_count: u32,
    reflection_threshold: u32,
    buffer_activation: f32,
) -> BufferedReflectionSlicePlan {
    let lines = full_observations.split('\n').collect::<Vec<_>>();
    let total_lines = u32::try_from(lines.len()).unwrap_or(u32::MAX);
    let tokens_per_line = if total_lines == 0 {
        0.0
    } else {
        f64::from(observation_token_count) / f64::from(total_lines)
    };

    let activation_point = f64::from(reflection_threshold) * f64::from(buffer_activation);
    let line_budget = if tokens_per_line > 0.0 {
        clamp_f64_to_u32(activation_point / tokens_per_line, Rounding::Floor).min(total_lines)
    } else {
        total_lines
    };
    let take = usize::try_from(line_budget)
        .unwrap_or(usize::MAX)
        .min(lines.len());

    let slice_token_estimate =
        clamp_f64_to_u32(tokens_per_line * f64::from(line_budget), Rounding::Nearest);
    let compression_target_tokens = clamp_f64_to_u32(
        (f64::from(slice_token_estimate) * f64::from(buffer_activation))
            .min(f64::from(reflection_threshold)),
        Rounding::Ceil,
    );

    BufferedReflectionSlicePlan {
        sliced_observations: lines[..take].join("\n"),
        reflected_observation_line_count: line_budget,
        slice_token_estimate,
        compression_target_tokens,
    }
}
