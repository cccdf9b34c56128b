use chrono::{DateTime, Utc};

use crate::om::model::OmObservationChunk;

use super::ActivationBoundary;

/// With a shared budget, unobserved messages may use whatever the observation
/// log leaves free, but never less than the base threshold.
#[must_use]
pub fn calculate_dynamic_threshold(
    base_threshold: u32,
    total_budget: Option<u32>,
    current_observation_tokens: u32,
) -> u32 {
    total_budget.map_or(base_threshold, |budget| {
        budget
            .saturating_sub(current_observation_tokens)
            .max(base_threshold)
    })
}

/// Counts the leading chunks that form an unbroken chain starting at the
/// record cutoff. Chunks after a gap are never activated.
#[must_use]
pub fn select_contiguous_chunks(
    chunks: &[OmObservationChunk],
    last_observed_at: Option<DateTime<Utc>>,
) -> ActivationBoundary {
    let mut expected = last_observed_at;
    let mut boundary = ActivationBoundary::default();

    for chunk in chunks {
        if chunk.observed_after != expected {
            break;
        }
        boundary.chunks_activated += 1;
        boundary.message_tokens_activated = boundary
            .message_tokens_activated
            .saturating_add(chunk.message_tokens);
        boundary.observation_tokens_activated = boundary
            .observation_tokens_activated
            .saturating_add(chunk.token_count);
        boundary
            .activated_message_ids
            .extend(chunk.message_ids.iter().cloned());
        expected = Some(chunk.last_observed_at);
    }

    boundary
}

/// Active log followed by each activated chunk, blank parts skipped.
#[must_use]
pub fn merge_activated_observations(
    active: &str,
    activated_chunks: &[OmObservationChunk],
) -> String {
    std::iter::once(active)
        .chain(activated_chunks.iter().map(|chunk| chunk.observations.as_str()))
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[must_use]
pub fn merge_observations(active: &str, observed: &str) -> String {
    match (active.trim(), observed.trim()) {
        ("", observed) => observed.to_string(),
        (active, "") => active.to_string(),
        (active, observed) => format!("{active}\n\n{observed}"),
    }
}
