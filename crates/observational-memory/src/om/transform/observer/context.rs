use super::super::types::BUFFERED_OBSERVATIONS_SEPARATOR;

/// Observer context for a buffering pass: active observations first, then any
/// chunks buffered but not yet activated, split by a marker line so the model
/// does not repeat either part.
#[must_use]
pub fn combine_observations_for_buffering(
    active_observations: &str,
    buffered_observations: &str,
) -> Option<String> {
    match (active_observations.trim(), buffered_observations.trim()) {
        ("", "") => None,
        (only, "") | ("", only) => Some(only.to_string()),
        (active, buffered) => Some(format!(
            "{active}\n\n{BUFFERED_OBSERVATIONS_SEPARATOR}\n\n{buffered}"
        )),
    }
}
