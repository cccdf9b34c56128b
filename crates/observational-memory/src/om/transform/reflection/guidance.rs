pub const MAX_COMPRESSION_LEVEL: u8 = 2;

const LEVEL_ONE_GUIDANCE: &str = "## COMPRESSION REQUIRED

The previous reflection did not come back smaller than the observations it replaced.

Condense again, a bit harder this time:
- fold the oldest observations into short higher-level statements
- keep the most recent observations close to their original detail
- merge related entries, but never drop names, dates, places, numbers or decisions
- collapse repeated tool calls into one line stating how often and why they ran and what they produced

Aim for roughly 80% of the previous level of detail.";

const LEVEL_TWO_GUIDANCE: &str = "## AGGRESSIVE COMPRESSION REQUIRED

The reflection is still too large after one round of compression.

Condense much more aggressively:
- summarize the oldest observations in a few lines at most
- keep recent observations, but trim their wording
- remove anything redundant and merge overlapping entries
- never drop names, dates, places, numbers or decisions the user stated

Aim for roughly 60% of the original level of detail.";

/// Extra instructions appended to the reflector prompt on retry `level`.
/// Level 0 adds nothing; levels above the ladder reuse the strongest text.
#[must_use]
pub fn reflector_compression_guidance(level: u8) -> &'static str {
    match level.min(MAX_COMPRESSION_LEVEL) {
        0 => "",
        1 => LEVEL_ONE_GUIDANCE,
        _ => LEVEL_TWO_GUIDANCE,
    }
}

#[must_use]
pub const fn validate_reflection_compression(
    reflected_tokens: u32,
    target_threshold_tokens: u32,
) -> bool {
    reflected_tokens < target_threshold_tokens
}
