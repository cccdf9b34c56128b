use std::collections::HashSet;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::om::{
    BufferTokensInput, ObservationConfigInput, OmConfigInput, OmMessage, OmObservationChunk,
    OmScope, resolve_om_config,
};

use super::*;

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

fn message(id: &str, minutes: i64, text: &str) -> OmMessage {
    OmMessage::new(id, "user", text, at(minutes))
}

fn chunk(
    seq: u32,
    observed_after: Option<DateTime<Utc>>,
    last_observed_at: DateTime<Utc>,
    msg_tokens: u32,
    obs_tokens: u32,
    ids: &[&str],
) -> OmObservationChunk {
    OmObservationChunk {
        id: format!("chunk-{seq}"),
        seq,
        cycle_id: format!("cycle-{seq}"),
        observations: format!("obs-{seq}"),
        token_count: obs_tokens,
        message_tokens: msg_tokens,
        message_ids: ids.iter().copied().map(str::to_string).collect(),
        observed_after,
        last_observed_at,
        current_task: None,
        suggested_response: None,
        created_at: last_observed_at,
    }
}
