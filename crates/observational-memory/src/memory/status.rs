use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::events::CycleFailure;
use crate::om::{OmRecord, OmScope, ResolvedOmConfig};

use super::runtime::{CyclePhase, ScopeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenGauge {
    pub tokens: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveStatus {
    pub messages: TokenGauge,
    pub observations: TokenGauge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    #[default]
    Empty,
    Buffering,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BufferedEntry {
    pub status: BufferStatus,
    pub chunks: usize,
    /// Message tokens the buffered output covers (observations) or the
    /// observation tokens it condenses (reflection).
    pub input_tokens: u32,
    pub tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferedStatus {
    pub observations: BufferedEntry,
    pub reflection: BufferedEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OmStatus {
    pub scope_key: String,
    pub scope: OmScope,
    pub active: ActiveStatus,
    pub buffered: BufferedStatus,
    pub generation_count: u32,
    pub step_number: u64,
    pub observer: CyclePhase,
    pub reflector: CyclePhase,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub observer_trigger_count_total: u32,
    pub reflector_trigger_count_total: u32,
    pub last_failure: Option<CycleFailure>,
}

fn buffer_status(phase: CyclePhase, has_output: bool) -> BufferStatus {
    if phase == CyclePhase::Buffering {
        BufferStatus::Buffering
    } else if has_output {
        BufferStatus::Ready
    } else {
        BufferStatus::Empty
    }
}

pub(super) fn build_status(
    record: &OmRecord,
    config: &ResolvedOmConfig,
    state: &ScopeState,
) -> OmStatus {
    let observations = BufferedEntry {
        status: buffer_status(state.observer_phase, !state.buffered_chunks.is_empty()),
        chunks: state.buffered_chunks.len(),
        input_tokens: state
            .buffered_chunks
            .iter()
            .fold(0u32, |total, chunk| total.saturating_add(chunk.message_tokens)),
        tokens: state
            .buffered_chunks
            .iter()
            .fold(0u32, |total, chunk| total.saturating_add(chunk.token_count)),
    };
    let reflection = BufferedEntry {
        status: buffer_status(state.reflector_phase, state.buffered_reflection.is_some()),
        chunks: usize::from(state.buffered_reflection.is_some()),
        input_tokens: state
            .buffered_reflection
            .as_ref()
            .map_or(0, |buffered| buffered.input_tokens),
        tokens: state
            .buffered_reflection
            .as_ref()
            .map_or(0, |buffered| buffered.tokens),
    };

    OmStatus {
        scope_key: record.scope_key.clone(),
        scope: record.scope,
        active: ActiveStatus {
            messages: TokenGauge {
                tokens: record.pending_message_tokens,
                threshold: config
                    .observation
                    .dynamic_threshold(record.observation_token_count),
            },
            observations: TokenGauge {
                tokens: record.observation_token_count,
                threshold: config.reflection.observation_tokens,
            },
        },
        buffered: BufferedStatus {
            observations,
            reflection,
        },
        generation_count: record.generation_count,
        step_number: state.step_number,
        observer: state.observer_phase,
        reflector: state.reflector_phase,
        last_observed_at: record.last_observed_at,
        observer_trigger_count_total: record.observer_trigger_count_total,
        reflector_trigger_count_total: record.reflector_trigger_count_total,
        last_failure: state.last_failure.clone(),
    }
}
