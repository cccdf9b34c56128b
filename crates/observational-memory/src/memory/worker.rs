//! Background cycles for one scope. A single worker task per scope runs
//! observer then reflector steps until no further pass is requested.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OmError, Result};
use crate::events::{CycleFailure, CycleKind, OmEvent, OmListener};
use crate::observer::{ObserverInput, ObserverOutput};
use crate::om::{
    ActivationBoundary, BufferedReflectionSlicePlan, ObserverAction, ObserverDecisionInput,
    OmMessage, OmObservationChunk, OmOriginType, OmRecord, ReflectionAction,
    ReflectionDecisionInput, ResolvedOmConfig,
    combine_observations_for_buffering, decide_observer_action, merge_activated_observations,
    merge_buffered_reflection, merge_message_ids, merge_observations,
    plan_buffered_reflection_slice, select_contiguous_chunks, select_reflection_action,
    select_stranded_messages,
};
use crate::reflector::{ReflectorInput, ReflectorOutput};

use super::Inner;
use super::runtime::{BufferedReflection, CyclePhase, ScopeRuntime};

type Hooks = [Arc<dyn OmListener>];

enum ObservationPlan {
    Activate {
        record: OmRecord,
        window: Vec<OmMessage>,
        chunks: Vec<OmObservationChunk>,
        boundary: ActivationBoundary,
    },
    Buffer {
        record: OmRecord,
        window: Vec<OmMessage>,
        observed_after: Option<DateTime<Utc>>,
        buffered_text: String,
    },
}

enum ReflectionPlan {
    Reflect {
        record: OmRecord,
        buffered: Option<BufferedReflection>,
    },
    Buffer {
        record: OmRecord,
        slice: BufferedReflectionSlicePlan,
    },
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn new_cycle_id() -> String {
    Uuid::new_v4().to_string()
}

/// Releases the scope if the worker task unwinds before its last pass ends.
struct WorkerGuard {
    runtime: Arc<ScopeRuntime>,
    armed: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(scope_key = %self.runtime.binding.scope_key, "om worker aborted mid-pass");
            self.runtime.abandon();
        }
    }
}

impl Inner {
    pub(super) async fn run_worker(self: Arc<Self>, runtime: Arc<ScopeRuntime>) {
        debug!(scope_key = %runtime.binding.scope_key, "om worker started");
        let mut guard = WorkerGuard {
            runtime: Arc::clone(&runtime),
            armed: true,
        };
        loop {
            let hooks = runtime.take_hooks();
            if !self.is_shutting_down() {
                self.run_pass(&runtime, &hooks).await;
            }
            if !runtime.finish_pass(self.is_shutting_down()) {
                break;
            }
        }
        guard.armed = false;
        debug!(scope_key = %runtime.binding.scope_key, "om worker idle");
    }

    async fn run_pass(&self, runtime: &ScopeRuntime, hooks: &Hooks) {
        let config = self.config_for(&runtime.binding);
        self.observer_step(runtime, &config, hooks).await;
        if self.is_shutting_down() {
            return;
        }
        self.reflector_step(runtime, &config, hooks).await;
    }

    async fn observer_step(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
        hooks: &Hooks,
    ) {
        let cycle_id = new_cycle_id();
        match self.plan_observation(runtime, config).await {
            Ok(None) => {}
            Ok(Some(ObservationPlan::Activate {
                record,
                window,
                chunks,
                boundary,
            })) => {
                let started = Instant::now();
                let message_tokens = self.tokens.count_messages(&window);
                let result = self
                    .run_activation(
                        runtime, config, &cycle_id, record, &window, &chunks, &boundary, hooks,
                    )
                    .await;
                match result {
                    Ok(committed) => self.observation_committed(
                        runtime,
                        &cycle_id,
                        &committed,
                        message_tokens,
                        elapsed_ms(started),
                        hooks,
                    ),
                    Err(err) => self.observation_failed(runtime, &cycle_id, &err, hooks).await,
                }
                runtime.bump_observer_epoch();
            }
            Ok(Some(ObservationPlan::Buffer {
                record,
                window,
                observed_after,
                buffered_text,
            })) => {
                self.run_observation_buffer(
                    runtime,
                    config,
                    &cycle_id,
                    &record,
                    &window,
                    observed_after,
                    &buffered_text,
                    hooks,
                )
                .await;
            }
            Err(err) => {
                self.record_failure(runtime, CycleKind::Observation, &cycle_id, false, &err);
                let failure =
                    CycleFailure::from_error(CycleKind::Observation, &cycle_id, false, &err);
                self.emit(
                    &OmEvent::ObservationFailed {
                        scope_key: runtime.binding.scope_key.clone(),
                        cycle_id,
                        failure,
                    },
                    hooks,
                );
                runtime.bump_observer_epoch();
            }
        }
    }

    async fn plan_observation(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
    ) -> Result<Option<ObservationPlan>> {
        let key = runtime.binding.scope_key.as_str();
        let lease = self.records.lock(key).await;
        let Some(mut record) = self.records.get(key).await? else {
            return Ok(None);
        };
        let (last_buffered_at_tokens, chunks) = {
            let state = runtime.state();
            (state.last_buffered_at_tokens, state.buffered_chunks.clone())
        };
        let decision = decide_observer_action(
            ObserverDecisionInput {
                pending_message_tokens: record.pending_message_tokens,
                observation_token_count: record.observation_token_count,
                last_buffered_at_tokens,
                is_observing: record.is_observing,
                is_buffering: false,
            },
            config.observation,
        );
        debug!(
            scope_key = key,
            pending = record.pending_message_tokens,
            threshold = decision.threshold,
            action = ?decision.action,
            "om observer decision"
        );

        match decision.action {
            ObserverAction::None => Ok(None),
            ObserverAction::Activate => {
                let window = self.records.pending_messages(&record).await?;
                if window.is_empty() {
                    if record.pending_message_tokens != 0 {
                        record.pending_message_tokens = 0;
                        self.records.save(&lease, &mut record).await?;
                    }
                    return Ok(None);
                }
                let boundary = select_contiguous_chunks(&chunks, record.last_observed_at);
                let activated = chunks
                    .into_iter()
                    .take(boundary.chunks_activated)
                    .collect::<Vec<_>>();
                record.is_observing = true;
                self.records.save(&lease, &mut record).await?;
                runtime.state().observer_phase = CyclePhase::Running;
                Ok(Some(ObservationPlan::Activate {
                    record,
                    window,
                    chunks: activated,
                    boundary,
                }))
            }
            ObserverAction::Buffer => {
                if config.async_buffering_disabled {
                    return Ok(None);
                }
                let observed_after = std::cmp::max(
                    chunks.last().map(|chunk| chunk.last_observed_at),
                    record.last_observed_at,
                );
                let window = self.records.list_unobserved(key, observed_after).await?;
                if window.is_empty() {
                    return Ok(None);
                }
                let buffered_text = merge_activated_observations("", &chunks);
                runtime.state().observer_phase = CyclePhase::Buffering;
                Ok(Some(ObservationPlan::Buffer {
                    record,
                    window,
                    observed_after,
                    buffered_text,
                }))
            }
        }
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "activation threads the planned window through one call"
    )]
    async fn run_activation(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
        cycle_id: &str,
        record: OmRecord,
        window: &[OmMessage],
        chunks: &[OmObservationChunk],
        boundary: &ActivationBoundary,
        hooks: &Hooks,
    ) -> Result<OmRecord> {
        let key = record.scope_key.clone();
        self.emit(
            &OmEvent::ObservationStarted {
                scope_key: key.clone(),
                cycle_id: cycle_id.to_string(),
                message_count: window.len(),
                message_tokens: self.tokens.count_messages(window),
            },
            hooks,
        );
        if boundary.chunks_activated > 0 {
            self.emit(
                &OmEvent::Activation {
                    scope_key: key.clone(),
                    cycle_id: cycle_id.to_string(),
                    kind: CycleKind::Observation,
                    chunks_activated: boundary.chunks_activated,
                    message_tokens_activated: boundary.message_tokens_activated,
                    observation_tokens_activated: boundary.observation_tokens_activated,
                },
                hooks,
            );
        }

        let covered = boundary
            .activated_message_ids
            .iter()
            .map(String::as_str)
            .collect::<HashSet<_>>();
        let remainder = window
            .iter()
            .filter(|message| !covered.contains(message.id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let context = merge_activated_observations(&record.active_observations, chunks);
        let observed = if remainder.is_empty() {
            None
        } else {
            Some(
                self.observer
                    .observe(ObserverInput {
                        scope: record.scope,
                        scope_key: &key,
                        generation_count: record.generation_count,
                        active_observations: &context,
                        messages: &remainder,
                        max_tokens_per_batch: config.observation.max_tokens_per_batch,
                    })
                    .await?,
            )
        };

        self.commit_observation(runtime, window, chunks, observed.as_ref())
            .await
    }

    async fn commit_observation(
        &self,
        runtime: &ScopeRuntime,
        window: &[OmMessage],
        chunks: &[OmObservationChunk],
        observed: Option<&ObserverOutput>,
    ) -> Result<OmRecord> {
        let key = runtime.binding.scope_key.as_str();
        let lease = self.records.lock(key).await;
        let Some(mut record) = self.records.get(key).await? else {
            return Err(OmError::Storage(format!(
                "om record for {key} disappeared during observation"
            )));
        };

        let candidates = self.records.pending_messages(&record).await?;

        let mut new_text = merge_activated_observations("", chunks);
        if let Some(output) = observed {
            new_text = merge_observations(&new_text, &output.observations);
        }
        record.active_observations = merge_observations(&record.active_observations, &new_text);
        record.observation_token_count = self.tokens.count_text(&record.active_observations);

        let cutoff = std::cmp::max(
            window.last().map(|message| message.created_at),
            chunks.last().map(|chunk| chunk.last_observed_at),
        );
        record.last_observed_at = std::cmp::max(record.last_observed_at, cutoff);
        let window_ids = window
            .iter()
            .map(|message| message.id.clone())
            .collect::<Vec<_>>();
        record.last_observed_message_ids = merge_message_ids(&[], &window_ids);
        let folded = window_ids
            .iter()
            .chain(chunks.iter().flat_map(|chunk| chunk.message_ids.iter()))
            .map(String::as_str)
            .collect::<HashSet<_>>();
        record.carried_messages =
            select_stranded_messages(&candidates, &folded, record.last_observed_at);
        if !record.carried_messages.is_empty() {
            debug!(
                scope_key = key,
                carried = record.carried_messages.len(),
                "om: carrying messages that arrived during the cycle"
            );
        }

        let current_task = observed
            .and_then(|output| output.current_task.clone())
            .or_else(|| chunks.iter().rev().find_map(|chunk| chunk.current_task.clone()));
        let suggested_response = observed
            .and_then(|output| output.suggested_response.clone())
            .or_else(|| {
                chunks
                    .iter()
                    .rev()
                    .find_map(|chunk| chunk.suggested_response.clone())
            });
        if current_task.is_some() {
            record.current_task = current_task;
        }
        if suggested_response.is_some() {
            record.suggested_response = suggested_response;
        }

        let remaining = self.records.pending_messages(&record).await?;
        record.pending_message_tokens = self.tokens.count_messages(&remaining);
        record.observer_trigger_count_total =
            record.observer_trigger_count_total.saturating_add(1);
        record.is_observing = false;
        self.records.save(&lease, &mut record).await?;
        drop(lease);
        Ok(record)
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "the ended event reports the full cycle picture"
    )]
    fn observation_committed(
        &self,
        runtime: &ScopeRuntime,
        cycle_id: &str,
        record: &OmRecord,
        message_tokens: u32,
        duration_ms: u64,
        hooks: &Hooks,
    ) {
        {
            let mut state = runtime.state();
            state
                .buffered_chunks
                .retain(|chunk| chunk.observed_after >= record.last_observed_at);
            let still_buffered = state
                .buffered_chunks
                .iter()
                .fold(0u32, |total, chunk| total.saturating_add(chunk.message_tokens));
            state.last_buffered_at_tokens = still_buffered.min(record.pending_message_tokens);
            state.observer_phase = CyclePhase::Idle;
            state.step_number = state.step_number.saturating_add(1);
            if state
                .last_failure
                .as_ref()
                .is_some_and(|failure| failure.kind == CycleKind::Observation)
            {
                state.last_failure = None;
            }
        }
        let Some(last_observed_at) = record.last_observed_at else {
            return;
        };
        self.emit(
            &OmEvent::ObservationEnded {
                scope_key: record.scope_key.clone(),
                cycle_id: cycle_id.to_string(),
                message_tokens,
                observation_tokens: record.observation_token_count,
                last_observed_at,
                duration_ms,
            },
            hooks,
        );
    }

    async fn observation_failed(
        &self,
        runtime: &ScopeRuntime,
        cycle_id: &str,
        err: &OmError,
        hooks: &Hooks,
    ) {
        self.clear_cycle_flag(runtime, CycleKind::Observation).await;
        runtime.state().observer_phase = CyclePhase::Idle;
        self.record_failure(runtime, CycleKind::Observation, cycle_id, false, err);
        self.emit(
            &OmEvent::ObservationFailed {
                scope_key: runtime.binding.scope_key.clone(),
                cycle_id: cycle_id.to_string(),
                failure: CycleFailure::from_error(CycleKind::Observation, cycle_id, false, err),
            },
            hooks,
        );
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "buffering threads the planned window through one call"
    )]
    async fn run_observation_buffer(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
        cycle_id: &str,
        record: &OmRecord,
        window: &[OmMessage],
        observed_after: Option<DateTime<Utc>>,
        buffered_text: &str,
        hooks: &Hooks,
    ) {
        let key = record.scope_key.as_str();
        self.emit(
            &OmEvent::BufferingStarted {
                scope_key: key.to_string(),
                cycle_id: cycle_id.to_string(),
                kind: CycleKind::Observation,
                input_tokens: self.tokens.count_messages(window),
            },
            hooks,
        );
        let context =
            combine_observations_for_buffering(&record.active_observations, buffered_text)
                .unwrap_or_default();
        let result = self
            .observer
            .observe(ObserverInput {
                scope: record.scope,
                scope_key: key,
                generation_count: record.generation_count,
                active_observations: &context,
                messages: window,
                max_tokens_per_batch: config.observation.max_tokens_per_batch,
            })
            .await;

        match result {
            Ok(output) => {
                let output_tokens = output.observation_tokens;
                {
                    let mut state = runtime.state();
                    let seq = state.next_chunk_seq;
                    state.next_chunk_seq = seq.saturating_add(1);
                    state.buffered_chunks.push(OmObservationChunk {
                        id: Uuid::new_v4().to_string(),
                        seq,
                        cycle_id: cycle_id.to_string(),
                        observations: output.observations,
                        token_count: output.observation_tokens,
                        message_tokens: output.message_tokens,
                        message_ids: output.message_ids,
                        observed_after,
                        last_observed_at: output.last_observed_at,
                        current_task: output.current_task,
                        suggested_response: output.suggested_response,
                        created_at: Utc::now(),
                    });
                    state.last_buffered_at_tokens = record.pending_message_tokens;
                    state.observer_phase = CyclePhase::Idle;
                }
                self.emit(
                    &OmEvent::BufferingEnded {
                        scope_key: key.to_string(),
                        cycle_id: cycle_id.to_string(),
                        kind: CycleKind::Observation,
                        output_tokens,
                    },
                    hooks,
                );
            }
            Err(err) => {
                runtime.state().observer_phase = CyclePhase::Idle;
                self.record_failure(runtime, CycleKind::Observation, cycle_id, true, &err);
                self.emit(
                    &OmEvent::BufferingFailed {
                        scope_key: key.to_string(),
                        cycle_id: cycle_id.to_string(),
                        kind: CycleKind::Observation,
                        failure: CycleFailure::from_error(
                            CycleKind::Observation,
                            cycle_id,
                            true,
                            &err,
                        ),
                    },
                    hooks,
                );
            }
        }
    }

    async fn reflector_step(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
        hooks: &Hooks,
    ) {
        let cycle_id = new_cycle_id();
        match self.plan_reflection(runtime, config).await {
            Ok(None) => {}
            Ok(Some(ReflectionPlan::Reflect { record, buffered })) => {
                let started = Instant::now();
                let before = record.observation_token_count;
                let result = self
                    .run_reflection(runtime, config, &cycle_id, &record, buffered, hooks)
                    .await;
                match result {
                    Ok((committed, level)) => self.reflection_committed(
                        runtime,
                        &cycle_id,
                        &committed,
                        before,
                        level,
                        elapsed_ms(started),
                        hooks,
                    ),
                    Err(err) => self.reflection_failed(runtime, &cycle_id, &err, hooks).await,
                }
                runtime.bump_reflector_epoch();
            }
            Ok(Some(ReflectionPlan::Buffer { record, slice })) => {
                self.run_reflection_buffer(runtime, &cycle_id, &record, slice, hooks)
                    .await;
            }
            Err(err) => {
                self.record_failure(runtime, CycleKind::Reflection, &cycle_id, false, &err);
                let failure =
                    CycleFailure::from_error(CycleKind::Reflection, &cycle_id, false, &err);
                self.emit(
                    &OmEvent::ReflectionFailed {
                        scope_key: runtime.binding.scope_key.clone(),
                        cycle_id,
                        failure,
                    },
                    hooks,
                );
                runtime.bump_reflector_epoch();
            }
        }
    }

    async fn plan_reflection(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
    ) -> Result<Option<ReflectionPlan>> {
        let key = runtime.binding.scope_key.as_str();
        let lease = self.records.lock(key).await;
        let Some(mut record) = self.records.get(key).await? else {
            return Ok(None);
        };
        let buffered = {
            let mut state = runtime.state();
            let stale = state.buffered_reflection.as_ref().is_some_and(|buffered| {
                buffered.generation_count != record.generation_count
                    || !record.active_observations.starts_with(&buffered.source_slice)
            });
            if stale {
                debug!(scope_key = key, "om: dropping stale buffered reflection");
                state.buffered_reflection = None;
            }
            state.buffered_reflection.clone()
        };
        let buffer_activation = if config.async_buffering_disabled {
            None
        } else {
            config.reflection.buffer_activation
        };
        let action = select_reflection_action(ReflectionDecisionInput {
            observation_tokens: record.observation_token_count,
            threshold: config.reflection.observation_tokens,
            buffer_activation,
            has_buffered_reflection: buffered.is_some(),
            is_buffering_reflection: false,
            is_reflecting: record.is_reflecting,
        });
        debug!(
            scope_key = key,
            observation_tokens = record.observation_token_count,
            threshold = config.reflection.observation_tokens,
            action = ?action,
            "om reflector decision"
        );

        match action {
            ReflectionAction::None => Ok(None),
            ReflectionAction::Reflect => {
                record.is_reflecting = true;
                self.records.save(&lease, &mut record).await?;
                runtime.state().reflector_phase = CyclePhase::Running;
                Ok(Some(ReflectionPlan::Reflect { record, buffered }))
            }
            ReflectionAction::Buffer => {
                let Some(activation) = buffer_activation else {
                    return Ok(None);
                };
                let slice = plan_buffered_reflection_slice(
                    &record.active_observations,
                    record.observation_token_count,
                    config.reflection.observation_tokens,
                    activation,
                );
                if slice.sliced_observations.trim().is_empty() || slice.slice_token_estimate == 0 {
                    return Ok(None);
                }
                runtime.state().reflector_phase = CyclePhase::Buffering;
                Ok(Some(ReflectionPlan::Buffer { record, slice }))
            }
        }
    }

    async fn run_reflection(
        &self,
        runtime: &ScopeRuntime,
        config: &ResolvedOmConfig,
        cycle_id: &str,
        record: &OmRecord,
        buffered: Option<BufferedReflection>,
        hooks: &Hooks,
    ) -> Result<(OmRecord, u8)> {
        let key = record.scope_key.as_str();
        self.emit(
            &OmEvent::ReflectionStarted {
                scope_key: key.to_string(),
                cycle_id: cycle_id.to_string(),
                generation_count: record.generation_count,
                observation_tokens: record.observation_token_count,
            },
            hooks,
        );
        let snapshot = record.active_observations.as_str();
        let activated = buffered.and_then(|buffered| {
            self.activate_buffered_reflection(cycle_id, record, &buffered, hooks)
        });
        let output = match activated {
            Some(output) => output,
            None => {
                self.reflector
                    .reflect(ReflectorInput {
                        scope: record.scope,
                        scope_key: key,
                        generation_count: record.generation_count,
                        observations: snapshot,
                        observation_tokens: record.observation_token_count,
                        target_tokens: config.reflection.observation_tokens,
                    })
                    .await?
            }
        };
        let level = output.compression_level;
        let committed = self.commit_reflection(runtime, snapshot, &output).await?;
        Ok((committed, level))
    }

    /// Returns `None` when merging the buffered text would not shrink the
    /// observations; the caller then reflects synchronously.
    fn activate_buffered_reflection(
        &self,
        cycle_id: &str,
        record: &OmRecord,
        buffered: &BufferedReflection,
        hooks: &Hooks,
    ) -> Option<ReflectorOutput> {
        let lines = record.active_observations.split('\n').collect::<Vec<_>>();
        let merged =
            merge_buffered_reflection(&lines, buffered.reflected_line_count, &buffered.text);
        let merged_tokens = self.tokens.count_text(&merged);
        if merged_tokens >= record.observation_token_count {
            debug!(
                scope_key = %record.scope_key,
                merged_tokens,
                observation_tokens = record.observation_token_count,
                "om: buffered reflection does not shrink observations"
            );
            return None;
        }
        debug!(
            scope_key = %record.scope_key,
            buffered_cycle_id = %buffered.cycle_id,
            input_tokens = buffered.input_tokens,
            merged_tokens,
            "om: activating buffered reflection"
        );
        self.emit(
            &OmEvent::Activation {
                scope_key: record.scope_key.clone(),
                cycle_id: cycle_id.to_string(),
                kind: CycleKind::Reflection,
                chunks_activated: 1,
                message_tokens_activated: 0,
                observation_tokens_activated: buffered.tokens,
            },
            hooks,
        );
        Some(ReflectorOutput {
            observations: merged,
            observation_tokens: merged_tokens,
            compression_level: buffered.compression_level,
            current_task: None,
            suggested_response: None,
        })
    }

    async fn commit_reflection(
        &self,
        runtime: &ScopeRuntime,
        snapshot: &str,
        output: &ReflectorOutput,
    ) -> Result<OmRecord> {
        let key = runtime.binding.scope_key.as_str();
        let lease = self.records.lock(key).await;
        let Some(mut record) = self.records.get(key).await? else {
            return Err(OmError::Storage(format!(
                "om record for {key} disappeared during reflection"
            )));
        };
        let Some(appended) = record.active_observations.strip_prefix(snapshot) else {
            return Err(OmError::Internal(format!(
                "observations for {key} were rewritten during reflection"
            )));
        };
        record.active_observations = merge_observations(&output.observations, appended);
        record.observation_token_count = self.tokens.count_text(&record.active_observations);
        record.generation_count = record.generation_count.saturating_add(1);
        record.origin_type = OmOriginType::Reflection;
        record.reflector_trigger_count_total =
            record.reflector_trigger_count_total.saturating_add(1);
        if output.current_task.is_some() {
            record.current_task.clone_from(&output.current_task);
        }
        if output.suggested_response.is_some() {
            record.suggested_response.clone_from(&output.suggested_response);
        }
        record.is_reflecting = false;
        self.records.save(&lease, &mut record).await?;
        drop(lease);
        Ok(record)
    }

    #[allow(
        clippy::too_many_arguments,
        reason = "the ended event reports the full before/after picture"
    )]
    fn reflection_committed(
        &self,
        runtime: &ScopeRuntime,
        cycle_id: &str,
        record: &OmRecord,
        observation_tokens_before: u32,
        compression_level: u8,
        duration_ms: u64,
        hooks: &Hooks,
    ) {
        {
            let mut state = runtime.state();
            state.buffered_reflection = None;
            state.reflector_phase = CyclePhase::Idle;
            state.step_number = state.step_number.saturating_add(1);
            if state
                .last_failure
                .as_ref()
                .is_some_and(|failure| failure.kind == CycleKind::Reflection)
            {
                state.last_failure = None;
            }
        }
        self.emit(
            &OmEvent::ReflectionEnded {
                scope_key: record.scope_key.clone(),
                cycle_id: cycle_id.to_string(),
                generation_count: record.generation_count,
                observation_tokens_before,
                observation_tokens_after: record.observation_token_count,
                compression_level,
                duration_ms,
            },
            hooks,
        );
    }

    async fn reflection_failed(
        &self,
        runtime: &ScopeRuntime,
        cycle_id: &str,
        err: &OmError,
        hooks: &Hooks,
    ) {
        self.clear_cycle_flag(runtime, CycleKind::Reflection).await;
        runtime.state().reflector_phase = CyclePhase::Idle;
        self.record_failure(runtime, CycleKind::Reflection, cycle_id, false, err);
        self.emit(
            &OmEvent::ReflectionFailed {
                scope_key: runtime.binding.scope_key.clone(),
                cycle_id: cycle_id.to_string(),
                failure: CycleFailure::from_error(CycleKind::Reflection, cycle_id, false, err),
            },
            hooks,
        );
    }

    async fn run_reflection_buffer(
        &self,
        runtime: &ScopeRuntime,
        cycle_id: &str,
        record: &OmRecord,
        slice: BufferedReflectionSlicePlan,
        hooks: &Hooks,
    ) {
        let key = record.scope_key.as_str();
        self.emit(
            &OmEvent::BufferingStarted {
                scope_key: key.to_string(),
                cycle_id: cycle_id.to_string(),
                kind: CycleKind::Reflection,
                input_tokens: slice.slice_token_estimate,
            },
            hooks,
        );
        let result = self
            .reflector
            .reflect(ReflectorInput {
                scope: record.scope,
                scope_key: key,
                generation_count: record.generation_count,
                observations: &slice.sliced_observations,
                observation_tokens: slice.slice_token_estimate,
                target_tokens: slice.compression_target_tokens.max(1),
            })
            .await;

        match result {
            Ok(output) => {
                let output_tokens = output.observation_tokens;
                {
                    let mut state = runtime.state();
                    state.buffered_reflection = Some(BufferedReflection {
                        cycle_id: cycle_id.to_string(),
                        text: output.observations,
                        tokens: output.observation_tokens,
                        input_tokens: slice.slice_token_estimate,
                        reflected_line_count: usize::try_from(
                            slice.reflected_observation_line_count,
                        )
                        .unwrap_or(usize::MAX),
                        source_slice: slice.sliced_observations,
                        generation_count: record.generation_count,
                        compression_level: output.compression_level,
                    });
                    state.reflector_phase = CyclePhase::Idle;
                }
                self.emit(
                    &OmEvent::BufferingEnded {
                        scope_key: key.to_string(),
                        cycle_id: cycle_id.to_string(),
                        kind: CycleKind::Reflection,
                        output_tokens,
                    },
                    hooks,
                );
            }
            Err(err) => {
                runtime.state().reflector_phase = CyclePhase::Idle;
                self.record_failure(runtime, CycleKind::Reflection, cycle_id, true, &err);
                self.emit(
                    &OmEvent::BufferingFailed {
                        scope_key: key.to_string(),
                        cycle_id: cycle_id.to_string(),
                        kind: CycleKind::Reflection,
                        failure: CycleFailure::from_error(
                            CycleKind::Reflection,
                            cycle_id,
                            true,
                            &err,
                        ),
                    },
                    hooks,
                );
            }
        }
    }

    fn record_failure(
        &self,
        runtime: &ScopeRuntime,
        kind: CycleKind,
        cycle_id: &str,
        buffering: bool,
        err: &OmError,
    ) {
        warn!(
            scope_key = %runtime.binding.scope_key,
            cycle_id,
            kind = kind.as_str(),
            buffering,
            code = err.code(),
            error = %err,
            "om cycle failed"
        );
        runtime.state().last_failure =
            Some(CycleFailure::from_error(kind, cycle_id, buffering, err));
    }

    /// Best effort: a store that cannot clear the flag leaves it for the
    /// next process start to reconcile.
    async fn clear_cycle_flag(&self, runtime: &ScopeRuntime, kind: CycleKind) {
        let key = runtime.binding.scope_key.as_str();
        let lease = self.records.lock(key).await;
        let mut record = match self.records.get(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    scope_key = key,
                    error = %err,
                    "om: could not reload record to clear cycle flag"
                );
                return;
            }
        };
        let flag = match kind {
            CycleKind::Observation => &mut record.is_observing,
            CycleKind::Reflection => &mut record.is_reflecting,
        };
        if !*flag {
            return;
        }
        *flag = false;
        if let Err(err) = self.records.save(&lease, &mut record).await {
            warn!(scope_key = key, error = %err, "om: could not clear cycle flag");
        }
    }
}
