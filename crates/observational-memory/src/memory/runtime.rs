use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::events::{CycleFailure, OmListener};
use crate::om::{OmObservationChunk, OmScopeBinding};

/// Per-kind lifecycle: `Idle -> Buffering -> Running -> Idle`, with either
/// middle step optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Buffering,
    Running,
}

/// Reflection text computed ahead of the threshold for the oldest
/// `reflected_line_count` lines of the observation text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct BufferedReflection {
    pub(super) cycle_id: String,
    pub(super) text: String,
    pub(super) tokens: u32,
    pub(super) input_tokens: u32,
    pub(super) source_slice: String,
    pub(super) reflected_line_count: usize,
    pub(super) generation_count: u32,
    pub(super) compression_level: u8,
}

#[derive(Default)]
pub(super) struct ScopeState {
    pub(super) worker_active: bool,
    pub(super) rerun_requested: bool,
    pub(super) observer_phase: CyclePhase,
    pub(super) reflector_phase: CyclePhase,
    pub(super) buffered_chunks: Vec<OmObservationChunk>,
    pub(super) next_chunk_seq: u32,
    pub(super) last_buffered_at_tokens: u32,
    pub(super) buffered_reflection: Option<BufferedReflection>,
    pub(super) step_number: u64,
    pub(super) last_failure: Option<CycleFailure>,
    pub(super) pending_hooks: Vec<Arc<dyn OmListener>>,
    pub(super) flags_reconciled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) struct ScopeSignal {
    pub(super) observer_epoch: u64,
    pub(super) reflector_epoch: u64,
    pub(super) worker_active: bool,
}

pub(super) struct ScopeRuntime {
    pub(super) binding: OmScopeBinding,
    state: Mutex<ScopeState>,
    signal: watch::Sender<ScopeSignal>,
}

impl ScopeRuntime {
    pub(super) fn new(binding: OmScopeBinding) -> Self {
        let (signal, _) = watch::channel(ScopeSignal::default());
        Self {
            binding,
            state: Mutex::new(ScopeState::default()),
            signal,
        }
    }

    /// State updates never span an await, so a poisoned lock only means a
    /// listener panicked mid-update; the data is still usable.
    pub(super) fn state(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn signal(&self) -> ScopeSignal {
        *self.signal.borrow()
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<ScopeSignal> {
        self.signal.subscribe()
    }

    /// Returns `true` when the caller must spawn the worker.
    pub(super) fn request_work(&self, hooks: Vec<Arc<dyn OmListener>>) -> bool {
        let spawn = {
            let mut state = self.state();
            state.pending_hooks.extend(hooks);
            if state.worker_active {
                state.rerun_requested = true;
                false
            } else {
                state.worker_active = true;
                state.rerun_requested = false;
                true
            }
        };
        if spawn {
            self.signal.send_modify(|signal| signal.worker_active = true);
        }
        spawn
    }

    pub(super) fn take_hooks(&self) -> Vec<Arc<dyn OmListener>> {
        std::mem::take(&mut self.state().pending_hooks)
    }

    /// Ends a worker pass. Returns `true` when another pass was requested.
    pub(super) fn finish_pass(&self, stopping: bool) -> bool {
        let rerun = {
            let mut state = self.state();
            if state.rerun_requested && !stopping {
                state.rerun_requested = false;
                true
            } else {
                state.worker_active = false;
                state.rerun_requested = false;
                state.pending_hooks.clear();
                false
            }
        };
        if !rerun {
            self.signal.send_modify(|signal| signal.worker_active = false);
        }
        rerun
    }

    /// Resets a scope whose worker died mid-pass. The record's cycle flags
    /// are cleared on the next `observe`.
    pub(super) fn abandon(&self) {
        {
            let mut state = self.state();
            state.worker_active = false;
            state.rerun_requested = false;
            state.pending_hooks.clear();
            state.observer_phase = CyclePhase::Idle;
            state.reflector_phase = CyclePhase::Idle;
            state.flags_reconciled = false;
        }
        self.signal.send_modify(|signal| signal.worker_active = false);
    }

    pub(super) fn bump_observer_epoch(&self) {
        self.signal
            .send_modify(|signal| signal.observer_epoch = signal.observer_epoch.wrapping_add(1));
    }

    pub(super) fn bump_reflector_epoch(&self) {
        self.signal
            .send_modify(|signal| signal.reflector_epoch = signal.reflector_epoch.wrapping_add(1));
    }
}
