//! Cycle lifecycle events: synchronous listeners plus a broadcast channel.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{OmError, OmInferenceFailureKind};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Observation,
    Reflection,
}

impl CycleKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Reflection => "reflection",
        }
    }
}

/// Diagnostic snapshot of a failed cycle, kept on the scope status until the
/// next cycle of the same kind succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleFailure {
    pub kind: CycleKind,
    pub cycle_id: String,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_kind: Option<OmInferenceFailureKind>,
    pub retryable: bool,
    pub buffering: bool,
    pub failed_at: DateTime<Utc>,
}

impl CycleFailure {
    #[must_use]
    pub fn from_error(kind: CycleKind, cycle_id: &str, buffering: bool, err: &OmError) -> Self {
        let inference_kind = match err {
            OmError::ModelInvocation { kind, .. } => Some(*kind),
            _ => None,
        };
        Self {
            kind,
            cycle_id: cycle_id.to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
            inference_kind,
            retryable: inference_kind.is_none_or(OmInferenceFailureKind::is_retryable),
            buffering,
            failed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OmEvent {
    ObservationStarted {
        scope_key: String,
        cycle_id: String,
        message_count: usize,
        message_tokens: u32,
    },
    ObservationEnded {
        scope_key: String,
        cycle_id: String,
        message_tokens: u32,
        observation_tokens: u32,
        last_observed_at: DateTime<Utc>,
        duration_ms: u64,
    },
    ObservationFailed {
        scope_key: String,
        cycle_id: String,
        failure: CycleFailure,
    },
    ReflectionStarted {
        scope_key: String,
        cycle_id: String,
        generation_count: u32,
        observation_tokens: u32,
    },
    ReflectionEnded {
        scope_key: String,
        cycle_id: String,
        generation_count: u32,
        observation_tokens_before: u32,
        observation_tokens_after: u32,
        compression_level: u8,
        duration_ms: u64,
    },
    ReflectionFailed {
        scope_key: String,
        cycle_id: String,
        failure: CycleFailure,
    },
    BufferingStarted {
        scope_key: String,
        cycle_id: String,
        kind: CycleKind,
        input_tokens: u32,
    },
    BufferingEnded {
        scope_key: String,
        cycle_id: String,
        kind: CycleKind,
        output_tokens: u32,
    },
    BufferingFailed {
        scope_key: String,
        cycle_id: String,
        kind: CycleKind,
        failure: CycleFailure,
    },
    Activation {
        scope_key: String,
        cycle_id: String,
        kind: CycleKind,
        chunks_activated: usize,
        message_tokens_activated: u32,
        observation_tokens_activated: u32,
    },
}

impl OmEvent {
    #[must_use]
    pub fn scope_key(&self) -> &str {
        match self {
            Self::ObservationStarted { scope_key, .. }
            | Self::ObservationEnded { scope_key, .. }
            | Self::ObservationFailed { scope_key, .. }
            | Self::ReflectionStarted { scope_key, .. }
            | Self::ReflectionEnded { scope_key, .. }
            | Self::ReflectionFailed { scope_key, .. }
            | Self::BufferingStarted { scope_key, .. }
            | Self::BufferingEnded { scope_key, .. }
            | Self::BufferingFailed { scope_key, .. }
            | Self::Activation { scope_key, .. } => scope_key,
        }
    }

    #[must_use]
    pub fn cycle_id(&self) -> &str {
        match self {
            Self::ObservationStarted { cycle_id, .. }
            | Self::ObservationEnded { cycle_id, .. }
            | Self::ObservationFailed { cycle_id, .. }
            | Self::ReflectionStarted { cycle_id, .. }
            | Self::ReflectionEnded { cycle_id, .. }
            | Self::ReflectionFailed { cycle_id, .. }
            | Self::BufferingStarted { cycle_id, .. }
            | Self::BufferingEnded { cycle_id, .. }
            | Self::BufferingFailed { cycle_id, .. }
            | Self::Activation { cycle_id, .. } => cycle_id,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ObservationStarted { .. } => "observation_started",
            Self::ObservationEnded { .. } => "observation_ended",
            Self::ObservationFailed { .. } => "observation_failed",
            Self::ReflectionStarted { .. } => "reflection_started",
            Self::ReflectionEnded { .. } => "reflection_ended",
            Self::ReflectionFailed { .. } => "reflection_failed",
            Self::BufferingStarted { .. } => "buffering_started",
            Self::BufferingEnded { .. } => "buffering_ended",
            Self::BufferingFailed { .. } => "buffering_failed",
            Self::Activation { .. } => "activation",
        }
    }

    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ObservationFailed { .. }
                | Self::ReflectionFailed { .. }
                | Self::BufferingFailed { .. }
        )
    }
}

/// Invoked synchronously on the worker task; keep it cheap.
pub trait OmListener: Send + Sync {
    fn on_event(&self, event: &OmEvent);
}

impl<F> OmListener for F
where
    F: Fn(&OmEvent) + Send + Sync,
{
    fn on_event(&self, event: &OmEvent) {
        self(event);
    }
}

pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn OmListener>>>,
    sender: broadcast::Sender<OmEvent>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl EventBus {
    #[must_use]
    pub fn new(listeners: Vec<Arc<dyn OmListener>>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(listeners),
            sender,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn OmListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Receivers that fall behind skip to the newest events (`Lagged`).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OmEvent> {
        self.sender.subscribe()
    }

    /// A panicking listener is logged and skipped; the rest still run.
    pub fn emit(&self, event: &OmEvent, hooks: &[Arc<dyn OmListener>]) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners.iter().chain(hooks) {
            if catch_unwind(AssertUnwindSafe(|| listener.on_event(event))).is_err() {
                warn!(
                    event = event.name(),
                    scope_key = event.scope_key(),
                    "om listener panicked"
                );
            }
        }
        self.sender.send(event.clone()).ok();
    }
}

/// Logs every lifecycle event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl OmListener for TracingListener {
    fn on_event(&self, event: &OmEvent) {
        match event {
            OmEvent::ObservationFailed { failure, .. }
            | OmEvent::ReflectionFailed { failure, .. }
            | OmEvent::BufferingFailed { failure, .. } => warn!(
                event = event.name(),
                scope_key = event.scope_key(),
                cycle_id = event.cycle_id(),
                code = %failure.code,
                retryable = failure.retryable,
                error = %failure.message,
                "om cycle failed"
            ),
            OmEvent::ObservationEnded {
                observation_tokens,
                message_tokens,
                duration_ms,
                ..
            } => info!(
                event = event.name(),
                scope_key = event.scope_key(),
                cycle_id = event.cycle_id(),
                observation_tokens,
                message_tokens,
                duration_ms,
                "om observation committed"
            ),
            OmEvent::ReflectionEnded {
                generation_count,
                observation_tokens_before,
                observation_tokens_after,
                ..
            } => info!(
                event = event.name(),
                scope_key = event.scope_key(),
                cycle_id = event.cycle_id(),
                generation_count,
                observation_tokens_before,
                observation_tokens_after,
                "om reflection committed"
            ),
            _ => info!(
                event = event.name(),
                scope_key = event.scope_key(),
                cycle_id = event.cycle_id(),
                "om cycle event"
            ),
        }
    }
}
