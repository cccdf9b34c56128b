//! The orchestrator: accepts conversation messages per scope, decides when
//! the observer and reflector run, and serves the compressed memory back.

mod builder;
mod runtime;
mod status;
mod worker;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::context::{ContextAssembler, ObservationFormatter};
use crate::error::{OmError, Result};
use crate::events::{EventBus, OmEvent, OmListener};
use crate::observer::Observer;
use crate::om::{
    OmConfigInput, OmMessage, OmRecord, OmScope, OmScopeBinding, ResolvedOmConfig,
    build_scope_key, resolve_om_config, select_unobserved_messages,
};
use crate::reflector::Reflector;
use crate::store::RecordStore;
use crate::tokens::TokenCounter;

pub use builder::ObservationalMemoryBuilder;
pub use runtime::CyclePhase;
pub use status::{
    ActiveStatus, BufferStatus, BufferedEntry, BufferedStatus, OmStatus, TokenGauge,
};

use runtime::{ScopeRuntime, ScopeSignal};
use status::build_status;

/// Cheap to clone; clones share scopes, workers, and listeners.
#[derive(Clone)]
pub struct ObservationalMemory {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ObservationalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationalMemory")
            .field("scopes", &self.inner.runtimes.len())
            .field("shutting_down", &self.inner.is_shutting_down())
            .finish_non_exhaustive()
    }
}

pub(crate) struct ScopeDefaults {
    input: OmConfigInput,
    thread: ResolvedOmConfig,
    resource: ResolvedOmConfig,
}

impl ScopeDefaults {
    pub(crate) fn resolve(input: OmConfigInput) -> Result<Self> {
        Ok(Self {
            input,
            thread: resolve_om_config(input.for_scope(OmScope::Thread))?,
            resource: resolve_om_config(input.for_scope(OmScope::Resource))?,
        })
    }
}

pub(crate) struct Inner {
    records: RecordStore,
    tokens: Arc<dyn TokenCounter>,
    observer: Observer,
    reflector: Reflector,
    events: EventBus,
    formatter: Arc<dyn ObservationFormatter>,
    defaults: ScopeDefaults,
    overrides: DashMap<String, ResolvedOmConfig>,
    runtimes: DashMap<String, Arc<ScopeRuntime>>,
    shutting_down: AtomicBool,
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn config_for(&self, binding: &OmScopeBinding) -> ResolvedOmConfig {
        if let Some(config) = self.overrides.get(&binding.scope_key) {
            return *config;
        }
        match binding.scope {
            OmScope::Thread => self.defaults.thread,
            OmScope::Resource => self.defaults.resource,
        }
    }

    fn runtime(&self, binding: &OmScopeBinding) -> Arc<ScopeRuntime> {
        self.runtimes
            .entry(binding.scope_key.clone())
            .or_insert_with(|| Arc::new(ScopeRuntime::new(binding.clone())))
            .value()
            .clone()
    }

    fn existing_runtime(&self, scope_key: &str) -> Option<Arc<ScopeRuntime>> {
        self.runtimes.get(scope_key).map(|entry| entry.value().clone())
    }

    fn emit(&self, event: &OmEvent, hooks: &[Arc<dyn OmListener>]) {
        self.events.emit(event, hooks);
    }
}

impl ObservationalMemory {
    #[must_use]
    pub fn builder() -> ObservationalMemoryBuilder {
        ObservationalMemoryBuilder::new()
    }

    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Records new messages for `binding` and schedules background work.
    /// Returns once the messages are persisted, or, when pending tokens are
    /// past `block_after`, once the in-flight cycle resolves.
    pub async fn observe(
        &self,
        binding: &OmScopeBinding,
        messages: &[OmMessage],
    ) -> Result<OmStatus> {
        self.observe_with_hooks(binding, messages, Vec::new()).await
    }

    /// Like [`ObservationalMemory::observe`]; `hooks` additionally receive
    /// the events of the cycles this call schedules.
    pub async fn observe_with_hooks(
        &self,
        binding: &OmScopeBinding,
        messages: &[OmMessage],
        hooks: Vec<Arc<dyn OmListener>>,
    ) -> Result<OmStatus> {
        if self.inner.is_shutting_down() {
            return Err(OmError::ShuttingDown);
        }
        validate_binding(binding)?;
        validate_messages(binding, messages)?;
        if messages.is_empty() {
            return self.get_status(binding).await;
        }

        let inner = &self.inner;
        let key = binding.scope_key.as_str();
        let config = inner.config_for(binding);
        let runtime = inner.runtime(binding);

        let lease = inner.records.lock(key).await;
        let mut record = inner.records.get_or_create(&lease, binding).await?;
        self.reconcile_stale_flags(&runtime, &lease, &mut record)
            .await?;

        let stored = inner.records.pending_messages(&record).await?;
        let known = stored
            .iter()
            .map(|message| message.id.clone())
            .chain(record.last_observed_message_ids.iter().cloned())
            .collect::<HashSet<_>>();
        let fresh = select_unobserved_messages(messages, &known, record.last_observed_at);
        if fresh.is_empty() {
            drop(lease);
            debug!(scope_key = key, "om observe: no new messages");
            return Ok(self.status_from(&record, &config, &runtime));
        }

        inner.records.save_messages(&lease, &fresh).await?;
        record.pending_message_tokens = inner
            .tokens
            .count_messages(&stored)
            .saturating_add(inner.tokens.count_messages(&fresh));
        inner.records.save(&lease, &mut record).await?;
        drop(lease);
        debug!(
            scope_key = key,
            new_messages = fresh.len(),
            pending = record.pending_message_tokens,
            "om observe: messages recorded"
        );

        let before = runtime.signal();
        self.schedule(&runtime, hooks);

        let observer_block = config
            .observation
            .block_after_threshold(record.observation_token_count);
        if record.pending_message_tokens >= observer_block {
            info!(
                scope_key = key,
                pending = record.pending_message_tokens,
                block_after = observer_block,
                "om observe: waiting for observer"
            );
            wait_for_cycle(&runtime, before, |signal| signal.observer_epoch).await?;
        }

        let record = inner.records.get(key).await?.unwrap_or(record);
        let reflector_block = config.reflection.block_after_threshold();
        if record.observation_token_count >= reflector_block {
            info!(
                scope_key = key,
                observation_tokens = record.observation_token_count,
                block_after = reflector_block,
                "om observe: waiting for reflector"
            );
            wait_for_cycle(&runtime, before, |signal| signal.reflector_epoch).await?;
        }

        self.get_status(binding).await
    }

    async fn reconcile_stale_flags(
        &self,
        runtime: &ScopeRuntime,
        lease: &crate::store::ScopeLease,
        record: &mut OmRecord,
    ) -> Result<()> {
        let first_touch = {
            let mut state = runtime.state();
            let first = !state.flags_reconciled;
            state.flags_reconciled = true;
            first && !state.worker_active
        };
        if first_touch && record.has_stale_flags() {
            info!(
                scope_key = %record.scope_key,
                is_observing = record.is_observing,
                is_reflecting = record.is_reflecting,
                "om: clearing stale cycle flags"
            );
            record.is_observing = false;
            record.is_reflecting = false;
            self.inner.records.save(lease, record).await?;
        }
        Ok(())
    }

    fn schedule(&self, runtime: &Arc<ScopeRuntime>, hooks: Vec<Arc<dyn OmListener>>) {
        if runtime.request_work(hooks) {
            let inner = Arc::clone(&self.inner);
            let runtime = Arc::clone(runtime);
            tokio::spawn(inner.run_worker(runtime));
        }
    }

    pub async fn get_status(&self, binding: &OmScopeBinding) -> Result<OmStatus> {
        validate_binding(binding)?;
        let record = self
            .inner
            .records
            .get(&binding.scope_key)
            .await?
            .unwrap_or_else(|| OmRecord::new(binding, chrono::Utc::now()));
        let config = self.inner.config_for(binding);
        let runtime = self.inner.runtime(binding);
        Ok(self.status_from(&record, &config, &runtime))
    }

    fn status_from(
        &self,
        record: &OmRecord,
        config: &ResolvedOmConfig,
        runtime: &ScopeRuntime,
    ) -> OmStatus {
        let state = runtime.state();
        build_status(record, config, &state)
    }

    pub async fn record(&self, binding: &OmScopeBinding) -> Result<Option<OmRecord>> {
        validate_binding(binding)?;
        self.inner.records.get(&binding.scope_key).await
    }

    /// Current observation text; empty when nothing has been observed.
    pub async fn get_observations(&self, binding: &OmScopeBinding) -> Result<String> {
        Ok(self
            .record(binding)
            .await?
            .map(|record| record.active_observations)
            .unwrap_or_default())
    }

    /// Observation text rendered by the configured formatter, or `None` when
    /// there is nothing to inject.
    pub async fn get_system_prompt_block(
        &self,
        binding: &OmScopeBinding,
    ) -> Result<Option<String>> {
        Ok(self
            .record(binding)
            .await?
            .and_then(|record| self.inner.formatter.format(&record)))
    }

    /// Stored messages newer than `since`, ordered by `(created_at, id)`.
    pub async fn messages_since(
        &self,
        binding: &OmScopeBinding,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<OmMessage>> {
        validate_binding(binding)?;
        self.inner
            .records
            .list_unobserved(&binding.scope_key, since)
            .await
    }

    /// Messages not yet folded into observations: those carried past the
    /// cutoff by a running cycle, then those after the cutoff.
    pub async fn unobserved_messages(&self, binding: &OmScopeBinding) -> Result<Vec<OmMessage>> {
        validate_binding(binding)?;
        match self.inner.records.get(&binding.scope_key).await? {
            Some(record) => self.inner.records.pending_messages(&record).await,
            None => {
                self.inner
                    .records
                    .list_unobserved(&binding.scope_key, None)
                    .await
            }
        }
    }

    #[must_use]
    pub fn formatter(&self) -> Arc<dyn ObservationFormatter> {
        Arc::clone(&self.inner.formatter)
    }

    #[must_use]
    pub fn context_assembler(&self) -> ContextAssembler {
        ContextAssembler::new(self.clone())
    }

    #[must_use]
    pub fn config_for(&self, binding: &OmScopeBinding) -> ResolvedOmConfig {
        self.inner.config_for(binding)
    }

    /// Overrides thresholds for one scope. Fields left unset fall back to
    /// the built-in defaults, not to the builder's input.
    pub fn set_scope_config(
        &self,
        binding: &OmScopeBinding,
        input: OmConfigInput,
    ) -> Result<ResolvedOmConfig> {
        validate_binding(binding)?;
        let resolved = resolve_om_config(input.for_scope(binding.scope))?;
        self.inner
            .overrides
            .insert(binding.scope_key.clone(), resolved);
        Ok(resolved)
    }

    pub fn clear_scope_config(&self, binding: &OmScopeBinding) {
        self.inner.overrides.remove(&binding.scope_key);
    }

    #[must_use]
    pub fn default_config_input(&self) -> OmConfigInput {
        self.inner.defaults.input
    }

    pub fn add_listener(&self, listener: Arc<dyn OmListener>) {
        self.inner.events.add_listener(listener);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OmEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until no cycle is running or queued for `binding`.
    pub async fn settle(&self, binding: &OmScopeBinding) -> Result<()> {
        let Some(runtime) = self.inner.existing_runtime(&binding.scope_key) else {
            return Ok(());
        };
        wait_until_idle(&runtime).await
    }

    /// Stops scheduling new cycles and waits for in-flight ones to finish.
    /// Later `observe` calls fail with [`OmError::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        let runtimes = self
            .inner
            .runtimes
            .iter()
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>();
        info!(scopes = runtimes.len(), "om: shutting down");
        for runtime in runtimes {
            wait_until_idle(&runtime).await?;
        }
        Ok(())
    }
}

async fn wait_until_idle(runtime: &ScopeRuntime) -> Result<()> {
    let mut receiver = runtime.subscribe();
    receiver
        .wait_for(|signal| !signal.worker_active)
        .await
        .map(|_| ())
        .map_err(|_| OmError::Internal("scope signal closed".to_string()))
}

/// Resolves when the epoch picked by `epoch` moves past `before`, or when the
/// worker goes idle without running that cycle.
async fn wait_for_cycle(
    runtime: &ScopeRuntime,
    before: ScopeSignal,
    epoch: fn(&ScopeSignal) -> u64,
) -> Result<()> {
    let start = epoch(&before);
    let mut receiver = runtime.subscribe();
    receiver
        .wait_for(|signal| !signal.worker_active || epoch(signal) > start)
        .await
        .map(|_| ())
        .map_err(|_| OmError::Internal("scope signal closed".to_string()))
}

fn validate_binding(binding: &OmScopeBinding) -> Result<()> {
    let expected = build_scope_key(
        binding.scope,
        binding.thread_id.as_deref(),
        binding.resource_id.as_deref(),
    )
    .map_err(|err| OmError::Validation(err.to_string()))?;
    if expected == binding.scope_key {
        Ok(())
    } else {
        Err(OmError::Validation(format!(
            "scope key {} does not match its identifiers ({expected})",
            binding.scope_key
        )))
    }
}

fn validate_messages(binding: &OmScopeBinding, messages: &[OmMessage]) -> Result<()> {
    for message in messages {
        if message.id.trim().is_empty() {
            return Err(OmError::Validation(
                "message id must not be blank".to_string(),
            ));
        }
        if binding.scope == OmScope::Thread
            && let (Some(source), Some(thread_id)) =
                (message.source_thread_id.as_deref(), binding.thread_id.as_deref())
            && source.trim() != thread_id
        {
            return Err(OmError::Validation(format!(
                "message {} belongs to thread {source}, not {thread_id}",
                message.id
            )));
        }
    }
    Ok(())
}
