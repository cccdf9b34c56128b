//! Record persistence: the storage contract, per-scope serialization, and
//! the bundled adapters.

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{OmError, Result};
use crate::om::{OmMessage, OmRecord, OmScopeBinding, merge_pending_messages};

pub use memory::InMemoryOmStore;
pub use sqlite::SqliteOmStore;

/// Storage collaborator. Messages are keyed by `(scope_key, id)`; saving a
/// message that already exists is a no-op.
#[async_trait]
pub trait OmStore: Send + Sync {
    async fn get_record(&self, scope_key: &str) -> Result<Option<OmRecord>>;

    async fn save_record(&self, record: &OmRecord) -> Result<()>;

    async fn save_messages(&self, scope_key: &str, messages: &[OmMessage]) -> Result<()>;

    /// Messages with `created_at > since` (all when `since` is `None`),
    /// ordered by `(created_at, id)`.
    async fn list_unobserved_messages(
        &self,
        scope_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OmMessage>>;
}

/// Proof that the caller holds the per-scope lock.
#[derive(Debug)]
pub struct ScopeLease {
    scope_key: String,
    _guard: OwnedMutexGuard<()>,
}

impl ScopeLease {
    #[must_use]
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }
}

/// Serializes record read-modify-write per scope. Unrelated scopes use
/// unrelated mutexes and never wait on each other.
pub struct RecordStore {
    backend: Arc<dyn OmStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("scopes", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    pub fn new(backend: Arc<dyn OmStore>) -> Self {
        Self {
            backend,
            locks: DashMap::new(),
        }
    }

    pub async fn lock(&self, scope_key: &str) -> ScopeLease {
        let mutex = self
            .locks
            .entry(scope_key.to_string())
            .or_default()
            .value()
            .clone();
        ScopeLease {
            scope_key: scope_key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    pub async fn get_or_create(
        &self,
        lease: &ScopeLease,
        binding: &OmScopeBinding,
    ) -> Result<OmRecord> {
        ensure_lease(lease, &binding.scope_key)?;
        if let Some(record) = self.backend.get_record(&binding.scope_key).await? {
            return Ok(record);
        }
        let record = OmRecord::new(binding, Utc::now());
        self.backend.save_record(&record).await?;
        debug!(scope_key = %record.scope_key, record_id = %record.id, "om record created");
        Ok(record)
    }

    /// Unlocked read; may observe a record mid-cycle but never a torn one.
    pub async fn get(&self, scope_key: &str) -> Result<Option<OmRecord>> {
        self.backend.get_record(scope_key).await
    }

    pub async fn save(&self, lease: &ScopeLease, record: &mut OmRecord) -> Result<()> {
        ensure_lease(lease, &record.scope_key)?;
        record.updated_at = Utc::now();
        self.backend.save_record(record).await?;
        debug!(
            scope_key = %record.scope_key,
            pending = record.pending_message_tokens,
            observation_tokens = record.observation_token_count,
            generation = record.generation_count,
            "om record saved"
        );
        Ok(())
    }

    pub async fn save_messages(
        &self,
        lease: &ScopeLease,
        messages: &[OmMessage],
    ) -> Result<()> {
        self.backend
            .save_messages(lease.scope_key(), messages)
            .await
    }

    pub async fn list_unobserved(
        &self,
        scope_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OmMessage>> {
        self.backend.list_unobserved_messages(scope_key, since).await
    }

    /// Everything `record` has not folded yet: its carried messages plus the
    /// stored ones after its cutoff.
    pub async fn pending_messages(&self, record: &OmRecord) -> Result<Vec<OmMessage>> {
        let listed = self
            .list_unobserved(&record.scope_key, record.last_observed_at)
            .await?;
        Ok(merge_pending_messages(&record.carried_messages, listed))
    }
}

fn ensure_lease(lease: &ScopeLease, scope_key: &str) -> Result<()> {
    if lease.scope_key == scope_key {
        Ok(())
    } else {
        Err(OmError::Validation(format!(
            "scope lease mismatch: held {}, requested {scope_key}",
            lease.scope_key
        )))
    }
}

fn sort_messages(messages: &mut [OmMessage]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
