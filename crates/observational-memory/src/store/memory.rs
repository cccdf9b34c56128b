use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{OmError, Result};
use crate::om::{OmMessage, OmRecord};

use super::{OmStore, sort_messages};

#[derive(Debug, Default)]
pub struct InMemoryOmStore {
    records: Mutex<HashMap<String, OmRecord>>,
    messages: Mutex<HashMap<String, HashMap<String, OmMessage>>>,
}

impl InMemoryOmStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_count(&self, scope_key: &str) -> Result<usize> {
        let messages = self
            .messages
            .lock()
            .map_err(|_| OmError::mutex_poisoned("om messages"))?;
        Ok(messages.get(scope_key).map_or(0, HashMap::len))
    }
}

#[async_trait]
impl OmStore for InMemoryOmStore {
    async fn get_record(&self, scope_key: &str) -> Result<Option<OmRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| OmError::mutex_poisoned("om records"))?;
        Ok(records.get(scope_key).cloned())
    }

    async fn save_record(&self, record: &OmRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| OmError::mutex_poisoned("om records"))?;
        records.insert(record.scope_key.clone(), record.clone());
        Ok(())
    }

    async fn save_messages(&self, scope_key: &str, messages: &[OmMessage]) -> Result<()> {
        let mut stored = self
            .messages
            .lock()
            .map_err(|_| OmError::mutex_poisoned("om messages"))?;
        let scope = stored.entry(scope_key.to_string()).or_default();
        for message in messages {
            scope
                .entry(message.id.clone())
                .or_insert_with(|| message.clone());
        }
        Ok(())
    }

    async fn list_unobserved_messages(
        &self,
        scope_key: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OmMessage>> {
        let stored = self
            .messages
            .lock()
            .map_err(|_| OmError::mutex_poisoned("om messages"))?;
        let mut messages = stored
            .get(scope_key)
            .map(|scope| {
                scope
                    .values()
                    .filter(|message| since.is_none_or(|cutoff| message.created_at > cutoff))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        drop(stored);
        sort_messages(&mut messages);
        Ok(messages)
    }
}
