#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tokio::sync::Semaphore;

use observational_memory::error::{OmError, Result};
use observational_memory::events::{OmEvent, OmListener};
use observational_memory::model::{LanguageModel, ModelError, ModelPrompt, ModelSettings};
use observational_memory::om::{
    BufferTokensInput, ObservationConfigInput, OmConfigInput, OmMessage, OmRecord,
    ReflectionConfigInput,
};
use observational_memory::store::OmStore;
use observational_memory::tokens::TokenCounter;

/// One token per character, no per-message overhead, so tests can size
/// messages exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokens;

impl TokenCounter for CharTokens {
    fn count_text(&self, text: &str) -> u32 {
        u32::try_from(text.chars().count()).unwrap_or(u32::MAX)
    }

    fn count_message(&self, message: &OmMessage) -> u32 {
        self.count_text(&message.text)
    }
}

pub fn ts(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(seconds)
}

/// A message whose text is exactly `tokens` characters under [`CharTokens`].
pub fn sized_message(id: &str, second: i64, tokens: usize) -> OmMessage {
    let mut text = format!("{id}:");
    while text.len() < tokens {
        text.push('x');
    }
    text.truncate(tokens);
    OmMessage::new(id, "user", text, ts(second))
}

pub fn observations_reply(lines: &[&str]) -> String {
    format!("<observations>\n{}\n</observations>", lines.join("\n"))
}

/// Thresholds with async buffering switched off.
pub fn thresholds(message_tokens: u32, observation_tokens: u32) -> OmConfigInput {
    OmConfigInput {
        observation: ObservationConfigInput {
            message_tokens: Some(message_tokens),
            buffer_tokens: Some(BufferTokensInput::Disabled),
            ..ObservationConfigInput::default()
        },
        reflection: ReflectionConfigInput {
            observation_tokens: Some(observation_tokens),
            ..ReflectionConfigInput::default()
        },
        ..OmConfigInput::default()
    }
}

/// Replies in order; once the script runs out every call answers with a
/// numbered note.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<std::result::Result<String, ModelError>>>,
    prompts: Mutex<Vec<ModelPrompt>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn echo() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_replies(
        replies: impl IntoIterator<Item = std::result::Result<String, ModelError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<ModelPrompt> {
        self.prompts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(
        &self,
        prompt: &ModelPrompt,
        _settings: &ModelSettings,
    ) -> std::result::Result<String, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().expect("lock").push(prompt.clone());
        let scripted = self.replies.lock().expect("lock").pop_front();
        scripted.unwrap_or_else(|| Ok(observations_reply(&[&format!("- note {call}")])))
    }
}

/// Holds every call until [`GatedModel::release`] hands out permits, and
/// records the highest number of calls in flight at once.
pub struct GatedModel {
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
    prompts: Mutex<Vec<ModelPrompt>>,
}

impl GatedModel {
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn release(&self, permits: usize) {
        self.gate.add_permits(permits);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<ModelPrompt> {
        self.prompts.lock().expect("lock").clone()
    }
}

#[async_trait]
impl LanguageModel for GatedModel {
    async fn generate(
        &self,
        prompt: &ModelPrompt,
        _settings: &ModelSettings,
    ) -> std::result::Result<String, ModelError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().expect("lock").push(prompt.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let permit = self.gate.acquire().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        permit
            .map_err(|_| ModelError::fatal("gate closed"))?
            .forget();
        Ok(observations_reply(&[&format!("- gated note {call}")]))
    }
}

/// Every operation fails as if the database were unreachable.
#[derive(Debug, Default)]
pub struct UnavailableStore;

#[async_trait]
impl OmStore for UnavailableStore {
    async fn get_record(&self, _scope_key: &str) -> Result<Option<OmRecord>> {
        Err(OmError::storage("database unreachable"))
    }

    async fn save_record(&self, _record: &OmRecord) -> Result<()> {
        Err(OmError::storage("database unreachable"))
    }

    async fn save_messages(&self, _scope_key: &str, _messages: &[OmMessage]) -> Result<()> {
        Err(OmError::storage("database unreachable"))
    }

    async fn list_unobserved_messages(
        &self,
        _scope_key: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<OmMessage>> {
        Err(OmError::storage("database unreachable"))
    }
}

#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<OmEvent>>>,
}

impl EventLog {
    pub fn listener(&self) -> Arc<dyn OmListener> {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &OmEvent| {
            events.lock().expect("lock").push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<OmEvent> {
        self.events.lock().expect("lock").clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(OmEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.names().iter().filter(|seen| **seen == name).count()
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
