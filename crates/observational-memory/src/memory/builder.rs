use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::{DEFAULT_OM_LLM_MODEL, DEFAULT_OM_LLM_PROVIDER, OmEnvConfig};
use crate::context::{ObservationFormatter, XmlObservationFormatter};
use crate::error::{OmError, Result};
use crate::events::{EventBus, OmListener, TracingListener};
use crate::model::{
    DEFAULT_MODEL_TIMEOUT, HttpLanguageModel, LanguageModel, ModelResolver, ModelSettings,
    fixed_model,
};
use crate::observer::Observer;
use crate::om::OmConfigInput;
use crate::reflector::Reflector;
use crate::store::{InMemoryOmStore, OmStore, RecordStore};
use crate::tokens::{TokenAccountant, TokenCounter};

use super::{Inner, ObservationalMemory, ScopeDefaults};

/// Assembles an [`ObservationalMemory`]. Only a language model is required;
/// everything else has a working default.
pub struct ObservationalMemoryBuilder {
    store: Option<Arc<dyn OmStore>>,
    observer_model: Option<Arc<dyn LanguageModel>>,
    reflector_model: Option<Arc<dyn LanguageModel>>,
    tokens: Arc<dyn TokenCounter>,
    config: OmConfigInput,
    observer_resolver: Option<ModelResolver>,
    reflector_resolver: Option<ModelResolver>,
    observer_timeout: Duration,
    reflector_timeout: Duration,
    observer_instructions: Option<String>,
    reflector_instructions: Option<String>,
    max_chars_per_message: Option<usize>,
    formatter: Arc<dyn ObservationFormatter>,
    listeners: Vec<Arc<dyn OmListener>>,
}

impl std::fmt::Debug for ObservationalMemoryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationalMemoryBuilder")
            .field("has_store", &self.store.is_some())
            .field("has_model", &self.observer_model.is_some())
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Default for ObservationalMemoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationalMemoryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: None,
            observer_model: None,
            reflector_model: None,
            tokens: Arc::new(TokenAccountant),
            config: OmConfigInput::default(),
            observer_resolver: None,
            reflector_resolver: None,
            observer_timeout: DEFAULT_MODEL_TIMEOUT,
            reflector_timeout: DEFAULT_MODEL_TIMEOUT,
            observer_instructions: None,
            reflector_instructions: None,
            max_chars_per_message: None,
            formatter: Arc::new(XmlObservationFormatter),
            listeners: Vec::new(),
        }
    }

    /// HTTP models, settings, timeouts, and thresholds from `OM_*` variables.
    pub fn from_env_config(env: &OmEnvConfig) -> Result<Self> {
        let observer = HttpLanguageModel::new(&env.observer.endpoint, env.observer.timeout)?;
        let reflector = HttpLanguageModel::new(&env.reflector.endpoint, env.reflector.timeout)?;
        Ok(Self::new()
            .config(env.om)
            .model(Arc::new(observer))
            .reflector_model(Arc::new(reflector))
            .observer_settings(env.observer.settings.clone())
            .reflector_settings(env.reflector.settings.clone())
            .observer_timeout(env.observer.timeout)
            .reflector_timeout(env.reflector.timeout))
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn OmStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Model used by the observer, and by the reflector unless
    /// [`Self::reflector_model`] is set.
    #[must_use]
    pub fn model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.observer_model = Some(model);
        self
    }

    #[must_use]
    pub fn reflector_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.reflector_model = Some(model);
        self
    }

    #[must_use]
    pub fn token_counter(mut self, tokens: Arc<dyn TokenCounter>) -> Self {
        self.tokens = tokens;
        self
    }

    #[must_use]
    pub const fn config(mut self, config: OmConfigInput) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn observer_settings(self, settings: ModelSettings) -> Self {
        self.observer_resolver(fixed_model(settings))
    }

    #[must_use]
    pub fn reflector_settings(self, settings: ModelSettings) -> Self {
        self.reflector_resolver(fixed_model(settings))
    }

    #[must_use]
    pub fn observer_resolver(mut self, resolver: ModelResolver) -> Self {
        self.observer_resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn reflector_resolver(mut self, resolver: ModelResolver) -> Self {
        self.reflector_resolver = Some(resolver);
        self
    }

    #[must_use]
    pub const fn observer_timeout(mut self, timeout: Duration) -> Self {
        self.observer_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn reflector_timeout(mut self, timeout: Duration) -> Self {
        self.reflector_timeout = timeout;
        self
    }

    #[must_use]
    pub fn observer_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.observer_instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub fn reflector_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.reflector_instructions = Some(instructions.into());
        self
    }

    #[must_use]
    pub const fn max_chars_per_message(mut self, max_chars: usize) -> Self {
        self.max_chars_per_message = Some(max_chars);
        self
    }

    #[must_use]
    pub fn formatter(mut self, formatter: Arc<dyn ObservationFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn OmListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Adds [`TracingListener`] so every cycle event is logged.
    #[must_use]
    pub fn with_tracing(self) -> Self {
        self.listener(Arc::new(TracingListener))
    }

    pub fn build(self) -> Result<ObservationalMemory> {
        let Some(observer_model) = self.observer_model else {
            return Err(OmError::Validation(
                "observational memory needs a language model".to_string(),
            ));
        };
        let reflector_model = self
            .reflector_model
            .unwrap_or_else(|| Arc::clone(&observer_model));
        let defaults = ScopeDefaults::resolve(self.config)?;
        let default_settings =
            || fixed_model(ModelSettings::new(DEFAULT_OM_LLM_PROVIDER, DEFAULT_OM_LLM_MODEL));
        let observer_resolver = self.observer_resolver.unwrap_or_else(default_settings);
        let reflector_resolver = self.reflector_resolver.unwrap_or_else(default_settings);
        let store: Arc<dyn OmStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryOmStore::new()),
        };

        let observer = Observer::new(
            observer_model,
            Arc::clone(&self.tokens),
            observer_resolver,
            self.observer_timeout,
        )
        .with_instructions(self.observer_instructions)
        .with_max_chars_per_message(self.max_chars_per_message);
        let reflector = Reflector::new(
            reflector_model,
            Arc::clone(&self.tokens),
            reflector_resolver,
            self.reflector_timeout,
        )
        .with_instructions(self.reflector_instructions);

        info!(
            message_tokens = defaults.thread.observation.message_tokens_base,
            observation_tokens = defaults.thread.reflection.observation_tokens,
            async_buffering_disabled = defaults.thread.async_buffering_disabled,
            "om: observational memory ready"
        );

        Ok(ObservationalMemory::from_inner(Inner {
            records: RecordStore::new(store),
            tokens: self.tokens,
            observer,
            reflector,
            events: EventBus::new(self.listeners),
            formatter: self.formatter,
            defaults,
            overrides: DashMap::new(),
            runtimes: DashMap::new(),
            shutting_down: AtomicBool::new(false),
        }))
    }
}
