//! Turns a window of unobserved messages into observation text.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{OmError, OmInferenceFailureKind, OmInferenceSource, Result};
use crate::model::{
    LanguageModel, ModelPrompt, ModelRequestContext, ModelResolver, generate_with_timeout,
};
use crate::om::{
    OmMessage, OmObserverPromptInput, OmScope, build_observer_system_prompt,
    build_observer_user_prompt, format_observer_messages_for_prompt,
    format_thread_grouped_messages_for_prompt, merge_observations,
    parse_memory_section_xml_accuracy_first, split_observer_batches,
};
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy)]
pub struct ObserverInput<'a> {
    pub scope: OmScope,
    pub scope_key: &'a str,
    pub generation_count: u32,
    pub active_observations: &'a str,
    /// Ordered by `(created_at, id)`.
    pub messages: &'a [OmMessage],
    pub max_tokens_per_batch: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverOutput {
    /// Only the text produced by this call; callers append it.
    pub observations: String,
    pub observation_tokens: u32,
    pub message_tokens: u32,
    pub message_ids: Vec<String>,
    pub last_observed_at: DateTime<Utc>,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
    pub batches: usize,
}

pub struct Observer {
    model: Arc<dyn LanguageModel>,
    tokens: Arc<dyn TokenCounter>,
    resolver: ModelResolver,
    timeout: Duration,
    instructions: Option<String>,
    max_chars_per_message: Option<usize>,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("timeout", &self.timeout)
            .field("max_chars_per_message", &self.max_chars_per_message)
            .finish_non_exhaustive()
    }
}

impl Observer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tokens: Arc<dyn TokenCounter>,
        resolver: ModelResolver,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            tokens,
            resolver,
            timeout,
            instructions: None,
            max_chars_per_message: None,
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    #[must_use]
    pub const fn with_max_chars_per_message(mut self, max_chars: Option<usize>) -> Self {
        self.max_chars_per_message = max_chars;
        self
    }

    pub async fn observe(&self, input: ObserverInput<'_>) -> Result<ObserverOutput> {
        let Some(last) = input.messages.last() else {
            return Err(OmError::Validation(
                "observer needs at least one message".to_string(),
            ));
        };
        let last_observed_at = last.created_at;
        let message_tokens = self.tokens.count_messages(input.messages);
        let settings = (self.resolver)(&ModelRequestContext {
            source: OmInferenceSource::Observer,
            scope: input.scope,
            scope_key: input.scope_key,
            generation_count: input.generation_count,
            input_tokens: message_tokens,
        });
        let system = build_observer_system_prompt(input.scope, self.instructions.as_deref());
        let batches = split_observer_batches(
            input.messages,
            input.max_tokens_per_batch,
            |message| self.tokens.count_message(message),
        );
        let batch_count = batches.len();

        let mut produced = String::new();
        let mut current_task = None;
        let mut suggested_response = None;
        for (index, batch) in batches.iter().enumerate() {
            let is_last = index + 1 == batch_count;
            let history = match input.scope {
                OmScope::Thread => {
                    format_observer_messages_for_prompt(batch, self.max_chars_per_message)
                }
                OmScope::Resource => {
                    format_thread_grouped_messages_for_prompt(batch, self.max_chars_per_message)
                }
            };
            let existing = merge_observations(input.active_observations, &produced);
            let user = build_observer_user_prompt(OmObserverPromptInput {
                existing_observations: Some(existing.as_str()),
                message_history: &history,
                extra_instructions: None,
                skip_continuation_hints: !is_last,
            });
            let prompt = ModelPrompt {
                system: system.clone(),
                user,
            };
            let raw = generate_with_timeout(
                self.model.as_ref(),
                &prompt,
                &settings,
                self.timeout,
                OmInferenceSource::Observer,
            )
            .await?;

            let section = parse_memory_section_xml_accuracy_first(&raw);
            if !section.has_observations() {
                return Err(OmError::observer(
                    OmInferenceFailureKind::Schema,
                    format!(
                        "batch {}/{batch_count} returned no observations",
                        index + 1
                    ),
                ));
            }
            produced = merge_observations(&produced, &section.observations);
            current_task = section.current_task.or(current_task);
            suggested_response = section.suggested_response.or(suggested_response);
            debug!(
                scope_key = input.scope_key,
                batch = index + 1,
                batch_count,
                messages = batch.len(),
                "om observer batch parsed"
            );
        }

        Ok(ObserverOutput {
            observation_tokens: self.tokens.count_text(&produced),
            observations: produced,
            message_tokens,
            message_ids: input
                .messages
                .iter()
                .map(|message| message.id.clone())
                .collect(),
            last_observed_at,
            current_task,
            suggested_response,
            batches: batch_count,
        })
    }
}
