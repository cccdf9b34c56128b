//! Condenses accumulated observation text with an escalating retry ladder.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{OmError, OmInferenceFailureKind, OmInferenceSource, Result};
use crate::model::{
    LanguageModel, ModelPrompt, ModelRequestContext, ModelResolver, generate_with_timeout,
};
use crate::om::{
    MAX_COMPRESSION_LEVEL, OmReflectorPromptInput, OmScope, build_reflector_system_prompt,
    build_reflector_user_prompt, parse_memory_section_xml_accuracy_first,
    validate_reflection_compression,
};
use crate::tokens::TokenCounter;

#[derive(Debug, Clone, Copy)]
pub struct ReflectorInput<'a> {
    pub scope: OmScope,
    pub scope_key: &'a str,
    pub generation_count: u32,
    pub observations: &'a str,
    pub observation_tokens: u32,
    /// The result is accepted outright once it is strictly below this.
    pub target_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectorOutput {
    pub observations: String,
    pub observation_tokens: u32,
    pub compression_level: u8,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
}

pub struct Reflector {
    model: Arc<dyn LanguageModel>,
    tokens: Arc<dyn TokenCounter>,
    resolver: ModelResolver,
    timeout: Duration,
    instructions: Option<String>,
}

impl std::fmt::Debug for Reflector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reflector")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Reflector {
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
        }
    }

    #[must_use]
    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    /// Model failures abort the ladder. A ladder that never reaches the
    /// target still succeeds when its best attempt is smaller than the input.
    pub async fn reflect(&self, input: ReflectorInput<'_>) -> Result<ReflectorOutput> {
        if input.observations.trim().is_empty() {
            return Err(OmError::Validation(
                "reflector needs observations to condense".to_string(),
            ));
        }
        let settings = (self.resolver)(&ModelRequestContext {
            source: OmInferenceSource::Reflector,
            scope: input.scope,
            scope_key: input.scope_key,
            generation_count: input.generation_count,
            input_tokens: input.observation_tokens,
        });
        let system = build_reflector_system_prompt(input.scope, self.instructions.as_deref());

        let mut best: Option<ReflectorOutput> = None;
        for level in 0..=MAX_COMPRESSION_LEVEL {
            let user = build_reflector_user_prompt(OmReflectorPromptInput {
                observations: input.observations,
                extra_instructions: None,
                compression_level: level,
                target_tokens: Some(input.target_tokens),
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
                OmInferenceSource::Reflector,
            )
            .await?;

            let section = parse_memory_section_xml_accuracy_first(&raw);
            if !section.has_observations() {
                warn!(
                    scope_key = input.scope_key,
                    level, "om reflector returned no observations"
                );
                continue;
            }
            let attempt = ReflectorOutput {
                observation_tokens: self.tokens.count_text(&section.observations),
                observations: section.observations,
                compression_level: level,
                current_task: section.current_task,
                suggested_response: section.suggested_response,
            };
            debug!(
                scope_key = input.scope_key,
                level,
                tokens = attempt.observation_tokens,
                target = input.target_tokens,
                "om reflector attempt"
            );
            if validate_reflection_compression(attempt.observation_tokens, input.target_tokens) {
                return Ok(attempt);
            }
            if best
                .as_ref()
                .is_none_or(|current| attempt.observation_tokens < current.observation_tokens)
            {
                best = Some(attempt);
            }
        }

        match best {
            Some(best) if best.observation_tokens < input.observation_tokens => Ok(best),
            Some(best) => Err(OmError::reflector(
                OmInferenceFailureKind::Schema,
                format!(
                    "reflection did not shrink observations: {} >= {} tokens",
                    best.observation_tokens, input.observation_tokens
                ),
            )),
            None => Err(OmError::reflector(
                OmInferenceFailureKind::Schema,
                "reflector output contained no observations",
            )),
        }
    }
}
