//! `OM_*` environment overrides for thresholds and model endpoints.

mod env;

use std::time::Duration;

use crate::error::{OmError, Result};
use crate::model::ModelSettings;
use crate::om::{
    ObservationConfigInput, OmConfigInput, OmScope, ReflectionConfigInput, ResolvedOmConfig,
    resolve_om_config,
};

use env::{
    parse_env_bool, parse_env_buffer_tokens_optional, parse_env_f32_optional,
    parse_env_u16_optional, parse_env_u32_optional, parse_env_u64_optional, read_non_empty_env,
};

const ENV_OM_SCOPE: &str = "OM_SCOPE";
const ENV_OM_MESSAGE_TOKENS: &str = "OM_MESSAGE_TOKENS";
const ENV_OM_OBSERVER_MAX_TOKENS_PER_BATCH: &str = "OM_OBSERVER_MAX_TOKENS_PER_BATCH";
const ENV_OM_OBSERVER_BUFFER_ACTIVATION: &str = "OM_OBSERVER_BUFFER_ACTIVATION";
const ENV_OM_OBSERVER_BLOCK_AFTER: &str = "OM_OBSERVER_BLOCK_AFTER";
const ENV_OM_BUFFER_TOKENS: &str = "OM_BUFFER_TOKENS";
const ENV_OM_SHARE_TOKEN_BUDGET: &str = "OM_SHARE_TOKEN_BUDGET";
const ENV_OM_REFLECTOR_OBSERVATION_TOKENS: &str = "OM_REFLECTOR_OBSERVATION_TOKENS";
const ENV_OM_REFLECTOR_BUFFER_ACTIVATION: &str = "OM_REFLECTOR_BUFFER_ACTIVATION";
const ENV_OM_REFLECTOR_BLOCK_AFTER: &str = "OM_REFLECTOR_BLOCK_AFTER";
const ENV_OM_LLM_PROVIDER: &str = "OM_LLM_PROVIDER";
const ENV_OM_OBSERVER_LLM_ENDPOINT: &str = "OM_OBSERVER_LLM_ENDPOINT";
const ENV_OM_OBSERVER_LLM_MODEL: &str = "OM_OBSERVER_LLM_MODEL";
const ENV_OM_OBSERVER_LLM_TIMEOUT_MS: &str = "OM_OBSERVER_LLM_TIMEOUT_MS";
const ENV_OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS: &str = "OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS";
const ENV_OM_OBSERVER_LLM_TEMPERATURE_MILLI: &str = "OM_OBSERVER_LLM_TEMPERATURE_MILLI";
const ENV_OM_REFLECTOR_LLM_ENDPOINT: &str = "OM_REFLECTOR_LLM_ENDPOINT";
const ENV_OM_REFLECTOR_LLM_MODEL: &str = "OM_REFLECTOR_LLM_MODEL";
const ENV_OM_REFLECTOR_LLM_TIMEOUT_MS: &str = "OM_REFLECTOR_LLM_TIMEOUT_MS";
const ENV_OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS: &str = "OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS";
const ENV_OM_REFLECTOR_LLM_TEMPERATURE_MILLI: &str = "OM_REFLECTOR_LLM_TEMPERATURE_MILLI";

pub const DEFAULT_OM_LLM_PROVIDER: &str = "ollama";
pub const DEFAULT_OM_LLM_ENDPOINT: &str = "http://127.0.0.1:11434/api/chat";
pub const DEFAULT_OM_LLM_MODEL: &str = "qwen2.5:7b-instruct";
const DEFAULT_OM_OBSERVER_LLM_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_OM_REFLECTOR_LLM_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS: u32 = 1_200;
const DEFAULT_OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS: u32 = 4_000;
const DEFAULT_OM_LLM_TEMPERATURE_MILLI: u16 = 0;

/// Unparsed environment values. Kept separate from parsing so tests never
/// have to touch the process environment.
#[derive(Debug, Clone, Default)]
pub struct RawOmEnv {
    pub scope: Option<String>,
    pub message_tokens: Option<String>,
    pub observer_max_tokens_per_batch: Option<String>,
    pub observer_buffer_activation: Option<String>,
    pub observer_block_after: Option<String>,
    pub buffer_tokens: Option<String>,
    pub share_token_budget: Option<String>,
    pub reflector_observation_tokens: Option<String>,
    pub reflector_buffer_activation: Option<String>,
    pub reflector_block_after: Option<String>,
    pub llm_provider: Option<String>,
    pub observer_llm: RawModelEnv,
    pub reflector_llm: RawModelEnv,
}

#[derive(Debug, Clone, Default)]
pub struct RawModelEnv {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: Option<String>,
    pub max_output_tokens: Option<String>,
    pub temperature_milli: Option<String>,
}

impl RawOmEnv {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            scope: read_non_empty_env(ENV_OM_SCOPE),
            message_tokens: read_non_empty_env(ENV_OM_MESSAGE_TOKENS),
            observer_max_tokens_per_batch: read_non_empty_env(
                ENV_OM_OBSERVER_MAX_TOKENS_PER_BATCH,
            ),
            observer_buffer_activation: read_non_empty_env(ENV_OM_OBSERVER_BUFFER_ACTIVATION),
            observer_block_after: read_non_empty_env(ENV_OM_OBSERVER_BLOCK_AFTER),
            buffer_tokens: read_non_empty_env(ENV_OM_BUFFER_TOKENS),
            share_token_budget: read_non_empty_env(ENV_OM_SHARE_TOKEN_BUDGET),
            reflector_observation_tokens: read_non_empty_env(ENV_OM_REFLECTOR_OBSERVATION_TOKENS),
            reflector_buffer_activation: read_non_empty_env(ENV_OM_REFLECTOR_BUFFER_ACTIVATION),
            reflector_block_after: read_non_empty_env(ENV_OM_REFLECTOR_BLOCK_AFTER),
            llm_provider: read_non_empty_env(ENV_OM_LLM_PROVIDER),
            observer_llm: RawModelEnv {
                endpoint: read_non_empty_env(ENV_OM_OBSERVER_LLM_ENDPOINT),
                model: read_non_empty_env(ENV_OM_OBSERVER_LLM_MODEL),
                timeout_ms: read_non_empty_env(ENV_OM_OBSERVER_LLM_TIMEOUT_MS),
                max_output_tokens: read_non_empty_env(ENV_OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS),
                temperature_milli: read_non_empty_env(ENV_OM_OBSERVER_LLM_TEMPERATURE_MILLI),
            },
            reflector_llm: RawModelEnv {
                endpoint: read_non_empty_env(ENV_OM_REFLECTOR_LLM_ENDPOINT),
                model: read_non_empty_env(ENV_OM_REFLECTOR_LLM_MODEL),
                timeout_ms: read_non_empty_env(ENV_OM_REFLECTOR_LLM_TIMEOUT_MS),
                max_output_tokens: read_non_empty_env(ENV_OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS),
                temperature_milli: read_non_empty_env(ENV_OM_REFLECTOR_LLM_TEMPERATURE_MILLI),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEnvConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub settings: ModelSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OmEnvConfig {
    pub om: OmConfigInput,
    pub observer: ModelEnvConfig,
    pub reflector: ModelEnvConfig,
}

impl OmEnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_raw(&RawOmEnv::from_env())
    }

    pub fn from_raw(raw: &RawOmEnv) -> Result<Self> {
        let scope = match raw.scope.as_deref().map(str::trim) {
            None | Some("") => OmScope::Thread,
            Some(value) => OmScope::parse(&value.to_ascii_lowercase()).ok_or_else(|| {
                OmError::Validation(format!(
                    "{ENV_OM_SCOPE} must be thread|resource, got: {value}"
                ))
            })?,
        };
        let om = OmConfigInput {
            scope,
            share_token_budget: parse_env_bool(raw.share_token_budget.as_deref()),
            observation: ObservationConfigInput {
                message_tokens: parse_env_u32_optional(
                    raw.message_tokens.as_deref(),
                    ENV_OM_MESSAGE_TOKENS,
                )?,
                max_tokens_per_batch: parse_env_u32_optional(
                    raw.observer_max_tokens_per_batch.as_deref(),
                    ENV_OM_OBSERVER_MAX_TOKENS_PER_BATCH,
                )?,
                buffer_tokens: parse_env_buffer_tokens_optional(
                    raw.buffer_tokens.as_deref(),
                    ENV_OM_BUFFER_TOKENS,
                )?,
                buffer_activation: parse_env_f32_optional(
                    raw.observer_buffer_activation.as_deref(),
                    ENV_OM_OBSERVER_BUFFER_ACTIVATION,
                )?,
                block_after: parse_env_f32_optional(
                    raw.observer_block_after.as_deref(),
                    ENV_OM_OBSERVER_BLOCK_AFTER,
                )?,
            },
            reflection: ReflectionConfigInput {
                observation_tokens: parse_env_u32_optional(
                    raw.reflector_observation_tokens.as_deref(),
                    ENV_OM_REFLECTOR_OBSERVATION_TOKENS,
                )?,
                buffer_activation: parse_env_f32_optional(
                    raw.reflector_buffer_activation.as_deref(),
                    ENV_OM_REFLECTOR_BUFFER_ACTIVATION,
                )?,
                block_after: parse_env_f32_optional(
                    raw.reflector_block_after.as_deref(),
                    ENV_OM_REFLECTOR_BLOCK_AFTER,
                )?,
            },
        };

        let provider = raw
            .llm_provider
            .clone()
            .unwrap_or_else(|| DEFAULT_OM_LLM_PROVIDER.to_string());
        let observer = model_env_config(
            &raw.observer_llm,
            &provider,
            ModelEnvDefaults {
                timeout_ms: DEFAULT_OM_OBSERVER_LLM_TIMEOUT_MS,
                max_output_tokens: DEFAULT_OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS,
            },
            ModelEnvNames {
                timeout_ms: ENV_OM_OBSERVER_LLM_TIMEOUT_MS,
                max_output_tokens: ENV_OM_OBSERVER_LLM_MAX_OUTPUT_TOKENS,
                temperature_milli: ENV_OM_OBSERVER_LLM_TEMPERATURE_MILLI,
            },
        )?;
        let reflector = model_env_config(
            &raw.reflector_llm,
            &provider,
            ModelEnvDefaults {
                timeout_ms: DEFAULT_OM_REFLECTOR_LLM_TIMEOUT_MS,
                max_output_tokens: DEFAULT_OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS,
            },
            ModelEnvNames {
                timeout_ms: ENV_OM_REFLECTOR_LLM_TIMEOUT_MS,
                max_output_tokens: ENV_OM_REFLECTOR_LLM_MAX_OUTPUT_TOKENS,
                temperature_milli: ENV_OM_REFLECTOR_LLM_TEMPERATURE_MILLI,
            },
        )?;

        Ok(Self {
            om,
            observer,
            reflector,
        })
    }

    /// Resolves the threshold input, surfacing config problems as validation
    /// failures that name the offending field.
    pub fn resolve(&self) -> Result<ResolvedOmConfig> {
        resolve_om_config(self.om).map_err(OmError::from)
    }
}

struct ModelEnvDefaults {
    timeout_ms: u64,
    max_output_tokens: u32,
}

struct ModelEnvNames {
    timeout_ms: &'static str,
    max_output_tokens: &'static str,
    temperature_milli: &'static str,
}

fn model_env_config(
    raw: &RawModelEnv,
    provider: &str,
    defaults: ModelEnvDefaults,
    names: ModelEnvNames,
) -> Result<ModelEnvConfig> {
    let timeout_ms = parse_env_u64_optional(raw.timeout_ms.as_deref(), names.timeout_ms)?
        .unwrap_or(defaults.timeout_ms);
    let max_output_tokens =
        parse_env_u32_optional(raw.max_output_tokens.as_deref(), names.max_output_tokens)?
            .unwrap_or(defaults.max_output_tokens);
    let temperature_milli =
        parse_env_u16_optional(raw.temperature_milli.as_deref(), names.temperature_milli)?
            .unwrap_or(DEFAULT_OM_LLM_TEMPERATURE_MILLI);
    let model = raw
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_OM_LLM_MODEL.to_string());

    Ok(ModelEnvConfig {
        endpoint: raw
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_OM_LLM_ENDPOINT.to_string()),
        timeout: Duration::from_millis(timeout_ms),
        settings: ModelSettings::new(provider, model)
            .with_max_output_tokens(max_output_tokens)
            .with_temperature_milli(temperature_milli),
    })
}
