//! Pure observational-memory contracts: record model, threshold config,
//! trigger transforms, prompts, and model-output parsing. Nothing in here
//! performs I/O.

mod config;
mod model;
mod parse;
mod prompt;
mod transform;
pub(crate) mod xml;

pub use config::{
    BufferTokensInput, DEFAULT_BLOCK_AFTER_MULTIPLIER, DEFAULT_OBSERVER_BUFFER_ACTIVATION,
    DEFAULT_OBSERVER_BUFFER_TOKENS_RATIO, DEFAULT_OBSERVER_MAX_TOKENS_PER_BATCH,
    DEFAULT_OBSERVER_MESSAGE_TOKENS, DEFAULT_REFLECTOR_BUFFER_ACTIVATION,
    DEFAULT_REFLECTOR_OBSERVATION_TOKENS, ObservationConfigInput, OmConfigError, OmConfigInput,
    ReflectionConfigInput, ResolvedObservationConfig, ResolvedOmConfig, ResolvedReflectionConfig,
    resolve_om_config,
};
pub use model::{
    OmMessage, OmObservationChunk, OmOriginType, OmRecord, OmScope, OmScopeBinding,
};
pub use parse::{
    OmMemorySection, OmParseMode, extract_list_items_only, parse_memory_section_xml,
    parse_memory_section_xml_accuracy_first,
};
pub use prompt::{
    OmObserverPromptInput, OmReflectorPromptInput, build_observer_system_prompt,
    build_observer_user_prompt, build_reflector_system_prompt, build_reflector_user_prompt,
    format_observer_messages_for_prompt, format_thread_grouped_messages_for_prompt,
};
pub use transform::{
    ActivationBoundary, AsyncObservationIntervalState, BUFFERED_OBSERVATIONS_SEPARATOR,
    BufferedReflectionSlicePlan, MAX_COMPRESSION_LEVEL, ObserverAction, ObserverDecision,
    ObserverDecisionInput, OmTransformError, ReflectionAction, ReflectionDecisionInput,
    build_scope_key, calculate_dynamic_threshold, combine_observations_for_buffering,
    decide_observer_action, evaluate_async_observation_interval,
    filter_messages_by_last_observed_at, merge_activated_observations, merge_buffered_reflection,
    merge_observations, merge_pending_messages, plan_buffered_reflection_slice,
    reflector_compression_guidance, select_contiguous_chunks, select_reflection_action,
    select_stranded_messages, select_unobserved_messages, should_trigger_observer,
    should_trigger_reflector, split_observer_batches, validate_reflection_compression,
};
pub(crate) use transform::{merge_message_ids, normalize_whitespace};
