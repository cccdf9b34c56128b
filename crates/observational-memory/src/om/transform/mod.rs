mod activation;
mod helpers;
mod observer;
mod reflection;
mod scope;
mod types;

pub use activation::{
    calculate_dynamic_threshold, merge_activated_observations, merge_observations,
    select_contiguous_chunks,
};
pub use observer::{
    combine_observations_for_buffering, decide_observer_action,
    evaluate_async_observation_interval, filter_messages_by_last_observed_at,
    merge_pending_messages, select_stranded_messages, select_unobserved_messages,
    should_trigger_observer, split_observer_batches,
};
pub use reflection::{
    MAX_COMPRESSION_LEVEL, merge_buffered_reflection, plan_buffered_reflection_slice,
    reflector_compression_guidance, select_reflection_action, should_trigger_reflector,
    validate_reflection_compression,
};
pub use scope::build_scope_key;
pub use types::{
    ActivationBoundary, AsyncObservationIntervalState, BUFFERED_OBSERVATIONS_SEPARATOR,
    BufferedReflectionSlicePlan, ObserverAction, ObserverDecision, ObserverDecisionInput,
    OmTransformError, ReflectionAction, ReflectionDecisionInput,
};

pub(crate) use helpers::{merge_message_ids, normalize_whitespace};

#[cfg(test)]
mod tests;
