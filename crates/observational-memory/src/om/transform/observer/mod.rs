mod candidates;
mod context;
mod decision;

pub use candidates::{
    filter_messages_by_last_observed_at, merge_pending_messages, select_stranded_messages,
    select_unobserved_messages, split_observer_batches,
};
pub use context::combine_observations_for_buffering;
pub use decision::{
    decide_observer_action, evaluate_async_observation_interval, should_trigger_observer,
};
