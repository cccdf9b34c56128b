mod formatter;
mod system;
mod user;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmObserverPromptInput<'a> {
    pub existing_observations: Option<&'a str>,
    pub message_history: &'a str,
    pub extra_instructions: Option<&'a str>,
    pub skip_continuation_hints: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmReflectorPromptInput<'a> {
    pub observations: &'a str,
    pub extra_instructions: Option<&'a str>,
    pub compression_level: u8,
    pub target_tokens: Option<u32>,
}

pub use formatter::{format_observer_messages_for_prompt, format_thread_grouped_messages_for_prompt};
pub use system::{build_observer_system_prompt, build_reflector_system_prompt};
pub use user::{build_observer_user_prompt, build_reflector_user_prompt};
