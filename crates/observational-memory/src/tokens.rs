//! Cheap, deterministic token estimation.

use crate::om::OmMessage;

pub const APPROX_CHARS_PER_TOKEN: u32 = 4;
/// Role framing added per message on top of its text.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

#[must_use]
pub fn estimate_text_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    chars.div_ceil(APPROX_CHARS_PER_TOKEN)
}

/// Token accounting used for every threshold decision. Implementations must
/// be pure: the same input always yields the same count.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> u32;

    fn count_message(&self, message: &OmMessage) -> u32 {
        self.count_text(&message.text)
            .saturating_add(MESSAGE_OVERHEAD_TOKENS)
    }

    fn count_messages(&self, messages: &[OmMessage]) -> u32 {
        messages.iter().fold(0u32, |total, message| {
            total.saturating_add(self.count_message(message))
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenAccountant;

impl TokenCounter for TokenAccountant {
    fn count_text(&self, text: &str) -> u32 {
        estimate_text_tokens(text)
    }
}
