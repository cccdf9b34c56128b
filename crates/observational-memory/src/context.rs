//! Turns a scope's memory into what the next model call sees: a rendered
//! observation block plus the messages that block does not cover yet.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::memory::ObservationalMemory;
use crate::om::xml::escape_xml_text;
use crate::om::{
    OmMessage, OmRecord, OmScopeBinding, filter_messages_by_last_observed_at, merge_pending_messages,
    normalize_whitespace,
};

pub const OBSERVATION_HINT_PREFIX: &str = "om:";

/// Renders a record for injection into a system prompt.
pub trait ObservationFormatter: Send + Sync {
    /// `None` means there is nothing worth injecting.
    fn format(&self, record: &OmRecord) -> Option<String>;
}

/// Default block:
///
/// ```text
/// <observational-memory>
/// <observations>...</observations>
/// <current-task>...</current-task>
/// <suggested-response>...</suggested-response>
/// </observational-memory>
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlObservationFormatter;

impl ObservationFormatter for XmlObservationFormatter {
    fn format(&self, record: &OmRecord) -> Option<String> {
        let observations = record.active_observations.trim();
        if observations.is_empty() {
            return None;
        }
        let mut block = String::from("<observational-memory>\n<observations>\n");
        block.push_str(&escape_xml_text(observations));
        block.push_str("\n</observations>\n");
        for (tag, value) in [
            ("current-task", record.current_task.as_deref()),
            ("suggested-response", record.suggested_response.as_deref()),
        ] {
            let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
                continue;
            };
            block.push_str(&format!("<{tag}>{}</{tag}>\n", escape_xml_text(value)));
        }
        block.push_str("</observational-memory>");
        Some(block)
    }
}

/// Single-line hint built from the newest observation lines, for callers
/// with a tight prompt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintObservationFormatter {
    pub max_lines: usize,
    pub max_chars: usize,
}

impl HintObservationFormatter {
    #[must_use]
    pub const fn new(max_lines: usize, max_chars: usize) -> Self {
        Self {
            max_lines,
            max_chars,
        }
    }
}

impl ObservationFormatter for HintObservationFormatter {
    fn format(&self, record: &OmRecord) -> Option<String> {
        bounded_observation_hint(&record.active_observations, self.max_lines, self.max_chars)
    }
}

#[must_use]
pub fn bounded_observation_hint(
    observations: &str,
    max_lines: usize,
    max_chars: usize,
) -> Option<String> {
    if max_lines == 0 || max_chars == 0 {
        return None;
    }
    let mut newest = observations
        .lines()
        .rev()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .take(max_lines)
        .collect::<Vec<_>>();
    newest.reverse();

    let joined = newest.join(" ");
    let hint = joined.chars().take(max_chars).collect::<String>();
    let hint = hint.trim();
    if hint.is_empty() {
        None
    } else {
        Some(format!("{OBSERVATION_HINT_PREFIX} {hint}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssembledContext {
    pub system_block: Option<String>,
    /// Ordered by `(created_at, id)`.
    pub messages: Vec<OmMessage>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl AssembledContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.system_block.is_none() && self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    memory: ObservationalMemory,
}

impl ContextAssembler {
    #[must_use]
    pub const fn new(memory: ObservationalMemory) -> Self {
        Self { memory }
    }

    pub async fn assemble(&self, binding: &OmScopeBinding) -> Result<AssembledContext> {
        let messages = self.memory.unobserved_messages(binding).await?;
        let Some(record) = self.memory.record(binding).await? else {
            return Ok(AssembledContext {
                messages,
                ..AssembledContext::default()
            });
        };
        Ok(AssembledContext {
            system_block: self.memory.formatter().format(&record),
            messages,
            last_observed_at: record.last_observed_at,
        })
    }

    /// Same as [`Self::assemble`] but over a caller-held history instead of
    /// the stored one.
    pub async fn assemble_from(
        &self,
        binding: &OmScopeBinding,
        history: &[OmMessage],
    ) -> Result<AssembledContext> {
        let record = self.memory.record(binding).await?;
        let last_observed_at = record.as_ref().and_then(|record| record.last_observed_at);
        let carried = record
            .as_ref()
            .map(|record| record.carried_messages.as_slice())
            .unwrap_or_default();
        let kept = history
            .iter()
            .filter(|message| carried.iter().any(|carried| carried.id == message.id))
            .cloned()
            .collect::<Vec<_>>();
        let after_cutoff = filter_messages_by_last_observed_at(history, last_observed_at);
        Ok(AssembledContext {
            system_block: record
                .as_ref()
                .and_then(|record| self.memory.formatter().format(record)),
            messages: merge_pending_messages(&kept, after_cutoff),
            last_observed_at,
        })
    }
}

#[cfg(test)]
mod tests;
