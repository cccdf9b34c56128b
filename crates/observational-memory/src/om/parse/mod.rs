mod sections;
mod tokens;

use sections::{extract_last_tag_content, join_section_ranges, section_ranges_for_tag};
use tokens::parse_tag_tokens;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OmParseMode {
    Strict,
    /// Recovers from overlapping opens that models sometimes emit.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OmMemorySection {
    pub observations: String,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
}

impl OmMemorySection {
    #[must_use]
    pub fn has_observations(&self) -> bool {
        !self.observations.trim().is_empty()
    }

    fn metadata_fields(&self) -> u8 {
        u8::from(self.current_task.is_some()) + u8::from(self.suggested_response.is_some())
    }
}

fn is_list_item(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") {
        return true;
    }
    let digits = trimmed.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0 && trimmed[digits..].starts_with(". ")
}

/// Fallback for output without an `<observations>` section.
#[must_use]
pub fn extract_list_items_only(text: &str) -> String {
    text.lines()
        .filter(|line| is_list_item(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[must_use]
pub fn parse_memory_section_xml(content: &str, mode: OmParseMode) -> OmMemorySection {
    let tokens = parse_tag_tokens(content);

    let ranges = section_ranges_for_tag(content, &tokens, "observations", mode);
    let observations = if ranges.is_empty() {
        extract_list_items_only(content)
    } else {
        join_section_ranges(content, &ranges)
    };

    OmMemorySection {
        observations: observations.trim().to_string(),
        current_task: extract_last_tag_content(content, &tokens, "current-task", mode),
        suggested_response: extract_last_tag_content(content, &tokens, "suggested-response", mode),
    }
}

/// Strict parse first; lenient only when strict recovered no observations and
/// lenient recovers more.
#[must_use]
pub fn parse_memory_section_xml_accuracy_first(content: &str) -> OmMemorySection {
    let strict = parse_memory_section_xml(content, OmParseMode::Strict);
    if strict.has_observations() {
        return strict;
    }
    let lenient = parse_memory_section_xml(content, OmParseMode::Lenient);
    if lenient.has_observations() || lenient.metadata_fields() > strict.metadata_fields() {
        lenient
    } else {
        strict
    }
}
