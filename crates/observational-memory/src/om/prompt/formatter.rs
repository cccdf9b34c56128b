use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::om::OmMessage;
use crate::om::xml::{escape_xml_attribute, escape_xml_text};

const UNATTRIBUTED_THREAD: &str = "unattributed";

fn normalize_role(role: &str) -> String {
    let mut chars = role.trim().chars();
    let Some(first) = chars.next() else {
        return "Unknown".to_string();
    };
    let mut normalized = first.to_uppercase().collect::<String>();
    normalized.push_str(chars.as_str());
    normalized
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format("%b %-d, %Y, %-I:%M %p").to_string()
}

/// Renders messages as `**Role (Jan 1, 2026, 9:05 AM):**` blocks separated by
/// horizontal rules. Messages longer than `max_chars_per_message` are cut.
#[must_use]
pub fn format_observer_messages_for_prompt(
    messages: &[OmMessage],
    max_chars_per_message: Option<usize>,
) -> String {
    messages
        .iter()
        .map(|message| {
            let role = normalize_role(&message.role);
            let text = message.text.trim();
            let text = match max_chars_per_message {
                Some(limit) if text.chars().count() > limit => {
                    let mut bounded = text.chars().take(limit).collect::<String>();
                    bounded.push_str(" [truncated]");
                    bounded
                }
                _ => text.to_string(),
            };
            format!(
                "**{role} ({}):**\n{text}",
                format_timestamp(message.created_at)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Resource-scope variant: one `<thread id="...">` block per source thread,
/// threads ordered by their first message.
#[must_use]
pub fn format_thread_grouped_messages_for_prompt(
    messages: &[OmMessage],
    max_chars_per_message: Option<usize>,
) -> String {
    let mut order = Vec::<&str>::new();
    let mut groups = BTreeMap::<&str, Vec<OmMessage>>::new();
    for message in messages {
        let thread_id = message
            .source_thread_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(UNATTRIBUTED_THREAD);
        let group = groups.entry(thread_id).or_default();
        if group.is_empty() {
            order.push(thread_id);
        }
        group.push(message.clone());
    }

    order
        .into_iter()
        .filter_map(|thread_id| {
            let history = groups
                .get(thread_id)
                .map(|group| format_observer_messages_for_prompt(group, max_chars_per_message))?;
            Some(format!(
                "<thread id=\"{}\">\n{}\n</thread>",
                escape_xml_attribute(thread_id),
                escape_xml_text(history.trim())
            ))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
