use std::collections::HashSet;
use std::hash::BuildHasher;

use chrono::{DateTime, Utc};

use crate::om::model::OmMessage;

/// Drops blank and already-observed ids, deduplicates, and orders the
/// remainder by `(created_at, id)`.
#[must_use]
pub fn select_unobserved_messages(
    messages: &[OmMessage],
    observed_message_ids: &HashSet<String, impl BuildHasher>,
    last_observed_at: Option<DateTime<Utc>>,
) -> Vec<OmMessage> {
    let mut seen = HashSet::<&str>::new();
    let mut filtered = messages
        .iter()
        .filter(|message| {
            !message.id.trim().is_empty()
                && !observed_message_ids.contains(&message.id)
                && last_observed_at.is_none_or(|cutoff| message.created_at > cutoff)
        })
        .filter(|message| seen.insert(message.id.as_str()))
        .cloned()
        .collect::<Vec<_>>();

    filtered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    filtered
}

#[must_use]
pub fn filter_messages_by_last_observed_at(
    messages: &[OmMessage],
    last_observed_at: Option<DateTime<Utc>>,
) -> Vec<OmMessage> {
    let Some(cutoff) = last_observed_at else {
        return messages.to_vec();
    };
    messages
        .iter()
        .filter(|message| message.created_at > cutoff)
        .cloned()
        .collect::<Vec<_>>()
}

/// Carried messages plus those listed after the cutoff, deduplicated by id
/// and ordered by `(created_at, id)`.
#[must_use]
pub fn merge_pending_messages(carried: &[OmMessage], listed: Vec<OmMessage>) -> Vec<OmMessage> {
    let mut seen = HashSet::<String>::new();
    let mut merged = carried
        .iter()
        .cloned()
        .chain(listed)
        .filter(|message| seen.insert(message.id.clone()))
        .collect::<Vec<_>>();
    merged.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    merged
}

/// Candidates left behind when the cutoff moves to `cutoff`: not folded by
/// the committing cycle, yet no longer after the cutoff.
#[must_use]
pub fn select_stranded_messages(
    candidates: &[OmMessage],
    folded_ids: &HashSet<&str>,
    cutoff: Option<DateTime<Utc>>,
) -> Vec<OmMessage> {
    let Some(cutoff) = cutoff else {
        return Vec::new();
    };
    let mut seen = HashSet::<&str>::new();
    candidates
        .iter()
        .filter(|message| message.created_at <= cutoff)
        .filter(|message| !folded_ids.contains(message.id.as_str()))
        .filter(|message| seen.insert(message.id.as_str()))
        .cloned()
        .collect()
}

/// Splits an ordered window into consecutive batches of at most
/// `max_tokens_per_batch`. A single oversized message still forms its own batch.
#[must_use]
pub fn split_observer_batches(
    messages: &[OmMessage],
    max_tokens_per_batch: u32,
    message_tokens: impl Fn(&OmMessage) -> u32,
) -> Vec<Vec<OmMessage>> {
    let max_tokens_per_batch = max_tokens_per_batch.max(1);
    let mut batches = Vec::<Vec<OmMessage>>::new();
    let mut current = Vec::<OmMessage>::new();
    let mut current_tokens = 0u32;

    for message in messages {
        let tokens = message_tokens(message);
        if !current.is_empty() && current_tokens.saturating_add(tokens) > max_tokens_per_batch {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens = current_tokens.saturating_add(tokens);
        current.push(message.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
