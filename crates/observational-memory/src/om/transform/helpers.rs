use std::collections::HashSet;

pub(crate) fn merge_message_ids(existing: &[String], observed: &[String]) -> Vec<String> {
    let mut merged = Vec::<String>::new();
    let mut seen = HashSet::<&str>::new();
    for id in existing.iter().chain(observed.iter()) {
        if id.trim().is_empty() {
            continue;
        }
        if seen.insert(id.as_str()) {
            merged.push(id.clone());
        }
    }
    merged
}

pub(crate) fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut needs_space = false;

    for part in text.split_whitespace() {
        if needs_space {
            out.push(' ');
        }
        out.push_str(part);
        needs_space = true;
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rounding {
    Floor,
    Nearest,
    Ceil,
}

/// Negative and non-finite inputs clamp to zero, large ones to `u32::MAX`.
pub(crate) fn clamp_f64_to_u32(value: f64, rounding: Rounding) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let value = match rounding {
        Rounding::Floor => value.floor(),
        Rounding::Nearest => value.round(),
        Rounding::Ceil => value.ceil(),
    }
    .min(f64::from(u32::MAX));
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "value is non-negative and bounded to u32::MAX before cast"
    )]
    let clamped = value as u32;
    clamped
}
