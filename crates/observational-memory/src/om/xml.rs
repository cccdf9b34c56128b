//! Minimal XML escaping for blocks that are spliced into model prompts.

const fn entity(ch: char, in_attribute: bool) -> Option<&'static str> {
    match ch {
        '&' => Some("&amp;"),
        '<' => Some("&lt;"),
        '>' => Some("&gt;"),
        '"' if in_attribute => Some("&quot;"),
        '\'' if in_attribute => Some("&#39;"),
        _ => None,
    }
}

fn escape(text: &str, in_attribute: bool) -> String {
    if !text.chars().any(|ch| entity(ch, in_attribute).is_some()) {
        return text.to_string();
    }
    text.chars().fold(String::with_capacity(text.len() + 16), |mut out, ch| {
        match entity(ch, in_attribute) {
            Some(replacement) => out.push_str(replacement),
            None => out.push(ch),
        }
        out
    })
}

/// Escapes element content. Quotes are legal there and stay as-is.
#[must_use]
pub fn escape_xml_text(text: &str) -> String {
    escape(text, false)
}

#[must_use]
pub fn escape_xml_attribute(text: &str) -> String {
    escape(text, true)
}
