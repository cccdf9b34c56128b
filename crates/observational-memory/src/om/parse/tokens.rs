#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TagKind {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct TagToken {
    pub(super) kind: TagKind,
    pub(super) name: String,
    pub(super) start: usize,
    pub(super) end: usize,
    /// Only whitespace precedes the tag on its line.
    pub(super) line_anchored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct TagSectionRange {
    pub(super) content_start: usize,
    pub(super) content_end: usize,
}

const fn is_tag_name_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

fn is_line_anchored(text: &str, tag_index: usize) -> bool {
    let line_start = text[..tag_index].rfind('\n').map_or(0, |idx| idx + 1);
    text[line_start..tag_index]
        .bytes()
        .all(|byte| byte == b' ' || byte == b'\t')
}

/// Index of the `>` closing a tag opened before `from`, skipping quoted
/// attribute values.
fn find_tag_end(bytes: &[u8], from: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (idx, &byte) in bytes.iter().enumerate().skip(from) {
        match quote {
            Some(active) if byte == active => quote = None,
            Some(_) => {}
            None if byte == b'\'' || byte == b'"' => quote = Some(byte),
            None if byte == b'>' => return Some(idx),
            None => {}
        }
    }
    None
}

fn skip_whitespace(bytes: &[u8], mut cursor: usize) -> usize {
    while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
        cursor += 1;
    }
    cursor
}

/// Reads `<name ...>` or `</name>` from the text between the angle brackets.
fn read_tag(inner: &str) -> Option<(TagKind, String)> {
    let bytes = inner.as_bytes();
    let mut cursor = skip_whitespace(bytes, 0);
    let kind = if bytes.get(cursor) == Some(&b'/') {
        cursor = skip_whitespace(bytes, cursor + 1);
        TagKind::Close
    } else {
        TagKind::Open
    };
    let name_start = cursor;
    while cursor < bytes.len() && is_tag_name_char(bytes[cursor]) {
        cursor += 1;
    }
    if cursor == name_start {
        return None;
    }
    Some((kind, inner[name_start..cursor].to_ascii_lowercase()))
}

pub(super) fn parse_tag_tokens(text: &str) -> Vec<TagToken> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::<TagToken>::new();
    let mut offset = 0usize;

    while let Some(relative) = text[offset..].find('<') {
        let start = offset + relative;
        let Some(end) = find_tag_end(bytes, start + 1) else {
            break;
        };
        if let Some((kind, name)) = read_tag(&text[start + 1..end]) {
            tokens.push(TagToken {
                kind,
                name,
                start,
                end: end + 1,
                line_anchored: is_line_anchored(text, start),
            });
        }
        offset = end + 1;
    }

    tokens
}
