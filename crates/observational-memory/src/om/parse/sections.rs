use super::OmParseMode;
use super::tokens::{TagKind, TagSectionRange, TagToken};

#[derive(Clone, Copy)]
enum OpenState<'a> {
    Idle,
    Open(&'a TagToken),
    /// Strict mode saw a nested open; the next close belongs to the broken block.
    Discarding,
}

fn closes_section(text: &str, open: &TagToken, close: &TagToken) -> bool {
    if close.start < open.end {
        return false;
    }
    let same_line = text
        .get(open.end..close.start)
        .is_some_and(|segment| !segment.contains('\n'));
    close.line_anchored || same_line
}

/// Open tags must start their line. Strict mode drops a block that contains a
/// second open of the same tag; lenient mode restarts at the latest open.
pub(super) fn section_ranges_for_tag(
    text: &str,
    tokens: &[TagToken],
    tag: &str,
    mode: OmParseMode,
) -> Vec<TagSectionRange> {
    let tag = tag.trim().to_ascii_lowercase();
    if tag.is_empty() {
        return Vec::new();
    }

    let mut ranges = Vec::<TagSectionRange>::new();
    let mut state = OpenState::Idle;

    for token in tokens.iter().filter(|token| token.name == tag) {
        state = match (token.kind, state) {
            (TagKind::Open, state) if !token.line_anchored => state,
            (TagKind::Open, OpenState::Open(_)) if mode == OmParseMode::Strict => {
                OpenState::Discarding
            }
            (TagKind::Open, OpenState::Discarding) if mode == OmParseMode::Strict => {
                OpenState::Discarding
            }
            (TagKind::Open, _) => OpenState::Open(token),
            (TagKind::Close, OpenState::Discarding) => OpenState::Idle,
            (TagKind::Close, OpenState::Open(open)) if closes_section(text, open, token) => {
                ranges.push(TagSectionRange {
                    content_start: open.end,
                    content_end: token.start,
                });
                OpenState::Idle
            }
            (TagKind::Close, state) => state,
        };
    }

    ranges
}

pub(super) fn join_section_ranges(text: &str, ranges: &[TagSectionRange]) -> String {
    ranges
        .iter()
        .filter_map(|range| text.get(range.content_start..range.content_end))
        .map(str::trim)
        .filter(|section| !section.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content of the last non-empty `<tag>` section.
pub(super) fn extract_last_tag_content(
    text: &str,
    tokens: &[TagToken],
    tag: &str,
    mode: OmParseMode,
) -> Option<String> {
    section_ranges_for_tag(text, tokens, tag, mode)
        .iter()
        .rev()
        .filter_map(|range| text.get(range.content_start..range.content_end))
        .map(str::trim)
        .find(|content| !content.is_empty())
        .map(ToString::to_string)
}
