// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Strips reasoning-tag wrappers from a model's final accumulated text.
//!
//! Some providers emit their chain-of-thought inline in the text stream
//! instead of (or in addition to) a separate `reasoning_content` field,
//! wrapped in one of a handful of conventional tags. This module removes
//! those wrappers from the final content shown to the user. It is never
//! applied mid-stream — only once, to the fully accumulated turn, and only
//! when the turn produced no tool calls.

/// Tag names recognized as reasoning wrappers, matched case-insensitively.
const REASONING_TAGS: &[&str] = &["think", "thinking", "thought", "antthinking", "final"];

/// Behavior when a reasoning tag is opened but never closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrubMode {
    /// Truncate the output at the unclosed tag — anything after an opened
    /// but never-closed reasoning tag is considered unreliable and dropped.
    #[default]
    Strict,
    /// Keep the text that follows an unclosed tag, on the assumption it is
    /// real content that merely lost its closing tag to a stream cutoff.
    Preserve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fence {
    None,
    Triple(char),
    Inline,
}

/// Remove all reasoning-tag wrappers from `text`, leaving fenced and inline
/// code blocks untouched even if they happen to contain tag-like substrings.
/// The result is trimmed of leading/trailing whitespace, since stripping a
/// tag at either end of the text otherwise leaves the blank line it sat on.
///
/// Idempotent: `scrub(scrub(x), mode) == scrub(x, mode)`.
pub fn scrub(text: &str, mode: ScrubMode) -> String {
    let mut out = String::with_capacity(text.len());
    let mut fence = Fence::None;
    let mut rest = text;

    while !rest.is_empty() {
        match fence {
            Fence::None => match find_next_boundary(rest) {
                None => {
                    out.push_str(rest);
                    break;
                }
                Some(Boundary::CodeFence { start, ch }) => {
                    out.push_str(&rest[..start]);
                    out.push_str(&ch.to_string().repeat(3));
                    fence = Fence::Triple(ch);
                    rest = &rest[start + 3..];
                }
                Some(Boundary::InlineCode { start }) => {
                    out.push_str(&rest[..start]);
                    out.push('`');
                    fence = Fence::Inline;
                    rest = &rest[start + 1..];
                }
                Some(Boundary::Tag { start, tag, end }) => {
                    out.push_str(&rest[..start]);
                    match find_closing_tag(&rest[end..], tag) {
                        Some((close_start, close_end)) => {
                            // `<final>` marks the user-visible answer: drop only the
                            // tag markup and keep what it wraps. Every other
                            // reasoning tag hides content the user should never see.
                            if tag.eq_ignore_ascii_case("final") {
                                out.push_str(&rest[end..end + close_start]);
                            }
                            rest = &rest[end + close_end..];
                        }
                        None => {
                            // Unclosed tag.
                            match mode {
                                ScrubMode::Strict => {
                                    rest = "";
                                }
                                ScrubMode::Preserve => {
                                    rest = &rest[end..];
                                }
                            }
                        }
                    }
                }
            },
            Fence::Triple(ch) => {
                let marker: String = std::iter::repeat(ch).take(3).collect();
                if let Some(idx) = rest.find(&marker) {
                    out.push_str(&rest[..idx + marker.len()]);
                    fence = Fence::None;
                    rest = &rest[idx + marker.len()..];
                } else {
                    out.push_str(rest);
                    break;
                }
            }
            Fence::Inline => {
                if let Some(idx) = rest.find('`') {
                    out.push_str(&rest[..idx + 1]);
                    fence = Fence::None;
                    rest = &rest[idx + 1..];
                } else {
                    out.push_str(rest);
                    break;
                }
            }
        }
    }

    out.trim().to_string()
}

enum Boundary {
    CodeFence { start: usize, ch: char },
    InlineCode { start: usize },
    Tag { start: usize, tag: &'static str, end: usize },
}

fn find_next_boundary(s: &str) -> Option<Boundary> {
    let mut best: Option<(usize, Boundary)> = None;

    fn consider(best: &mut Option<(usize, Boundary)>, idx: usize, b: Boundary) {
        if best.as_ref().map(|(i, _)| idx < *i).unwrap_or(true) {
            *best = Some((idx, b));
        }
    }

    for fence_char in ['`', '~'] {
        let marker: String = std::iter::repeat(fence_char).take(3).collect();
        if let Some(idx) = s.find(&marker) {
            consider(&mut best, idx, Boundary::CodeFence { start: idx, ch: fence_char });
        }
    }
    if let Some(idx) = s.find('`') {
        // Triple-fence candidates above start at the same index when present,
        // and `consider` only replaces on strictly-smaller index, so a real
        // fence always wins ties over this plain inline-code candidate.
        consider(&mut best, idx, Boundary::InlineCode { start: idx });
    }

    for tag in REASONING_TAGS {
        if let Some((idx, end)) = find_open_tag(s, tag) {
            consider(&mut best, idx, Boundary::Tag { start: idx, tag, end });
        }
    }

    best.map(|(_, b)| b)
}

/// Find the next `<tag ...>` (case-insensitive, optional attributes) in `s`.
/// Returns (start_byte, end_byte_after_closing_angle_bracket).
fn find_open_tag(s: &str, tag: &str) -> Option<(usize, usize)> {
    let lower = s.to_ascii_lowercase();
    let open_prefix = format!("<{}", tag.to_ascii_lowercase());
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find(&open_prefix) {
        let start = search_from + rel;
        let after_prefix = start + open_prefix.len();
        let next_char = lower[after_prefix..].chars().next();
        match next_char {
            Some('>') | Some(' ') | Some('/') | None => {
                if let Some(gt_rel) = s[start..].find('>') {
                    return Some((start, start + gt_rel + 1));
                }
                return None;
            }
            _ => {
                search_from = after_prefix;
            }
        }
    }
    None
}

/// Find `</tag>` case-insensitively in `s`. Returns `(start, end)`: the byte
/// offset where `</tag>` begins and the offset just past its closing `>`.
fn find_closing_tag(s: &str, tag: &str) -> Option<(usize, usize)> {
    let lower = s.to_ascii_lowercase();
    let close = format!("</{}>", tag.to_ascii_lowercase());
    lower.find(&close).map(|idx| (idx, idx + close.len()))
}
