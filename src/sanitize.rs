//! Text sanitizing for keyword and identifier scans over authored documents.
//!
//! Fenced example blocks are blanked out before scanning, and literals are
//! escaped before they become part of a pattern.
use crate::error::{GateError, Result};
use crate::registry::Identifier;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Replace every line inside a fenced block (fences included) with an empty
/// line, so line numbers in the result still match the source.
///
/// An unterminated fence blanks the rest of the document.
pub fn strip_fenced_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut open_fence: Option<(char, usize)> = None;
    for line in text.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let fence = fence_marker(body);
        match (open_fence, fence) {
            (None, Some(marker)) => {
                open_fence = Some(marker);
            }
            (Some((ch, len)), Some((close_ch, close_len)))
                if close_ch == ch && close_len >= len && is_bare_fence(body) =>
            {
                open_fence = None;
            }
            (None, None) => {
                out.push_str(line);
                continue;
            }
            _ => {}
        }
        if line.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

fn fence_marker(line: &str) -> Option<(char, usize)> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }
    let ch = trimmed.chars().next()?;
    if ch != '`' && ch != '~' {
        return None;
    }
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    (len >= 3).then_some((ch, len))
}

fn is_bare_fence(line: &str) -> bool {
    let trimmed = line.trim();
    let ch = trimmed.chars().next();
    ch.is_some_and(|ch| trimmed.chars().all(|c| c == ch))
}

/// Escape a literal for use inside a regex.
pub fn escape_literal(literal: &str) -> String {
    regex::escape(literal)
}

/// Case-insensitive matcher for any of `literals`, on word boundaries where
/// the literal starts or ends with a word character.
pub fn keyword_matcher<S: AsRef<str>>(literals: &[S]) -> Result<Regex> {
    let alternatives: Vec<String> = literals
        .iter()
        .map(AsRef::as_ref)
        .filter(|literal| !literal.is_empty())
        .map(|literal| {
            let starts_word = literal.chars().next().is_some_and(is_word_char);
            let ends_word = literal.chars().last().is_some_and(is_word_char);
            format!(
                "{}{}{}",
                if starts_word { r"\b" } else { "" },
                escape_literal(literal),
                if ends_word { r"\b" } else { "" }
            )
        })
        .collect();
    if alternatives.is_empty() {
        return Err(GateError::Pattern {
            pattern: String::new(),
            reason: "no keywords given".to_string(),
        });
    }
    let pattern = format!("(?i)(?:{})", alternatives.join("|"));
    Regex::new(&pattern).map_err(|err| GateError::Pattern {
        pattern,
        reason: err.to_string(),
    })
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// An identifier referenced from authored text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierMention {
    pub id: Identifier,
    /// 1-based line number in the original text.
    pub line: usize,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:REQ|CL|EVID)-[A-Za-z0-9]+-[0-9]{3,}\b")
            .expect("regex for identifier mentions")
    })
}

/// Identifiers mentioned outside fenced blocks, in document order.
pub fn scan_identifiers(text: &str) -> Vec<IdentifierMention> {
    let cleaned = strip_fenced_blocks(text);
    let mut mentions = Vec::new();
    for (idx, line) in cleaned.lines().enumerate() {
        for found in identifier_pattern().find_iter(line) {
            if let Ok(id) = found.as_str().parse::<Identifier>() {
                mentions.push(IdentifierMention { id, line: idx + 1 });
            }
        }
    }
    mentions
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "Intro REQ-W1-001\n```sh\necho CL-W1-002\n```\nDone: CL-W1-003 and EVID-W1-010.\n";

    #[test]
    fn fenced_blocks_are_blanked_keeping_lines() {
        let stripped = strip_fenced_blocks(DOC);
        assert_eq!(stripped.lines().count(), DOC.lines().count());
        assert!(!stripped.contains("CL-W1-002"));
        assert!(stripped.contains("CL-W1-003"));
    }

    #[test]
    fn tilde_fences_and_longer_closers() {
        let text = "a\n~~~~\nhidden\n~~~\nstill hidden\n~~~~~\nb\n";
        let stripped = strip_fenced_blocks(text);
        assert!(!stripped.contains("hidden"));
        assert!(stripped.contains('b'));
    }

    #[test]
    fn identifiers_are_found_outside_fences() {
        let found: Vec<(String, usize)> = scan_identifiers(DOC)
            .into_iter()
            .map(|mention| (mention.id.to_string(), mention.line))
            .collect();
        assert_eq!(
            found,
            [
                ("REQ-W1-001".to_string(), 1),
                ("CL-W1-003".to_string(), 5),
                ("EVID-W1-010".to_string(), 5),
            ]
        );
    }

    #[test]
    fn punctuation_in_keywords_matches_literally() {
        let matcher = keyword_matcher(&["C++", "v1.2 (beta)", "must"]).expect("matcher");
        assert!(matcher.is_match("needs C++ support"));
        assert!(matcher.is_match("ships in v1.2 (beta)"));
        assert!(!matcher.is_match("ships in v1x2 (beta)"));
        assert!(matcher.is_match("It MUST pass"));
        assert!(!matcher.is_match("mustard"));
    }

    #[test]
    fn empty_keyword_list_is_an_error() {
        let none: [&str; 0] = [];
        assert!(matches!(
            keyword_matcher(&none),
            Err(GateError::Pattern { .. })
        ));
    }
}
