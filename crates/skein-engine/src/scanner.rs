//! Incremental tag matching over an accumulating text buffer.
//!
//! The parsing engines all face the same low-level problem: model output
//! arrives in fragments that can split a tag anywhere, and content must be
//! emitted the moment it is known not to be the start of a tag, while a
//! tail that could still become a tag is retained until more input
//! arrives. The helpers here implement that discipline. Tags are pure
//! ASCII, so retention boundaries always fall on `char` boundaries and
//! multi-byte content passes through untouched.

/// Outcome of matching a literal tag at a position in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMatch {
    /// The buffer at this position starts with the complete tag.
    Full,
    /// The rest of the buffer is a strict prefix of the tag; more input
    /// is needed to decide.
    Partial,
    /// The tag cannot match here.
    No,
}

/// Match `tag` against `rest`, where `rest` extends to the end of the
/// currently buffered input.
pub fn match_tag(rest: &str, tag: &str) -> TagMatch {
    if rest.len() >= tag.len() {
        if rest.starts_with(tag) {
            TagMatch::Full
        } else {
            TagMatch::No
        }
    } else if tag.starts_with(rest) {
        TagMatch::Partial
    } else {
        TagMatch::No
    }
}

/// Outcome of matching a tag that carries a dynamic argument, of the form
/// `<prefix` + name + `>` (e.g. `<function=search>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgTagMatch {
    /// Complete tag: the extracted argument and the consumed byte length.
    Full { name: String, len: usize },
    /// The tail could still become this tag (prefix incomplete, or the
    /// argument's closing `>` has not arrived).
    Partial,
    /// The tag cannot match here.
    No,
}

/// Match an argument-carrying tag opened by `prefix` (which includes the
/// leading `<` and the `=`) against `rest`.
pub fn match_arg_tag(rest: &str, prefix: &str) -> ArgTagMatch {
    if rest.len() < prefix.len() {
        return if prefix.starts_with(rest) {
            ArgTagMatch::Partial
        } else {
            ArgTagMatch::No
        };
    }
    if !rest.starts_with(prefix) {
        return ArgTagMatch::No;
    }
    match rest[prefix.len()..].find('>') {
        Some(i) => ArgTagMatch::Full {
            name: rest[prefix.len()..prefix.len() + i].to_string(),
            len: prefix.len() + i + 1,
        },
        // Tag opened but the argument is still streaming in.
        None => ArgTagMatch::Partial,
    }
}

/// A scanner over a fixed set of literal tags.
///
/// `scan` splits a buffer into literal text runs and tag hits, returning
/// the tail that must be retained because it is a strict prefix of some
/// tag. Longer tags are tried first so no tag shadows another.
#[derive(Debug, Clone)]
pub struct TagScanner {
    tags: Vec<String>,
}

/// One item produced by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// Literal content, unambiguously not part of any tag.
    Text(String),
    /// A complete tag, identified by its index in the scanner's tag set.
    Tag(usize),
}

/// The result of scanning a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Emitted items in input order.
    pub items: Vec<ScanItem>,
    /// Tail retained as a possible tag prefix; prepend to the next input.
    pub retained: String,
}

impl TagScanner {
    /// Create a scanner for the given literal tags. Tag indices reported
    /// by [`ScanItem::Tag`] refer to this original ordering.
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    /// The configured tags.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Scan `buffer` from the start, producing literal runs and tag hits
    /// plus the retained ambiguous tail.
    pub fn scan(&self, buffer: &str) -> ScanOutcome {
        let mut outcome = ScanOutcome::default();
        let mut literal = String::new();
        let mut pos = 0;

        while pos < buffer.len() {
            let rest = &buffer[pos..];

            // Longest full match wins.
            let mut full: Option<(usize, usize)> = None;
            let mut partial = false;
            for (idx, tag) in self.tags.iter().enumerate() {
                match match_tag(rest, tag) {
                    TagMatch::Full => {
                        if full.map(|(_, len)| tag.len() > len).unwrap_or(true) {
                            full = Some((idx, tag.len()));
                        }
                    }
                    TagMatch::Partial => partial = true,
                    TagMatch::No => {}
                }
            }

            if let Some((idx, len)) = full {
                if !literal.is_empty() {
                    outcome.items.push(ScanItem::Text(std::mem::take(&mut literal)));
                }
                outcome.items.push(ScanItem::Tag(idx));
                pos += len;
                continue;
            }

            if partial {
                // The rest of the buffer could still become a tag.
                if !literal.is_empty() {
                    outcome.items.push(ScanItem::Text(std::mem::take(&mut literal)));
                }
                outcome.retained = rest.to_string();
                return outcome;
            }

            // Unambiguous literal character.
            let ch = rest.chars().next().unwrap_or('\u{fffd}');
            literal.push(ch);
            pos += ch.len_utf8();
        }

        if !literal.is_empty() {
            outcome.items.push(ScanItem::Text(literal));
        }
        outcome
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(outcome: &ScanOutcome) -> String {
        outcome
            .items
            .iter()
            .filter_map(|i| match i {
                ScanItem::Text(t) => Some(t.as_str()),
                ScanItem::Tag(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_passes_through() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let outcome = scanner.scan("hello world");
        assert_eq!(outcome.items, vec![ScanItem::Text("hello world".to_string())]);
        assert!(outcome.retained.is_empty());
    }

    #[test]
    fn test_complete_tag_detected() {
        let scanner = TagScanner::new(["<tool_call>", "</tool_call>"]);
        let outcome = scanner.scan("before<tool_call>inside</tool_call>after");
        assert_eq!(
            outcome.items,
            vec![
                ScanItem::Text("before".to_string()),
                ScanItem::Tag(0),
                ScanItem::Text("inside".to_string()),
                ScanItem::Tag(1),
                ScanItem::Text("after".to_string()),
            ]
        );
    }

    #[test]
    fn test_back_to_back_tags() {
        let scanner = TagScanner::new(["<a>", "</a>"]);
        let outcome = scanner.scan("<a></a><a>");
        assert_eq!(
            outcome.items,
            vec![ScanItem::Tag(0), ScanItem::Tag(1), ScanItem::Tag(0)]
        );
    }

    #[test]
    fn test_partial_tag_retained() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let outcome = scanner.scan("text<tool_c");
        assert_eq!(outcome.items, vec![ScanItem::Text("text".to_string())]);
        assert_eq!(outcome.retained, "<tool_c");
    }

    #[test]
    fn test_lone_angle_bracket_retained() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let outcome = scanner.scan("a < b and <");
        // "< " is disambiguated by the following space; the trailing "<" is not.
        assert_eq!(texts(&outcome), "a < b and ");
        assert_eq!(outcome.retained, "<");
    }

    #[test]
    fn test_non_tag_angle_emitted() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let outcome = scanner.scan("<x>hello</x>");
        assert_eq!(texts(&outcome), "<x>hello</x>");
        assert!(outcome.retained.is_empty());
    }

    #[test]
    fn test_multibyte_content_untouched() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let outcome = scanner.scan("你好<tool_call>世界");
        assert_eq!(
            outcome.items,
            vec![
                ScanItem::Text("你好".to_string()),
                ScanItem::Tag(0),
                ScanItem::Text("世界".to_string()),
            ]
        );
    }

    #[test]
    fn test_resume_with_retained_tail() {
        let scanner = TagScanner::new(["<tool_call>"]);
        let first = scanner.scan("abc<tool_");
        assert_eq!(first.retained, "<tool_");

        let second = scanner.scan(&format!("{}call>def", first.retained));
        assert_eq!(
            second.items,
            vec![ScanItem::Tag(0), ScanItem::Text("def".to_string())]
        );
    }

    #[test]
    fn test_match_tag() {
        assert_eq!(match_tag("<a>rest", "<a>"), TagMatch::Full);
        assert_eq!(match_tag("<a", "<a>"), TagMatch::Partial);
        assert_eq!(match_tag("<b>", "<a>"), TagMatch::No);
        assert_eq!(match_tag("", "<a>"), TagMatch::Partial);
    }

    #[test]
    fn test_match_arg_tag_complete() {
        match match_arg_tag("<function=search>rest", "<function=") {
            ArgTagMatch::Full { name, len } => {
                assert_eq!(name, "search");
                assert_eq!(len, "<function=search>".len());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_match_arg_tag_partial() {
        assert_eq!(match_arg_tag("<func", "<function="), ArgTagMatch::Partial);
        assert_eq!(
            match_arg_tag("<function=sea", "<function="),
            ArgTagMatch::Partial
        );
        assert_eq!(match_arg_tag("<other", "<function="), ArgTagMatch::No);
    }
}
