//! Rule pattern matching
//!
//! Grammar patterns are Oniguruma regexes. A pattern is compiled lazily, the
//! first time a line actually needs it, and shared by every thread that
//! tokenizes with the grammar.
//!
//! `\A` and `\G` are position dependent. Instead of asking the regex engine
//! to honour them, each pattern that contains one of them is compiled in up
//! to four variants where a disallowed anchor is replaced by a character no
//! line contains (`\x{FFFF}`). `\A` is allowed only at offset 0 of the first
//! line, `\G` only at the current anchor position.

use super::regex_cache;
use onig::{Regex, Region, SearchOptions};
use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// Pattern used when a backreference cannot be resolved
pub const NEVER_MATCH: &str = "(?!)";

const ANCHOR_REPLACEMENT: &str = "\\x{FFFF}";

// ============================================================================
// Anchors
// ============================================================================

/// Which position-dependent anchors may match at the current position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Anchors {
    /// `\A` may match
    pub allow_a: bool,
    /// `\G` may match
    pub allow_g: bool,
}

impl Anchors {
    /// Anchors allowed at `pos`
    #[inline]
    pub fn at(is_first_line: bool, pos: usize, anchor_position: Option<usize>) -> Self {
        Anchors {
            allow_a: is_first_line && pos == 0,
            allow_g: anchor_position == Some(pos),
        }
    }

    #[inline]
    fn variant(self) -> usize {
        ((self.allow_a as usize) << 1) | self.allow_g as usize
    }
}

/// Whether a pattern source uses `\A` or `\G`
pub fn has_anchors(source: &str) -> bool {
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some('A' | 'G') = chars.next() {
                return true;
            }
        }
    }
    false
}

/// Replace disallowed anchors with a never-matching character
fn substitute_anchors(source: &str, anchors: Anchors) -> String {
    let mut out = String::with_capacity(source.len() + 8);
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('A') if !anchors.allow_a => out.push_str(ANCHOR_REPLACEMENT),
            Some('G') if !anchors.allow_g => out.push_str(ANCHOR_REPLACEMENT),
            Some(next) => {
                out.push('\\');
                out.push(next);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn compile_variant(source: &str, has_anchor: bool, anchors: Anchors) -> Option<Arc<Regex>> {
    let source = if has_anchor {
        Cow::Owned(substitute_anchors(source, anchors))
    } else {
        Cow::Borrowed(source)
    };
    regex_cache::get_or_compile(&source).ok()
}

// ============================================================================
// Compiled patterns
// ============================================================================

/// A grammar pattern with lazily compiled anchor variants
///
/// A pattern that fails to compile never matches.
pub struct CompiledPattern {
    source: String,
    has_anchor: bool,
    variants: [OnceLock<Option<Arc<Regex>>>; 4],
}

impl CompiledPattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let has_anchor = has_anchors(&source);
        CompiledPattern {
            source,
            has_anchor,
            variants: Default::default(),
        }
    }

    #[inline]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compiled regex for the given anchors, `None` if the pattern is invalid
    pub fn regex(&self, anchors: Anchors) -> Option<&Arc<Regex>> {
        let slot = if self.has_anchor { anchors.variant() } else { 0 };
        self.variants[slot]
            .get_or_init(|| compile_variant(&self.source, self.has_anchor, anchors))
            .as_ref()
    }

    /// Whether the pattern compiles at all
    pub fn is_valid(&self) -> bool {
        self.regex(Anchors::default()).is_some()
    }
}

impl fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompiledPattern").field(&self.source).finish()
    }
}

/// A scan candidate: a grammar pattern or a pattern resolved at push time
#[derive(Debug, Clone, Copy)]
pub enum PatternSource<'a> {
    Compiled(&'a CompiledPattern),
    Dynamic(&'a str),
}

impl PatternSource<'_> {
    fn regex(&self, anchors: Anchors) -> Option<Arc<Regex>> {
        match self {
            PatternSource::Compiled(pattern) => pattern.regex(anchors).cloned(),
            PatternSource::Dynamic(source) => {
                compile_variant(source, has_anchors(source), anchors)
            }
        }
    }
}

// ============================================================================
// Scanning
// ============================================================================

/// Result of a successful scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    /// Index of the winning candidate
    pub index: usize,
    pub start: usize,
    pub end: usize,
    /// Capture groups by number; group 0 is the whole match
    pub captures: Vec<Option<Range<usize>>>,
}

impl ScanMatch {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Find the leftmost match of any candidate at or after `pos`
///
/// Ties on the start offset go to the earlier candidate. A match starting
/// exactly at `pos` cannot be beaten, so scanning stops there.
pub fn scan(
    candidates: &[PatternSource<'_>],
    haystack: &str,
    pos: usize,
    anchors: Anchors,
) -> Option<ScanMatch> {
    let mut best: Option<ScanMatch> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(regex) = candidate.regex(anchors) else {
            continue;
        };
        let mut region = Region::new();
        let found = regex.search_with_options(
            haystack,
            pos,
            haystack.len(),
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        );
        if found.is_none() {
            continue;
        }
        let Some((start, end)) = region.pos(0) else {
            continue;
        };
        if best.as_ref().is_some_and(|b| start >= b.start) {
            continue;
        }

        let captures = (0..region.len())
            .map(|i| region.pos(i).map(|(s, e)| s..e))
            .collect();
        best = Some(ScanMatch {
            index,
            start,
            end,
            captures,
        });
        if start == pos {
            break;
        }
    }

    best
}

/// Match a single pattern at or after `pos`
#[inline]
pub fn find_at(
    source: PatternSource<'_>,
    haystack: &str,
    pos: usize,
    anchors: Anchors,
) -> Option<ScanMatch> {
    scan(&[source], haystack, pos, anchors)
}

// ============================================================================
// Backreferences
// ============================================================================

fn back_reference_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\\(\\|[0-9]+)").unwrap_or_else(|_| unreachable!())
    })
}

/// Whether an end/while source refers to groups of the begin match
pub fn has_back_references(source: &str) -> bool {
    if memchr::memchr(b'\\', source.as_bytes()).is_none() {
        return false;
    }
    back_reference_regex()
        .captures_iter(source)
        .any(|caps| caps[1].as_bytes()[0].is_ascii_digit())
}

/// Escape text so it matches literally inside a pattern
pub fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for c in text.chars() {
        if matches!(
            c,
            '-' | '\\'
                | '{'
                | '}'
                | '*'
                | '+'
                | '?'
                | '|'
                | '^'
                | '$'
                | '.'
                | ','
                | '['
                | ']'
                | '('
                | ')'
                | '#'
        ) || c.is_whitespace()
        {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Substitute `\n` backreferences with the captured text of the begin match
///
/// Returns [`NEVER_MATCH`] when a referenced group did not participate in
/// the match.
pub fn resolve_back_references(
    source: &str,
    haystack: &str,
    captures: &[Option<Range<usize>>],
) -> String {
    let mut unresolved = false;
    let resolved = back_reference_regex().replace_all(source, |caps: &regex::Captures<'_>| {
        let group = &caps[1];
        if group == "\\" {
            return "\\\\".to_string();
        }
        let text = group
            .parse::<usize>()
            .ok()
            .and_then(|n| captures.get(n).cloned().flatten())
            .and_then(|range| haystack.get(range));
        match text {
            Some(text) => escape_literal(text),
            None => {
                unresolved = true;
                String::new()
            }
        }
    });

    if unresolved {
        NEVER_MATCH.to_string()
    } else {
        resolved.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_leftmost_wins() {
        let digits = CompiledPattern::new(r"\d+");
        let word = CompiledPattern::new(r"[a-z]+");
        let candidates = [
            PatternSource::Compiled(&digits),
            PatternSource::Compiled(&word),
        ];

        let m = scan(&candidates, "abc 123", 0, Anchors::default()).unwrap();
        assert_eq!(m.index, 1);
        assert_eq!((m.start, m.end), (0, 3));

        let m = scan(&candidates, "abc 123", 3, Anchors::default()).unwrap();
        assert_eq!(m.index, 0);
        assert_eq!((m.start, m.end), (4, 7));
    }

    #[test]
    fn test_scan_tie_goes_to_earlier_candidate() {
        let short = CompiledPattern::new("le");
        let long = CompiledPattern::new("let");
        let candidates = [
            PatternSource::Compiled(&short),
            PatternSource::Compiled(&long),
        ];
        let m = scan(&candidates, "let", 0, Anchors::default()).unwrap();
        assert_eq!(m.index, 0);
    }

    #[test]
    fn test_scan_no_match() {
        let p = CompiledPattern::new("xyz");
        assert!(scan(&[PatternSource::Compiled(&p)], "abc", 0, Anchors::default()).is_none());
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let bad = CompiledPattern::new("(unclosed");
        let good = CompiledPattern::new("b");
        assert!(!bad.is_valid());
        let candidates = [PatternSource::Compiled(&bad), PatternSource::Compiled(&good)];
        let m = scan(&candidates, "ab", 0, Anchors::default()).unwrap();
        assert_eq!(m.index, 1);
    }

    #[test]
    fn test_g_anchor_only_at_anchor_position() {
        let p = CompiledPattern::new(r"\Gx");
        let source = PatternSource::Compiled(&p);

        assert!(find_at(source, "axx", 1, Anchors::at(false, 1, Some(1))).is_some());
        assert!(find_at(source, "axx", 1, Anchors::at(false, 1, None)).is_none());
        assert!(find_at(source, "axx", 1, Anchors::at(false, 1, Some(0))).is_none());
    }

    #[test]
    fn test_a_anchor_only_on_first_line() {
        let p = CompiledPattern::new(r"\A#!");
        let source = PatternSource::Compiled(&p);

        assert!(find_at(source, "#!/bin/sh", 0, Anchors::at(true, 0, None)).is_some());
        assert!(find_at(source, "#!/bin/sh", 0, Anchors::at(false, 0, None)).is_none());
    }

    #[test]
    fn test_substitute_keeps_escaped_backslash() {
        let out = substitute_anchors(r"\\G\G", Anchors::default());
        assert_eq!(out, r"\\G\x{FFFF}");
        assert!(!has_anchors(r"a\\b"));
        assert!(has_anchors(r"(?=\G)"));
    }

    #[test]
    fn test_lookbehind_sees_text_before_pos() {
        let p = CompiledPattern::new(r"(?<=\.)\w+");
        let m = find_at(PatternSource::Compiled(&p), "a.b", 2, Anchors::default()).unwrap();
        assert_eq!((m.start, m.end), (2, 3));
    }

    #[test]
    fn test_has_back_references() {
        assert!(has_back_references(r"\1"));
        assert!(has_back_references(r"^\s*\2\b"));
        assert!(!has_back_references(r"\\1"));
        assert!(!has_back_references(r"\w+"));
    }

    #[test]
    fn test_resolve_back_references() {
        let haystack = "<<EOF.x";
        let captures = vec![Some(0..5), Some(2..5)];
        assert_eq!(resolve_back_references(r"^\1$", haystack, &captures), "^EOF$");

        let haystack = "q{a.b}";
        let captures = vec![Some(0..6), Some(2..5)];
        assert_eq!(resolve_back_references(r"\1", haystack, &captures), r"a\.b");
    }

    #[test]
    fn test_unresolved_back_reference_never_matches() {
        let captures = vec![Some(0..1), None];
        let resolved = resolve_back_references(r"\1|end", "x", &captures);
        assert_eq!(resolved, NEVER_MATCH);
        let m = find_at(
            PatternSource::Dynamic(&resolved),
            "end",
            0,
            Anchors::default(),
        );
        assert!(m.is_none());
    }

    #[test]
    fn test_invalid_dynamic_pattern_compiles_once() {
        regex_cache::clear_cache();

        let candidates = [PatternSource::Dynamic("(unclosed")];
        for pos in 0..3 {
            assert!(scan(&candidates, "abc", pos, Anchors::default()).is_none());
        }
        let stats = regex_cache::stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("a+b"), r"a\+b");
        assert_eq!(escape_literal("x y"), r"x\ y");
    }
}
