//! Incremental document tokenization
//!
//! A [`Document`] keeps, for every line, the tokens and the state after the
//! line. Lines are tokenized lazily, in order, the first time they are
//! asked for.
//!
//! # Edits
//!
//! An edit replaces a block of lines. Tokenization restarts at the first
//! edited line with the state after the line before it, and stops as soon as
//! a line produces the same end state it produced before the edit: from
//! there on nothing can change.
//!
//! ```text
//!  line  before      after edit of line 5
//!  0-4   valid       valid (untouched)
//!  5     valid       re-tokenized, end state == old end state
//!  6-9   valid       valid (reused)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use tmscope::engine::{Document, Registry, Tokenizer};
//!
//! let mut registry = Registry::new();
//! registry.add_grammar_json(r#"{
//!     "scopeName": "source.demo",
//!     "patterns": [{ "begin": "/\\*", "end": "\\*/", "name": "comment.block" }]
//! }"#).unwrap();
//! let tokenizer = Tokenizer::new(&registry, "source.demo").unwrap();
//!
//! let mut doc = Document::new(&tokenizer, "a\nb\nc");
//! doc.tokenize_all();
//!
//! // Opening a comment on line 0 changes every following line
//! let changed = doc.apply_edit(0, 0, &["/* a"]);
//! assert_eq!(changed, vec![0, 1, 2]);
//! ```

use super::error::TokenizeError;
use super::stack::LineState;
use super::tokenizer::{CancellationToken, LineTokens, Token, Tokenizer};

/// A change to the lines of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEdit {
    /// First line affected
    pub start_line: usize,
    /// Number of lines removed
    pub old_count: usize,
    /// Number of lines inserted in their place
    pub new_count: usize,
}

impl LineEdit {
    /// Create a new edit
    #[inline]
    pub fn new(start_line: usize, old_count: usize, new_count: usize) -> Self {
        Self {
            start_line,
            old_count,
            new_count,
        }
    }

    /// Insert `count` lines before `line`
    #[inline]
    pub fn insert(line: usize, count: usize) -> Self {
        Self::new(line, 0, count)
    }

    /// Delete `count` lines starting at `line`
    #[inline]
    pub fn delete(line: usize, count: usize) -> Self {
        Self::new(line, count, 0)
    }

    /// Replace `old_count` lines starting at `line` with `new_count` lines
    #[inline]
    pub fn replace(line: usize, old_count: usize, new_count: usize) -> Self {
        Self::new(line, old_count, new_count)
    }

    /// Change in line count
    #[inline]
    pub fn delta(&self) -> isize {
        self.new_count as isize - self.old_count as isize
    }

    /// Removed lines, in old line numbers
    #[inline]
    pub fn old_range(&self) -> std::ops::Range<usize> {
        self.start_line..self.start_line + self.old_count
    }

    /// Inserted lines, in new line numbers
    #[inline]
    pub fn new_range(&self) -> std::ops::Range<usize> {
        self.start_line..self.start_line + self.new_count
    }
}

#[derive(Debug, Clone)]
struct LineEntry {
    tokens: Vec<Token>,
    state_after: LineState,
}

impl From<LineTokens> for LineEntry {
    fn from(result: LineTokens) -> Self {
        LineEntry {
            tokens: result.tokens,
            state_after: result.state,
        }
    }
}

/// Split text into lines, accepting both LF and CRLF
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut start = 0;
    for newline in memchr::memchr_iter(b'\n', text.as_bytes()) {
        let line = &text[start..newline];
        lines.push(line.strip_suffix('\r').unwrap_or(line).to_string());
        start = newline + 1;
    }
    let last = &text[start..];
    lines.push(last.strip_suffix('\r').unwrap_or(last).to_string());
    lines
}

/// A tokenized document owned by one editor buffer
pub struct Document<'a> {
    tokenizer: &'a Tokenizer<'a>,
    lines: Vec<String>,
    entries: Vec<Option<LineEntry>>,
    /// Lines from here on have no valid entry
    invalid_from: usize,
}

impl<'a> Document<'a> {
    /// Create a document from text; nothing is tokenized yet
    pub fn new(tokenizer: &'a Tokenizer<'a>, text: &str) -> Self {
        Self::from_lines(tokenizer, split_lines(text))
    }

    /// Create a document from lines without terminators
    pub fn from_lines(tokenizer: &'a Tokenizer<'a>, lines: Vec<String>) -> Self {
        let entries = vec![None; lines.len()];
        Document {
            tokenizer,
            lines,
            entries,
            invalid_from: 0,
        }
    }

    #[inline]
    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    #[inline]
    pub fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    #[inline]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The document text with LF line endings
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// First line whose tokens are not up to date
    #[inline]
    pub fn invalid_from(&self) -> usize {
        self.invalid_from
    }

    /// Tokens of a line if they are up to date
    pub fn tokens(&self, index: usize) -> Option<&[Token]> {
        self.valid_entry(index).map(|e| e.tokens.as_slice())
    }

    /// State after a line if it is up to date
    pub fn state_after(&self, index: usize) -> Option<&LineState> {
        self.valid_entry(index).map(|e| &e.state_after)
    }

    fn valid_entry(&self, index: usize) -> Option<&LineEntry> {
        if index >= self.invalid_from {
            return None;
        }
        self.entries.get(index).and_then(Option::as_ref)
    }

    /// Tokens of a line, tokenizing it and every invalid line before it
    ///
    /// Returns an empty slice for an index past the end of the document.
    pub fn tokenize_line(&mut self, index: usize) -> &[Token] {
        if index >= self.lines.len() {
            return &[];
        }
        self.validate_through(index);
        self.entries[index]
            .as_ref()
            .map_or(&[][..], |e| e.tokens.as_slice())
    }

    /// Tokenize every invalid line
    pub fn tokenize_all(&mut self) {
        if let Some(last) = self.lines.len().checked_sub(1) {
            self.validate_through(last);
        }
    }

    fn state_before(&self, index: usize) -> LineState {
        match index.checked_sub(1).and_then(|prev| self.state_after(prev)) {
            Some(state) => state.clone(),
            None => self.tokenizer.initial_state(),
        }
    }

    fn tokenize_at(
        &self,
        index: usize,
        state: &LineState,
        cancel: Option<&CancellationToken>,
    ) -> Result<LineTokens, TokenizeError> {
        let line = &self.lines[index];
        match cancel {
            Some(cancel) => self
                .tokenizer
                .tokenize_line_with_cancel(line, Some(state), index, cancel),
            None => Ok(self.tokenizer.tokenize_line(line, Some(state))),
        }
    }

    fn validate_through(&mut self, index: usize) {
        while self.invalid_from <= index && self.invalid_from < self.lines.len() {
            let i = self.invalid_from;
            let state = self.state_before(i);
            let result = self.tokenizer.tokenize_line(&self.lines[i], Some(&state));
            self.entries[i] = Some(result.into());
            self.invalid_from = i + 1;
        }
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Replace lines `start_line..=end_line` with `new_lines`
    ///
    /// Returns the indices (in new line numbers) of the lines that were
    /// re-tokenized, in order.
    pub fn apply_edit(&mut self, start_line: usize, end_line: usize, new_lines: &[&str]) -> Vec<usize> {
        let edit = LineEdit::replace(
            start_line,
            end_line.saturating_sub(start_line) + 1,
            new_lines.len(),
        );
        self.apply_line_edit(edit, new_lines)
    }

    /// Like [`apply_edit`](Self::apply_edit), checking `cancel` between steps
    ///
    /// On cancellation the lines from the interrupted one on are left
    /// invalid and will be tokenized again on demand.
    pub fn apply_edit_with_cancel(
        &mut self,
        start_line: usize,
        end_line: usize,
        new_lines: &[&str],
        cancel: &CancellationToken,
    ) -> Result<Vec<usize>, TokenizeError> {
        let edit = LineEdit::replace(
            start_line,
            end_line.saturating_sub(start_line) + 1,
            new_lines.len(),
        );
        self.edit(edit, new_lines, Some(cancel))
    }

    /// Apply a [`LineEdit`]; `new_lines.len()` must equal `edit.new_count`
    pub fn apply_line_edit(&mut self, edit: LineEdit, new_lines: &[&str]) -> Vec<usize> {
        // Without a cancellation token tokenization cannot fail
        self.edit(edit, new_lines, None).unwrap_or_default()
    }

    fn edit(
        &mut self,
        edit: LineEdit,
        new_lines: &[&str],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<usize>, TokenizeError> {
        let start = edit.start_line.min(self.lines.len());
        let old_count = edit.old_count.min(self.lines.len() - start);
        let new_count = new_lines.len();
        let old_end = start + old_count;

        // The state before the edit must be known
        if start > 0 {
            self.validate_through(start - 1);
        }

        // State after the old block, if it was up to date
        let old_block_end_state = match old_end.checked_sub(1) {
            None => Some(self.tokenizer.initial_state()),
            Some(last) => self.state_after(last).cloned(),
        };

        // Lines after the block keep their entries; those that were valid stay valid
        let valid_limit = if self.invalid_from >= old_end {
            self.invalid_from - old_count + new_count
        } else {
            start + new_count
        };

        self.lines.splice(
            start..old_end,
            new_lines.iter().map(|line| line.to_string()),
        );
        self.entries
            .splice(start..old_end, std::iter::repeat(None).take(new_count));
        self.invalid_from = start;

        log_debug!(
            "Edit at line {}: -{} +{} lines, {} valid after",
            start,
            old_count,
            new_count,
            valid_limit
        );

        let block_end = start + new_count;
        let mut changed = Vec::new();

        if new_count == 0 {
            let before = self.state_before(start);
            if old_block_end_state.as_ref() == Some(&before) {
                self.invalid_from = valid_limit.max(start);
                return Ok(changed);
            }
        }

        let mut i = start;
        while i < self.lines.len() {
            let state = self.state_before(i);
            let result = self.tokenize_at(i, &state, cancel)?;
            let new_state = result.state.clone();

            let unchanged = if i + 1 == block_end {
                old_block_end_state.as_ref() == Some(&new_state)
            } else if i >= block_end && i < valid_limit {
                self.entries[i]
                    .as_ref()
                    .is_some_and(|old| old.state_after == new_state)
            } else {
                false
            };

            self.entries[i] = Some(result.into());
            self.invalid_from = i + 1;
            changed.push(i);

            if i >= block_end.saturating_sub(1) {
                if unchanged {
                    self.invalid_from = valid_limit.max(i + 1);
                    break;
                }
                if i + 1 >= valid_limit {
                    // Nothing after this line was tokenized before the edit
                    break;
                }
            }
            i += 1;
        }

        Ok(changed)
    }
}

impl std::fmt::Debug for Document<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("lines", &self.lines.len())
            .field("invalid_from", &self.invalid_from)
            .finish()
    }
}
