//! Batch tokenization of independent documents
//!
//! Lines of one document depend on each other through their states, so
//! parallelism only applies across documents. With the `parallel` feature
//! the documents are spread over the rayon thread pool; without it they are
//! tokenized one after another with the same results.
//!
//! ```rust
//! use tmscope::engine::{parallel::tokenize_batch, Registry, Tokenizer};
//!
//! let mut registry = Registry::new();
//! registry.add_grammar_json(r#"{
//!     "scopeName": "source.demo",
//!     "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
//! }"#).unwrap();
//! let tokenizer = Tokenizer::new(&registry, "source.demo").unwrap();
//!
//! let results = tokenize_batch(&tokenizer, &["1 2", "a\nb 3"]);
//! assert_eq!(results.len(), 2);
//! assert_eq!(results[1].len(), 2);
//! ```

use super::document::split_lines;
use super::tokenizer::{LineTokens, Tokenizer};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Tokenize every line of one document from the initial state
pub fn tokenize_text(tokenizer: &Tokenizer<'_>, text: &str) -> Vec<LineTokens> {
    let lines = split_lines(text);
    tokenizer.tokenize_lines(lines.iter().map(String::as_str))
}

/// Tokenize several documents in parallel
///
/// Results are in the same order as `documents`.
#[cfg(feature = "rayon")]
pub fn tokenize_batch(tokenizer: &Tokenizer<'_>, documents: &[&str]) -> Vec<Vec<LineTokens>> {
    documents
        .par_iter()
        .map(|text| tokenize_text(tokenizer, text))
        .collect()
}

/// Tokenize several documents sequentially (fallback without rayon)
#[cfg(not(feature = "rayon"))]
pub fn tokenize_batch(tokenizer: &Tokenizer<'_>, documents: &[&str]) -> Vec<Vec<LineTokens>> {
    documents
        .iter()
        .map(|text| tokenize_text(tokenizer, text))
        .collect()
}

/// Tokenize several owned documents
#[cfg(feature = "rayon")]
pub fn tokenize_batch_owned(tokenizer: &Tokenizer<'_>, documents: Vec<String>) -> Vec<Vec<LineTokens>> {
    documents
        .into_par_iter()
        .map(|text| tokenize_text(tokenizer, &text))
        .collect()
}

/// Tokenize several owned documents sequentially (fallback)
#[cfg(not(feature = "rayon"))]
pub fn tokenize_batch_owned(tokenizer: &Tokenizer<'_>, documents: Vec<String>) -> Vec<Vec<LineTokens>> {
    documents
        .into_iter()
        .map(|text| tokenize_text(tokenizer, &text))
        .collect()
}
