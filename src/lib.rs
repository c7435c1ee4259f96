//! tmscope - TextMate grammar tokenizer
//!
//! Tokenizes text line by line with TextMate grammars (`.tmLanguage.json`),
//! producing for every line a list of tokens annotated with scope names.
//! It provides:
//! - Grammar loading and compilation with includes across grammars
//! - Oniguruma pattern matching with `\A`/`\G` anchors and backreferences
//! - Persistent line states that can be compared and shared cheaply
//! - Injections driven by scope selectors (`L:`/`R:` priorities)
//! - Incremental re-tokenization of edited documents
//! - Optional batch tokenization over a thread pool
//!
//! ## Quick Start
//!
//! ```rust
//! use tmscope::engine::{Registry, Tokenizer};
//!
//! let grammar_json = r#"{
//!     "scopeName": "source.demo",
//!     "patterns": [
//!         { "match": "\\b(let|const)\\b", "name": "storage.type.demo" },
//!         { "begin": "\"", "end": "\"", "name": "string.quoted.double.demo" }
//!     ]
//! }"#;
//!
//! let mut registry = Registry::new();
//! registry.add_grammar_json(grammar_json).unwrap();
//!
//! let tokenizer = Tokenizer::new(&registry, "source.demo").unwrap();
//! let result = tokenizer.tokenize_line("let s = \"hi\"", None);
//!
//! assert_eq!(result.tokens[0].scopes, vec!["source.demo", "storage.type.demo"]);
//! ```
//!
//! ## Feature Flags
//!
//! - `logging` - Enable debug logging using the `log` crate
//! - `parallel` - Tokenize independent documents on the rayon thread pool

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::module_inception)]

// Prelude module for convenient imports
pub mod prelude;

pub mod engine;

/// Re-export commonly used types for convenience
pub use engine::{
    // Debug tools
    debug::{format_tokens, TokenPrinter},
    // Incremental documents
    document::{Document, LineEdit},
    // Errors
    error::{GrammarError, PatternCompileError, TokenizeError},
    // Grammars
    grammar::{Grammar, GrammarId},
    raw::{RawGrammar, RawRule},
    registry::{GrammarProvider, GrammarSource, Registry},
    // Tokenizing
    stack::LineState,
    tokenizer::{CancellationToken, LineTokens, Token, Tokenizer, TokenizerConfig},
};
