//! Prelude module for convenient imports
//!
//! Importing this module with a wildcard import brings the core types into
//! scope:
//!
//! ```
//! use tmscope::prelude::*;
//! ```
//!
//! # Re-exported Items
//!
//! ## Grammars
//! - [`Registry`] - Holds compiled grammars and their injections
//! - [`RawGrammar`] - A grammar document as read from JSON
//! - [`GrammarProvider`] - Source of grammars loaded on demand
//!
//! ## Tokenizing
//! - [`Tokenizer`] - Tokenizes lines with one grammar
//! - [`TokenizerConfig`] - Time and line length limits
//! - [`Token`] - A scoped span of a line
//! - [`LineState`] - State carried between lines
//! - [`Document`] - Lazily and incrementally tokenized lines
//!
//! ## Error Handling
//! - [`GrammarError`] - Loading or compilation failure
//! - [`TokenizeError`] - Interrupted tokenization

// ============================================================================
// Grammars
// ============================================================================

pub use crate::engine::{GrammarProvider, GrammarSource, RawGrammar, RawRule, Registry};

// ============================================================================
// Tokenizing
// ============================================================================

pub use crate::engine::{
    CancellationToken, Document, LineEdit, LineState, LineTokens, Token, Tokenizer,
    TokenizerConfig,
};

// ============================================================================
// Error Handling
// ============================================================================

pub use crate::engine::{GrammarError, TokenizeError};
