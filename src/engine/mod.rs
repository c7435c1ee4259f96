//! TextMate grammar engine
//!
//! This module contains the complete tokenization engine:
//! - Raw grammar model (`raw`) read from `.tmLanguage.json` documents
//! - Compiled grammars with an arena of rules (`grammar`)
//! - Grammar registry with lazy loading of external grammars (`registry`)
//! - Oniguruma pattern scanning (`pattern`, `regex_cache`)
//! - Persistent scope stacks shared between line states (`stack`)
//! - The line tokenizer (`tokenizer`)
//! - Scope selectors and injections (`selector`, `injection`)
//! - The incremental document driver (`document`)
//! - Batch tokenization of independent documents (`parallel`)
//! - Human-readable token dumps (`debug`)

/// Logging macros - no-op when logging feature is disabled
#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

/// Logging macros - use log crate when logging feature is enabled
#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => { log::warn!($($arg)*) };
}

pub mod debug;
pub mod document;
pub mod error;
pub mod grammar;
pub mod injection;
pub mod parallel;
pub mod pattern;
pub mod raw;
pub mod regex_cache;
pub mod registry;
pub mod selector;
pub mod stack;
pub mod tokenizer;

pub use debug::{format_tokens, TokenPrinter};
pub use document::{Document, LineEdit};
pub use error::{GrammarError, PatternCompileError, TokenizeError};
pub use grammar::{Grammar, GrammarId, Rule, RuleId, RuleRef};
pub use injection::Injection;
pub use pattern::{CompiledPattern, ScanMatch};
pub use raw::{RawCaptures, RawGrammar, RawRule};
pub use registry::{GrammarProvider, GrammarSource, Registry};
pub use selector::{parse_selector, InjectionPriority, SelectorMatcher};
pub use stack::{LineState, ScopeList, ScopeStack};
pub use tokenizer::{CancellationToken, LineTokens, Token, Tokenizer, TokenizerConfig};
