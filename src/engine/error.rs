//! Error types for grammar loading and tokenization
//!
//! Grammar problems are reported once, when a grammar is compiled or loaded
//! into a [`Registry`](super::registry::Registry). Tokenization itself never
//! fails on grammar content: a pattern that does not compile is logged and
//! treated as never matching, and "no match at this position" is ordinary
//! control flow. The only tokenization error is cooperative cancellation.

use std::fmt;

/// Error raised while reading, compiling or loading a grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    /// The grammar document is not valid TextMate JSON
    Json {
        /// Message from the JSON deserializer
        message: String,
    },

    /// The grammar file could not be read
    Io {
        /// Path of the grammar file
        path: String,
        /// Message from the I/O error
        message: String,
    },

    /// The grammar has no `scopeName`
    MissingScopeName,

    /// An `include` names a repository entry that does not exist
    UnresolvedInclude {
        /// Scope name of the grammar containing the include
        grammar: String,
        /// The include reference as written in the grammar
        include: String,
    },

    /// A rule has an inconsistent combination of keys
    MalformedRule {
        /// Scope name of the grammar containing the rule
        grammar: String,
        /// What is wrong with the rule
        reason: String,
    },

    /// A grammar is referenced but not available in the registry
    UnknownGrammar {
        /// The scope name that could not be found
        scope_name: String,
    },
}

impl GrammarError {
    /// Create a malformed-rule error
    #[inline]
    pub fn malformed(grammar: &str, reason: impl Into<String>) -> Self {
        GrammarError::MalformedRule {
            grammar: grammar.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an unresolved-include error
    #[inline]
    pub fn unresolved(grammar: &str, include: &str) -> Self {
        GrammarError::UnresolvedInclude {
            grammar: grammar.to_string(),
            include: include.to_string(),
        }
    }
}

impl fmt::Display for GrammarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarError::Json { message } => write!(f, "Invalid grammar JSON: {}", message),
            GrammarError::Io { path, message } => {
                write!(f, "Cannot read grammar '{}': {}", path, message)
            }
            GrammarError::MissingScopeName => write!(f, "Grammar has no scopeName"),
            GrammarError::UnresolvedInclude { grammar, include } => write!(
                f,
                "Unresolved include '{}' in grammar '{}'",
                include, grammar
            ),
            GrammarError::MalformedRule { grammar, reason } => {
                write!(f, "Malformed rule in grammar '{}': {}", grammar, reason)
            }
            GrammarError::UnknownGrammar { scope_name } => {
                write!(f, "No grammar registered for scope '{}'", scope_name)
            }
        }
    }
}

impl std::error::Error for GrammarError {}

impl From<serde_json::Error> for GrammarError {
    fn from(err: serde_json::Error) -> Self {
        GrammarError::Json {
            message: err.to_string(),
        }
    }
}

/// A rule's regular expression failed to compile
///
/// Never fatal: the owning pattern becomes permanently non-matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternCompileError {
    /// Pattern source as handed to the regex engine
    pub pattern: String,
    /// Message from the regex engine
    pub message: String,
}

impl fmt::Display for PatternCompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cannot compile pattern '{}': {}",
            self.pattern, self.message
        )
    }
}

impl std::error::Error for PatternCompileError {}

/// Error returned by cancellable tokenization entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizeError {
    /// The caller's cancellation token was triggered between two steps
    Cancelled {
        /// Index of the line being tokenized when cancellation was seen
        line: usize,
    },
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizeError::Cancelled { line } => {
                write!(f, "Tokenization cancelled at line {}", line)
            }
        }
    }
}

impl std::error::Error for TokenizeError {}
