//! Token dumps for debugging grammars
//!
//! Renders tokens one per line:
//!
//! ```text
//! Token from 0 to 3 with scopes [source.js, storage.type.js]
//! Token from 3 to 4 with scopes [source.js]
//! ```

use super::tokenizer::{LineTokens, Token};
use std::fmt::Write;

/// Render tokens in the plain dump format
pub fn format_tokens(line: &str, tokens: &[Token]) -> String {
    TokenPrinter::new().print(line, tokens)
}

/// Token dump printer
#[derive(Debug, Clone, Default)]
pub struct TokenPrinter {
    /// Append the covered text to each token
    show_text: bool,
    /// Print only the innermost scope
    innermost_only: bool,
}

impl TokenPrinter {
    /// Create a printer producing the plain format
    pub fn new() -> Self {
        Self::default()
    }

    /// Include the covered text of each token
    pub fn show_text(mut self, show: bool) -> Self {
        self.show_text = show;
        self
    }

    /// Print only the innermost scope of each token
    pub fn innermost_only(mut self, innermost: bool) -> Self {
        self.innermost_only = innermost;
        self
    }

    /// Render the tokens of one line
    pub fn print(&self, line: &str, tokens: &[Token]) -> String {
        let mut output = String::new();
        for token in tokens {
            self.print_token(line, token, &mut output);
        }
        output
    }

    /// Render consecutive lines, each preceded by a header with its number
    pub fn print_lines<'l>(&self, lines: impl IntoIterator<Item = (&'l str, &'l LineTokens)>) -> String {
        let mut output = String::new();
        for (index, (line, result)) in lines.into_iter().enumerate() {
            let _ = writeln!(output, "Line {}: {:?}", index + 1, line);
            if result.stopped_early {
                output.push_str("  (stopped early)\n");
            }
            for token in &result.tokens {
                output.push_str("  ");
                self.print_token(line, token, &mut output);
            }
        }
        output
    }

    fn print_token(&self, line: &str, token: &Token, output: &mut String) {
        let scopes = if self.innermost_only {
            token.scopes.last().cloned().unwrap_or_default()
        } else {
            token.scopes.join(", ")
        };
        let _ = write!(
            output,
            "Token from {} to {} with scopes [{}]",
            token.start, token.end, scopes
        );
        if self.show_text {
            let _ = write!(output, " {:?}", token.text(line));
        }
        output.push('\n');
    }
}
