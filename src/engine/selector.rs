//! Scope selectors
//!
//! Selectors decide where an injection applies. The syntax is the one
//! TextMate and editors share:
//!
//! - `source.js string` descendant path: both scopes present, in order
//! - `a, b` or `a | b` alternatives
//! - `a - b` exclusion
//! - `(a | b) c` grouping
//! - `L:` / `R:` prefix on a top-level alternative sets injection priority
//!
//! A selector segment matches a scope when it is equal to it or a dotted
//! prefix of it (`string` matches `string.quoted.double`).

use std::fmt;

/// Where an injection ranks against the host grammar's own patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InjectionPriority {
    /// `L:`: wins ties with the host
    Left,
    /// No prefix: wins only when strictly leftmost
    Default,
    /// `R:`: used only when the host has no match
    Right,
}

impl fmt::Display for InjectionPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionPriority::Left => write!(f, "L:"),
            InjectionPriority::Default => Ok(()),
            InjectionPriority::Right => write!(f, "R:"),
        }
    }
}

/// Selector expression tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Path(Vec<String>),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    pub fn matches<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        match self {
            Expr::Path(segments) => path_matches(segments, scopes),
            Expr::Not(inner) => !inner.matches(scopes),
            Expr::And(all) => all.iter().all(|e| e.matches(scopes)),
            Expr::Or(any) => any.iter().any(|e| e.matches(scopes)),
        }
    }
}

#[inline]
fn segment_matches(segment: &str, scope: &str) -> bool {
    scope == segment
        || (scope.len() > segment.len()
            && scope.starts_with(segment)
            && scope.as_bytes()[segment.len()] == b'.')
}

fn path_matches<S: AsRef<str>>(segments: &[String], scopes: &[S]) -> bool {
    let mut scopes = scopes.iter();
    segments
        .iter()
        .all(|segment| scopes.any(|scope| segment_matches(segment, scope.as_ref())))
}

/// One top-level alternative of a selector with its priority
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorMatcher {
    pub priority: InjectionPriority,
    pub expr: Expr,
}

impl SelectorMatcher {
    #[inline]
    pub fn matches<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        self.expr.matches(scopes)
    }
}

// ============================================================================
// Parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Priority(InjectionPriority),
    Ident(String),
    Comma,
    Pipe,
    Minus,
    Open,
    Close,
}

fn is_ident_start(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | ':')
}

fn lex(selector: &str) -> Vec<Tok> {
    let chars: Vec<char> = selector.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if matches!(c, 'L' | 'R') && chars.get(i + 1) == Some(&':') {
            tokens.push(Tok::Priority(if c == 'L' {
                InjectionPriority::Left
            } else {
                InjectionPriority::Right
            }));
            i += 2;
            continue;
        }
        let punct = match c {
            ',' => Some(Tok::Comma),
            '|' => Some(Tok::Pipe),
            '-' => Some(Tok::Minus),
            '(' => Some(Tok::Open),
            ')' => Some(Tok::Close),
            _ => None,
        };
        if let Some(tok) = punct {
            tokens.push(tok);
            i += 1;
            continue;
        }
        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && (is_ident_start(chars[i]) || chars[i] == '-') {
                i += 1;
            }
            tokens.push(Tok::Ident(chars[start..i].iter().collect()));
            continue;
        }
        // Unknown character: skip it
        i += 1;
    }

    tokens
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    #[inline]
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    #[inline]
    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn operand(&mut self) -> Option<Expr> {
        match self.peek()? {
            Tok::Minus => {
                self.bump();
                let inner = self.operand()?;
                Some(Expr::Not(Box::new(inner)))
            }
            Tok::Open => {
                self.bump();
                let inner = self.inner_expression();
                if self.peek() == Some(&Tok::Close) {
                    self.bump();
                }
                Some(inner)
            }
            Tok::Ident(_) => {
                let mut segments = Vec::new();
                while let Some(Tok::Ident(name)) = self.peek() {
                    segments.push(name.clone());
                    self.bump();
                }
                Some(Expr::Path(segments))
            }
            _ => None,
        }
    }

    fn conjunction(&mut self) -> Expr {
        let mut operands = Vec::new();
        while let Some(expr) = self.operand() {
            operands.push(expr);
        }
        if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::And(operands)
        }
    }

    fn inner_expression(&mut self) -> Expr {
        let mut alternatives = vec![self.conjunction()];
        while matches!(self.peek(), Some(Tok::Pipe | Tok::Comma)) {
            self.bump();
            alternatives.push(self.conjunction());
        }
        if alternatives.len() == 1 {
            alternatives.remove(0)
        } else {
            Expr::Or(alternatives)
        }
    }
}

/// Parse a selector into its top-level alternatives
///
/// Each alternative carries its own priority, so `L:a, b` yields a left
/// matcher for `a` and a default one for `b`. Unparseable input yields no
/// matchers rather than an error.
pub fn parse_selector(selector: &str) -> Vec<SelectorMatcher> {
    let mut parser = Parser {
        tokens: lex(selector),
        pos: 0,
    };
    let mut matchers = Vec::new();

    while parser.peek().is_some() {
        let priority = match parser.peek() {
            Some(Tok::Priority(p)) => {
                let p = *p;
                parser.bump();
                p
            }
            _ => InjectionPriority::Default,
        };

        let expr = parser.conjunction();
        let is_empty = matches!(&expr, Expr::And(v) if v.is_empty());
        if !is_empty {
            matchers.push(SelectorMatcher { priority, expr });
        }

        match parser.peek() {
            Some(Tok::Comma) => {
                parser.bump();
            }
            // A stray token that no operand accepts
            Some(_) if is_empty => {
                parser.bump();
            }
            Some(_) => {}
            None => break,
        }
    }

    matchers
}
