//! Line tokenizer
//!
//! Turns one line of text and the state left by the previous line into a
//! sequence of scoped tokens and the state for the next line.
//!
//! Each step looks for the leftmost match among:
//! - the end pattern of the innermost open begin/end rule
//! - the patterns nested in that rule (includes expanded)
//! - injections whose selector matches the current scopes
//!
//! and then emits tokens, pushes or pops a frame, and advances. When nothing
//! matches, the rest of the line becomes one token.
//!
//! Matching runs against the line with a `\n` appended, so patterns that
//! look for the end of line behave as they do in editors. Tokens never
//! extend past the line itself.
//!
//! # Example
//!
//! ```
//! use tmscope::engine::{Registry, Tokenizer};
//!
//! let mut registry = Registry::new();
//! registry.add_grammar_json(r#"{
//!     "scopeName": "source.demo",
//!     "patterns": [{ "match": "\\d+", "name": "constant.numeric" }]
//! }"#).unwrap();
//!
//! let tokenizer = Tokenizer::new(&registry, "source.demo").unwrap();
//! let result = tokenizer.tokenize_line("x = 42", None);
//! assert_eq!(result.tokens.len(), 2);
//! assert_eq!(result.tokens[1].scopes, vec!["source.demo", "constant.numeric"]);
//! ```

use super::error::{GrammarError, TokenizeError};
use super::grammar::{Captures, FastMap, GrammarId, PatternRef, Rule, RuleRef, ScopeName};
use super::injection::{best_injection, prefer_injection, Injection};
use super::pattern::{resolve_back_references, scan, Anchors, PatternSource, ScanMatch};
use super::registry::Registry;
use super::stack::{LineState, ScopeList, ScopeStack, StackFrame};
use ahash::RandomState;
use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

// ============================================================================
// Configuration
// ============================================================================

/// Default time limit per line in milliseconds (0 = no limit)
pub const DEFAULT_TIME_LIMIT_MS: u64 = 0;

/// Default maximum line length in bytes (0 = no limit)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 0;

/// Number of steps between two clock reads
const TIME_CHECK_INTERVAL: usize = 64;

/// Nesting limit for captures re-tokenized with their own patterns
const MAX_CAPTURE_DEPTH: usize = 32;

/// Limits applied while tokenizing a line
///
/// # Example
///
/// ```rust
/// use tmscope::engine::TokenizerConfig;
///
/// let config = TokenizerConfig::new()
///     .with_time_limit_ms(500)
///     .with_max_line_length(20_000);
/// assert_eq!(config.time_limit_ms, 500);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerConfig {
    /// Time budget per line in milliseconds (0 = no limit)
    ///
    /// A line that runs out of time is finished as a single token and
    /// reported with `stopped_early`.
    pub time_limit_ms: u64,

    /// Lines longer than this many bytes are not tokenized (0 = no limit)
    pub max_line_length: usize,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            time_limit_ms: DEFAULT_TIME_LIMIT_MS,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl TokenizerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time limit per line in milliseconds
    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    /// Set the maximum line length in bytes
    pub fn with_max_line_length(mut self, len: usize) -> Self {
        self.max_line_length = len;
        self
    }
}

/// Shared flag to stop tokenization from another thread
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

// ============================================================================
// Output
// ============================================================================

/// A scoped span of a line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    /// Byte offset of the first character
    pub start: usize,
    /// Byte offset after the last character
    pub end: usize,
    /// Scope names, outermost first
    pub scopes: Vec<String>,
}

impl Token {
    /// The text this token covers
    #[inline]
    pub fn text<'a>(&self, line: &'a str) -> &'a str {
        line.get(self.start..self.end).unwrap_or("")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether any scope equals `scope` or starts with `scope.`
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| {
            s == scope || (s.starts_with(scope) && s.as_bytes().get(scope.len()) == Some(&b'.'))
        })
    }
}

/// Result of tokenizing one line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineTokens {
    pub tokens: Vec<Token>,
    /// State at the end of the line
    #[serde(skip)]
    pub state: LineState,
    /// The line hit a limit and was finished as one token
    pub stopped_early: bool,
}

struct TokenAccumulator {
    tokens: Vec<Token>,
    last_end: usize,
    line_len: usize,
}

impl TokenAccumulator {
    fn new(line_len: usize) -> Self {
        TokenAccumulator {
            tokens: Vec::new(),
            last_end: 0,
            line_len,
        }
    }

    /// Emit a token from the previous end to `end`
    #[inline]
    fn produce(&mut self, end: usize, scopes: &ScopeList) {
        let end = end.min(self.line_len);
        if end <= self.last_end {
            return;
        }
        self.tokens.push(Token {
            start: self.last_end,
            end,
            scopes: scopes.to_vec(),
        });
        self.last_end = end;
    }

    fn finish(mut self, scopes: &ScopeList) -> Vec<Token> {
        self.produce(self.line_len, scopes);
        if self.tokens.is_empty() {
            self.tokens.push(Token {
                start: 0,
                end: 0,
                scopes: scopes.to_vec(),
            });
        }
        self.tokens
    }
}

// ============================================================================
// Step control
// ============================================================================

enum Interrupt {
    Cancelled,
    TimedOut,
}

struct StepContext<'c> {
    cancel: Option<&'c CancellationToken>,
    deadline: Option<Instant>,
    steps: usize,
}

impl<'c> StepContext<'c> {
    fn new(config: &TokenizerConfig, cancel: Option<&'c CancellationToken>) -> Self {
        let deadline = (config.time_limit_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(config.time_limit_ms));
        StepContext {
            cancel,
            deadline,
            steps: 0,
        }
    }

    #[inline]
    fn step(&mut self) -> Result<(), Interrupt> {
        self.steps += 1;
        if self.cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(Interrupt::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if self.steps % TIME_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
                return Err(Interrupt::TimedOut);
            }
        }
        Ok(())
    }
}

/// Mutable position state while scanning one (sub)string
struct LineRun<'a> {
    haystack: &'a str,
    line_len: usize,
    first_line: bool,
    pos: usize,
    /// `\G` position
    anchor: Option<usize>,
    /// Lowest stack depth seen since the run started; frames above it were
    /// pushed during this run and carry valid positions
    floor: usize,
    stack: ScopeStack,
    capture_depth: usize,
}

impl LineRun<'_> {
    #[inline]
    fn anchors(&self) -> Anchors {
        Anchors::at(self.first_line, self.pos, self.anchor)
    }

    #[inline]
    fn pushed_here(&self, stack: &ScopeStack) -> bool {
        stack.depth() > self.floor
    }

    fn set_stack(&mut self, stack: ScopeStack) {
        self.floor = self.floor.min(stack.depth());
        self.stack = stack;
    }

    fn advance_to(&mut self, end: usize) {
        if end > self.pos {
            self.pos = end;
            self.first_line = false;
        }
    }

    /// Step over one character when a match made no progress
    fn force_advance(&mut self) {
        let width = self
            .haystack
            .get(self.pos..)
            .and_then(|rest| rest.chars().next())
            .map_or(1, char::len_utf8);
        self.pos += width;
        self.first_line = false;
    }
}

enum Winner {
    End(ScanMatch),
    Rule(RuleRef, ScanMatch),
}

fn apply_name(
    base: &ScopeList,
    name: Option<&ScopeName>,
    haystack: &str,
    captures: &[Option<Range<usize>>],
) -> ScopeList {
    match name {
        Some(name) => base.push_all(name.resolve(haystack, captures)),
        None => base.clone(),
    }
}

// ============================================================================
// Tokenizer
// ============================================================================

type CandidateCache = FastMap<RuleRef, Arc<[RuleRef]>>;

/// Tokenizer for one grammar of a registry
///
/// Cheap to share between threads: all state lives in the registry and in
/// the line states passed in and out.
pub struct Tokenizer<'r> {
    registry: &'r Registry,
    base: GrammarId,
    injections: Vec<Injection>,
    config: TokenizerConfig,
    /// Rule → expanded, non-container candidate rules
    candidates: RwLock<CandidateCache>,
}

impl<'r> Tokenizer<'r> {
    /// Tokenizer for the grammar registered under `scope_name`
    ///
    /// # Errors
    /// `UnknownGrammar` if the grammar, or a grammar it includes, is missing.
    pub fn new(registry: &'r Registry, scope_name: &str) -> Result<Self, GrammarError> {
        let id = registry
            .grammar_id(scope_name)
            .ok_or_else(|| GrammarError::UnknownGrammar {
                scope_name: scope_name.to_string(),
            })?;
        Self::for_grammar(registry, id)
    }

    /// Tokenizer for a grammar id
    pub fn for_grammar(registry: &'r Registry, base: GrammarId) -> Result<Self, GrammarError> {
        registry.check_dependencies(base)?;
        let injections = registry.resolve_injections(base);
        log_debug!(
            "Tokenizer for '{}' with {} injections",
            registry.grammar(base).scope_name(),
            injections.len()
        );
        Ok(Tokenizer {
            registry,
            base,
            injections,
            config: TokenizerConfig::default(),
            candidates: RwLock::new(CandidateCache::default()),
        })
    }

    /// Replace the limits
    pub fn with_config(mut self, config: TokenizerConfig) -> Self {
        self.config = config;
        self
    }

    #[inline]
    pub fn config(&self) -> &TokenizerConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    #[inline]
    pub fn grammar_id(&self) -> GrammarId {
        self.base
    }

    #[inline]
    pub fn injections(&self) -> &[Injection] {
        &self.injections
    }

    /// State before the first line of a document
    pub fn initial_state(&self) -> LineState {
        let root = RuleRef::root(self.base);
        let scopes = apply_name(
            &ScopeList::new(),
            self.registry.rule(root).name(),
            "",
            &[],
        );
        LineState::new(ScopeStack::root(root, scopes), true)
    }

    /// Tokenize one line
    ///
    /// `line` must not contain line terminators. `state` is the state
    /// returned for the previous line, or `None` for the first line.
    pub fn tokenize_line(&self, line: &str, state: Option<&LineState>) -> LineTokens {
        let initial;
        let state = match state {
            Some(state) => state,
            None => {
                initial = self.initial_state();
                &initial
            }
        };
        let mut ctx = StepContext::new(&self.config, None);
        self.tokenize(line, state, &mut ctx)
            .unwrap_or_else(|_| self.unchanged(line, state, Vec::new()))
    }

    /// Tokenize one line, checking `cancel` between steps
    ///
    /// `line_index` is the line's position in its document and is reported
    /// back in [`TokenizeError::Cancelled`].
    pub fn tokenize_line_with_cancel(
        &self,
        line: &str,
        state: Option<&LineState>,
        line_index: usize,
        cancel: &CancellationToken,
    ) -> Result<LineTokens, TokenizeError> {
        let initial;
        let state = match state {
            Some(state) => state,
            None => {
                initial = self.initial_state();
                &initial
            }
        };
        let mut ctx = StepContext::new(&self.config, Some(cancel));
        self.tokenize(line, state, &mut ctx)
            .map_err(|_| TokenizeError::Cancelled { line: line_index })
    }

    /// Tokenize consecutive lines starting from the initial state
    pub fn tokenize_lines<'l>(&self, lines: impl IntoIterator<Item = &'l str>) -> Vec<LineTokens> {
        let mut state = self.initial_state();
        let mut out = Vec::new();
        for line in lines {
            let result = self.tokenize_line(line, Some(&state));
            state = result.state.clone();
            out.push(result);
        }
        out
    }

    /// Result for a line that was not (fully) tokenized
    ///
    /// `tokens` are kept; the rest of the line becomes one token with the
    /// scopes of the input state, which is returned unchanged.
    fn unchanged(&self, line: &str, state: &LineState, tokens: Vec<Token>) -> LineTokens {
        let mut acc = TokenAccumulator::new(line.len());
        acc.last_end = tokens.last().map_or(0, |t| t.end);
        acc.tokens = tokens;
        LineTokens {
            tokens: acc.finish(&state.stack.top().content_scopes),
            state: LineState::new(state.stack.clone(), false),
            stopped_early: true,
        }
    }

    /// Tokenize, mapping a timeout to an early stop; only cancellation fails
    fn tokenize(
        &self,
        line: &str,
        state: &LineState,
        ctx: &mut StepContext<'_>,
    ) -> Result<LineTokens, Interrupt> {
        if self.config.max_line_length > 0 && line.len() > self.config.max_line_length {
            log_debug!("Skipping line of {} bytes", line.len());
            return Ok(self.unchanged(line, state, Vec::new()));
        }

        let mut haystack = String::with_capacity(line.len() + 1);
        haystack.push_str(line);
        haystack.push('\n');

        let stack = state.stack.clone();
        let anchor = stack.top().begin_captured_eol.then_some(0);
        let mut run = LineRun {
            haystack: &haystack,
            line_len: line.len(),
            first_line: state.first_line,
            pos: 0,
            anchor,
            floor: stack.depth(),
            stack,
            capture_depth: 0,
        };
        let mut acc = TokenAccumulator::new(line.len());

        let outcome = self
            .check_while_conditions(&mut run, &mut acc, ctx)
            .and_then(|()| self.run_loop(&mut run, &mut acc, ctx));

        match outcome {
            Ok(()) => {
                let tokens = acc.finish(&run.stack.top().content_scopes);
                Ok(LineTokens {
                    tokens,
                    state: LineState::new(run.stack, false),
                    stopped_early: false,
                })
            }
            Err(Interrupt::TimedOut) => {
                log_warn!(
                    "Time limit of {}ms exceeded, line finished as one token",
                    self.config.time_limit_ms
                );
                Ok(self.unchanged(line, state, acc.tokens))
            }
            Err(interrupt) => Err(interrupt),
        }
    }

    fn run_loop(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
    ) -> Result<(), Interrupt> {
        while run.pos <= run.haystack.len() {
            ctx.step()?;
            if !self.scan_next(run, acc, ctx)? {
                break;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Candidates
    // ========================================================================

    fn resolve_pattern(&self, grammar: GrammarId, pattern: &PatternRef) -> Option<RuleRef> {
        match pattern {
            PatternRef::Rule(id) => Some(RuleRef::new(grammar, *id)),
            PatternRef::Base => Some(RuleRef::root(self.base)),
            PatternRef::External { scope_name, rule } => {
                let resolved = self.registry.external_rule(scope_name, rule.as_deref());
                if resolved.is_none() {
                    log_warn!("Cannot resolve include '{}' ({:?})", scope_name, rule);
                }
                resolved
            }
        }
    }

    fn expand_into(
        &self,
        owner: RuleRef,
        out: &mut Vec<RuleRef>,
        visited: &mut HashSet<RuleRef, RandomState>,
    ) {
        for pattern in self.registry.rule(owner).patterns() {
            let Some(target) = self.resolve_pattern(owner.grammar, pattern) else {
                continue;
            };
            if !visited.insert(target) {
                continue;
            }
            if self.registry.rule(target).is_container() {
                self.expand_into(target, out, visited);
            } else {
                out.push(target);
            }
        }
    }

    /// Matchable rules nested in `owner`, includes expanded
    fn candidates_of(&self, owner: RuleRef) -> Arc<[RuleRef]> {
        if let Ok(cache) = self.candidates.read() {
            if let Some(hit) = cache.get(&owner) {
                return Arc::clone(hit);
            }
        }

        let mut out = Vec::new();
        let mut visited = HashSet::default();
        // A begin/end rule may nest inside itself; only containers are skipped
        if self.registry.rule(owner).is_container() {
            visited.insert(owner);
        }
        self.expand_into(owner, &mut out, &mut visited);
        let expanded: Arc<[RuleRef]> = out.into();

        if let Ok(mut cache) = self.candidates.write() {
            cache.insert(owner, Arc::clone(&expanded));
        }
        expanded
    }

    /// Candidates contributed by an injection rule
    fn injection_candidates(&self, rule: RuleRef) -> Arc<[RuleRef]> {
        if self.registry.rule(rule).is_container() {
            self.candidates_of(rule)
        } else {
            Arc::from(vec![rule])
        }
    }

    fn scan_rules(&self, rules: &[RuleRef], run: &LineRun<'_>) -> Option<(RuleRef, ScanMatch)> {
        let sources: Vec<PatternSource<'_>> = rules
            .iter()
            .filter_map(|r| self.registry.rule(*r).entry_pattern())
            .map(PatternSource::Compiled)
            .collect();
        let refs: Vec<RuleRef> = rules
            .iter()
            .copied()
            .filter(|r| self.registry.rule(*r).entry_pattern().is_some())
            .collect();
        let m = scan(&sources, run.haystack, run.pos, run.anchors())?;
        Some((refs[m.index], m))
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Best match of the innermost rule: its end pattern and nested rules
    fn match_host(&self, run: &LineRun<'_>) -> Option<Winner> {
        let frame = run.stack.top();
        let rules = self.candidates_of(frame.rule);

        let end = match self.registry.rule(frame.rule) {
            Rule::BeginEnd(r) => Some((
                match &frame.end_source {
                    Some(source) => PatternSource::Dynamic(source),
                    None => PatternSource::Compiled(&r.end),
                },
                r.apply_end_pattern_last,
            )),
            _ => None,
        };

        let mut sources = Vec::with_capacity(rules.len() + 1);
        let mut refs: Vec<Option<RuleRef>> = Vec::with_capacity(rules.len() + 1);
        if let Some((source, false)) = end {
            sources.push(source);
            refs.push(None);
        }
        for rule in rules.iter() {
            if let Some(pattern) = self.registry.rule(*rule).entry_pattern() {
                sources.push(PatternSource::Compiled(pattern));
                refs.push(Some(*rule));
            }
        }
        if let Some((source, true)) = end {
            sources.push(source);
            refs.push(None);
        }

        let m = scan(&sources, run.haystack, run.pos, run.anchors())?;
        Some(match refs[m.index] {
            Some(rule) => Winner::Rule(rule, m),
            None => Winner::End(m),
        })
    }

    fn match_with_injections(&self, run: &LineRun<'_>) -> Option<Winner> {
        let host = self.match_host(run);
        if self.injections.is_empty() {
            return host;
        }

        let host_start = host.as_ref().map(|w| match w {
            Winner::End(m) | Winner::Rule(_, m) => m.start,
        });
        let scopes = run.stack.top().content_scopes.names();

        let mut found = Vec::new();
        for (index, injection) in self.injections.iter().enumerate() {
            if host_start.is_some() && !injection.competes_with_host() {
                continue;
            }
            if !injection.applies_to(&scopes) {
                continue;
            }
            let rules = self.injection_candidates(injection.rule_ref());
            if let Some((rule, m)) = self.scan_rules(&rules, run) {
                found.push((index, rule, m));
            }
        }

        let ranked = found
            .iter()
            .map(|(i, _, m)| (*i, m.start, self.injections[*i].priority));
        let Some((best, _)) = best_injection(ranked) else {
            return host;
        };
        let Some(pos) = found.iter().position(|(i, _, _)| *i == best) else {
            return host;
        };
        let (index, rule, m) = found.swap_remove(pos);
        if prefer_injection(host_start, m.start, self.injections[index].priority) {
            Some(Winner::Rule(rule, m))
        } else {
            host
        }
    }

    /// One tokenizer step; `false` when the rest of the run had no match
    fn scan_next(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
    ) -> Result<bool, Interrupt> {
        let Some(winner) = self.match_with_injections(run) else {
            acc.produce(run.line_len, &run.stack.top().content_scopes);
            return Ok(false);
        };

        match winner {
            Winner::End(m) => self.apply_end(run, acc, ctx, m)?,
            Winner::Rule(rule, m) => match self.registry.rule(rule) {
                Rule::Match(_) => self.apply_match(run, acc, ctx, rule, m)?,
                _ => self.apply_begin(run, acc, ctx, rule, m)?,
            },
        }
        Ok(true)
    }

    fn apply_end(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
        m: ScanMatch,
    ) -> Result<(), Interrupt> {
        let stack = run.stack.clone();
        let frame = stack.top();
        let pushed_here = run.pushed_here(&stack);

        if m.end <= run.pos && pushed_here && frame.enter_position == run.pos {
            // Entered and left at the same offset: keep the frame, move on
            log_debug!("Zero-width end at {} would loop, advancing", run.pos);
            run.force_advance();
            return Ok(());
        }
        let Some(parent) = stack.pop() else {
            run.force_advance();
            return Ok(());
        };

        acc.produce(m.start, &frame.content_scopes);

        if let Rule::BeginEnd(rule) = self.registry.rule(frame.rule) {
            if !rule.end_captures.is_empty() {
                let named = stack.with_top(StackFrame {
                    content_scopes: frame.name_scopes.clone(),
                    ..frame.clone()
                });
                self.handle_captures(run, acc, ctx, &named, frame.rule.grammar, &rule.end_captures, &m)?;
            }
        }
        acc.produce(m.end, &frame.name_scopes);

        run.anchor = if pushed_here { frame.anchor_position } else { None };
        run.set_stack(parent);
        run.advance_to(m.end);
        Ok(())
    }

    fn apply_match(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
        rule_ref: RuleRef,
        m: ScanMatch,
    ) -> Result<(), Interrupt> {
        let Rule::Match(rule) = self.registry.rule(rule_ref) else {
            return Ok(());
        };
        let base = run.stack.top().content_scopes.clone();
        acc.produce(m.start, &base);

        let scopes = apply_name(&base, rule.name.as_ref(), run.haystack, &m.captures);
        if !rule.captures.is_empty() {
            let temp = run.stack.push(StackFrame {
                rule: rule_ref,
                enter_position: run.pos,
                anchor_position: run.anchor,
                begin_captured_eol: false,
                end_source: None,
                name_scopes: scopes.clone(),
                content_scopes: scopes.clone(),
            });
            self.handle_captures(run, acc, ctx, &temp, rule_ref.grammar, &rule.captures, &m)?;
        }
        acc.produce(m.end, &scopes);

        if m.end > run.pos {
            run.advance_to(m.end);
        } else {
            run.force_advance();
        }
        Ok(())
    }

    /// Whether pushing `rule` at the current offset repeats an open frame
    fn repeats_open_frame(&self, run: &LineRun<'_>, rule: RuleRef) -> bool {
        for stack in run.stack.ancestors() {
            if !run.pushed_here(stack) || stack.top().enter_position != run.pos {
                return false;
            }
            if stack.top().rule == rule {
                return true;
            }
        }
        false
    }

    fn apply_begin(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
        rule_ref: RuleRef,
        m: ScanMatch,
    ) -> Result<(), Interrupt> {
        let rule = self.registry.rule(rule_ref);
        let (begin_captures, content_name, end_source) = match rule {
            Rule::BeginEnd(r) => (
                &r.begin_captures,
                r.content_name.as_ref(),
                r.end_has_back_references
                    .then(|| resolve_back_references(r.end.source(), run.haystack, &m.captures)),
            ),
            Rule::BeginWhile(r) => (
                &r.begin_captures,
                r.content_name.as_ref(),
                r.while_has_back_references.then(|| {
                    resolve_back_references(r.while_.source(), run.haystack, &m.captures)
                }),
            ),
            _ => return Ok(()),
        };

        if m.end <= run.pos && self.repeats_open_frame(run, rule_ref) {
            log_debug!("Zero-width begin at {} would loop, advancing", run.pos);
            run.force_advance();
            return Ok(());
        }

        let base = run.stack.top().content_scopes.clone();
        acc.produce(m.start, &base);

        let name_scopes = apply_name(&base, rule.name(), run.haystack, &m.captures);
        let frame = StackFrame {
            rule: rule_ref,
            enter_position: run.pos,
            anchor_position: run.anchor,
            begin_captured_eol: m.end == run.haystack.len(),
            end_source: end_source.map(Arc::from),
            name_scopes: name_scopes.clone(),
            content_scopes: name_scopes.clone(),
        };
        let pushed = run.stack.push(frame);

        if !begin_captures.is_empty() {
            self.handle_captures(run, acc, ctx, &pushed, rule_ref.grammar, begin_captures, &m)?;
        }
        acc.produce(m.end, &name_scopes);

        let content_scopes = apply_name(&name_scopes, content_name, run.haystack, &m.captures);
        let pushed = pushed.with_top(StackFrame {
            content_scopes,
            ..pushed.top().clone()
        });

        run.anchor = Some(m.end);
        run.set_stack(pushed);
        run.advance_to(m.end);
        Ok(())
    }

    // ========================================================================
    // While conditions
    // ========================================================================

    /// At line start, every open begin/while frame must match its condition
    ///
    /// Frames are checked outermost first. The first failure closes that
    /// frame and everything nested in it.
    fn check_while_conditions(
        &self,
        run: &mut LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
    ) -> Result<(), Interrupt> {
        let mut while_frames: Vec<ScopeStack> = run
            .stack
            .ancestors()
            .filter(|s| matches!(self.registry.rule(s.top().rule), Rule::BeginWhile(_)))
            .cloned()
            .collect();
        while_frames.reverse();

        for frame_stack in while_frames {
            let frame = frame_stack.top();
            let Rule::BeginWhile(rule) = self.registry.rule(frame.rule) else {
                continue;
            };
            let source = match &frame.end_source {
                Some(source) => PatternSource::Dynamic(source),
                None => PatternSource::Compiled(&rule.while_),
            };

            let found = scan(&[source], run.haystack, run.pos, run.anchors())
                .filter(|m| m.start == run.pos);
            let Some(m) = found else {
                log_debug!("While condition failed at depth {}", frame_stack.depth());
                if let Some(parent) = frame_stack.pop() {
                    run.set_stack(parent);
                }
                break;
            };

            acc.produce(m.start, &frame.content_scopes);
            if !rule.while_captures.is_empty() {
                self.handle_captures(run, acc, ctx, &frame_stack, frame.rule.grammar, &rule.while_captures, &m)?;
            }
            acc.produce(m.end, &frame.content_scopes);
            run.anchor = Some(m.end);
            run.advance_to(m.end);
        }
        Ok(())
    }

    // ========================================================================
    // Captures
    // ========================================================================

    #[allow(clippy::too_many_arguments)]
    fn handle_captures(
        &self,
        run: &LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
        stack: &ScopeStack,
        grammar: GrammarId,
        captures: &Captures,
        m: &ScanMatch,
    ) -> Result<(), Interrupt> {
        let base = &stack.top().content_scopes;
        let max_end = m.end;
        let mut local: Vec<(ScopeList, usize)> = Vec::new();

        for (group, rule_id) in captures.iter() {
            let Some(Some(range)) = m.captures.get(group) else {
                continue;
            };
            if range.is_empty() {
                continue;
            }
            if range.start > max_end {
                break;
            }

            while let Some((scopes, end)) = local.last() {
                if *end > range.start {
                    break;
                }
                acc.produce(*end, scopes);
                local.pop();
            }

            let outer = local.last().map_or(base, |(scopes, _)| scopes).clone();
            acc.produce(range.start, &outer);

            let capture = self.registry.grammar(grammar).rule(rule_id);
            let name_scopes = apply_name(&outer, capture.name(), run.haystack, &m.captures);
            let content_scopes =
                apply_name(&name_scopes, capture.content_name(), run.haystack, &m.captures);

            if !capture.patterns().is_empty() && run.capture_depth < MAX_CAPTURE_DEPTH {
                self.retokenize_capture(
                    run,
                    acc,
                    ctx,
                    stack,
                    RuleRef::new(grammar, rule_id),
                    range.clone(),
                    name_scopes,
                    content_scopes,
                )?;
                continue;
            }

            local.push((content_scopes, range.end));
        }

        while let Some((scopes, end)) = local.pop() {
            acc.produce(end, &scopes);
        }
        Ok(())
    }

    /// Tokenize a captured substring with the capture's own patterns
    #[allow(clippy::too_many_arguments)]
    fn retokenize_capture(
        &self,
        run: &LineRun<'_>,
        acc: &mut TokenAccumulator,
        ctx: &mut StepContext<'_>,
        stack: &ScopeStack,
        capture: RuleRef,
        range: Range<usize>,
        name_scopes: ScopeList,
        content_scopes: ScopeList,
    ) -> Result<(), Interrupt> {
        let pushed = stack.push(StackFrame {
            rule: capture,
            enter_position: range.start,
            anchor_position: None,
            begin_captured_eol: false,
            end_source: None,
            name_scopes,
            content_scopes,
        });
        let Some(haystack) = run.haystack.get(..range.end) else {
            return Ok(());
        };

        let mut nested = LineRun {
            haystack,
            line_len: range.end,
            first_line: run.first_line && range.start == 0,
            pos: range.start,
            anchor: None,
            floor: pushed.depth(),
            stack: pushed,
            capture_depth: run.capture_depth + 1,
        };
        self.run_loop(&mut nested, acc, ctx)?;
        acc.produce(range.end, &nested.stack.top().content_scopes);
        Ok(())
    }
}

impl std::fmt::Debug for Tokenizer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("grammar", &self.registry.grammar(self.base).scope_name())
            .field("injections", &self.injections.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(json: &str) -> Registry {
        let mut registry = Registry::new();
        registry.add_grammar_json(json).unwrap();
        registry
    }

    fn spans(result: &LineTokens, line: &str) -> Vec<(String, String)> {
        result
            .tokens
            .iter()
            .map(|t| (t.text(line).to_string(), t.scopes.join(" ")))
            .collect()
    }

    const NUMBERS: &str = r#"{
        "scopeName": "source.num",
        "patterns": [
            { "match": "\\d+", "name": "constant.numeric" },
            { "match": "\\b[a-z]+\\b", "name": "variable" }
        ]
    }"#;

    #[test]
    fn test_tokens_cover_line() {
        let registry = registry(NUMBERS);
        let tokenizer = Tokenizer::new(&registry, "source.num").unwrap();
        let line = "abc 12 de";
        let result = tokenizer.tokenize_line(line, None);

        assert_eq!(
            spans(&result, line),
            vec![
                ("abc".to_string(), "source.num variable".to_string()),
                (" ".to_string(), "source.num".to_string()),
                ("12".to_string(), "source.num constant.numeric".to_string()),
                (" ".to_string(), "source.num".to_string()),
                ("de".to_string(), "source.num variable".to_string()),
            ]
        );
        assert!(!result.stopped_early);
        assert!(!result.state.first_line);
    }

    #[test]
    fn test_empty_line_yields_one_empty_token() {
        let registry = registry(NUMBERS);
        let tokenizer = Tokenizer::new(&registry, "source.num").unwrap();
        let result = tokenizer.tokenize_line("", None);
        assert_eq!(result.tokens.len(), 1);
        assert_eq!((result.tokens[0].start, result.tokens[0].end), (0, 0));
        assert_eq!(result.tokens[0].scopes, vec!["source.num"]);
    }

    #[test]
    fn test_unknown_grammar() {
        let registry = Registry::new();
        assert!(matches!(
            Tokenizer::new(&registry, "source.none"),
            Err(GrammarError::UnknownGrammar { .. })
        ));
    }

    #[test]
    fn test_begin_end_with_content_name() {
        let registry = registry(
            r#"{
                "scopeName": "source.blk",
                "patterns": [{
                    "begin": "\\{", "end": "\\}",
                    "name": "meta.block", "contentName": "meta.body",
                    "beginCaptures": { "0": { "name": "punctuation.open" } },
                    "endCaptures": { "0": { "name": "punctuation.close" } }
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.blk").unwrap();
        let line = "{x}";
        let result = tokenizer.tokenize_line(line, None);
        assert_eq!(
            spans(&result, line),
            vec![
                ("{".to_string(), "source.blk meta.block punctuation.open".to_string()),
                ("x".to_string(), "source.blk meta.block meta.body".to_string()),
                ("}".to_string(), "source.blk meta.block punctuation.close".to_string()),
            ]
        );
        assert_eq!(result.state.depth(), 1);
    }

    #[test]
    fn test_apply_end_pattern_last() {
        let json = |last: bool| {
            format!(
                r#"{{
                    "scopeName": "source.ael",
                    "patterns": [{{
                        "begin": "<", "end": ">", "name": "meta.angle",
                        "applyEndPatternLast": {},
                        "patterns": [{{ "match": ">>", "name": "shift" }}]
                    }}]
                }}"#,
                last
            )
        };

        let line = "<a>>";
        let first = registry(&json(false));
        let tokenizer = Tokenizer::new(&first, "source.ael").unwrap();
        let result = tokenizer.tokenize_line(line, None);
        assert!(!result.tokens.iter().any(|t| t.has_scope("shift")));

        let last = registry(&json(true));
        let tokenizer = Tokenizer::new(&last, "source.ael").unwrap();
        let result = tokenizer.tokenize_line(line, None);
        assert!(result.tokens.iter().any(|t| t.has_scope("shift")));
        assert_eq!(result.state.depth(), 2);
    }

    #[test]
    fn test_back_reference_in_end() {
        let registry = registry(
            r#"{
                "scopeName": "source.heredoc",
                "patterns": [{
                    "begin": "<<(\\w+)", "end": "^\\1$", "name": "string.heredoc"
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.heredoc").unwrap();
        let lines = ["x <<EOF", "END", "EOF", "y"];
        let results = tokenizer.tokenize_lines(lines);

        assert_eq!(results[0].state.depth(), 2);
        assert_eq!(results[1].state.depth(), 2);
        assert_eq!(results[2].state.depth(), 1);
        assert_eq!(results[3].tokens[0].scopes, vec!["source.heredoc"]);
    }

    #[test]
    fn test_begin_while() {
        let registry = registry(
            r#"{
                "scopeName": "text.md",
                "patterns": [{
                    "begin": "^> ", "while": "^> ", "name": "markup.quote"
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "text.md").unwrap();
        let results = tokenizer.tokenize_lines(["> one", "> two", "three"]);

        assert!(results[0].tokens.iter().all(|t| t.has_scope("markup.quote")));
        assert!(results[1].tokens.iter().all(|t| t.has_scope("markup.quote")));
        assert_eq!(results[1].state.depth(), 2);
        assert!(!results[2].tokens.iter().any(|t| t.has_scope("markup.quote")));
        assert_eq!(results[2].state.depth(), 1);
    }

    #[test]
    fn test_zero_width_match_does_not_loop() {
        let registry = registry(
            r#"{
                "scopeName": "source.zw",
                "patterns": [
                    { "match": "(?=x)", "name": "meta.lookahead" },
                    { "begin": "(?=y)", "end": "(?=y)", "name": "meta.empty" }
                ]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.zw").unwrap();
        let line = "xxyy";
        let result = tokenizer.tokenize_line(line, None);
        assert_eq!(result.tokens.first().unwrap().start, 0);
        assert_eq!(result.tokens.last().unwrap().end, line.len());
    }

    #[test]
    fn test_capture_name_reference() {
        let registry = registry(
            r#"{
                "scopeName": "source.cap",
                "patterns": [{
                    "match": "(\\w+)\\(", "name": "meta.call.$1",
                    "captures": { "1": { "name": "entity.name.function" } }
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.cap").unwrap();
        let line = "run(";
        let result = tokenizer.tokenize_line(line, None);
        assert_eq!(
            spans(&result, line),
            vec![
                ("run".to_string(), "source.cap meta.call.run entity.name.function".to_string()),
                ("(".to_string(), "source.cap meta.call.run".to_string()),
            ]
        );
    }

    #[test]
    fn test_capture_with_patterns_is_retokenized() {
        let registry = registry(
            r#"{
                "scopeName": "source.args",
                "patterns": [{
                    "match": "\\((.*)\\)",
                    "captures": { "1": { "name": "meta.args", "patterns": [
                        { "match": "\\d+", "name": "constant.numeric" }
                    ] } }
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.args").unwrap();
        let line = "(a 1)";
        let result = tokenizer.tokenize_line(line, None);
        assert_eq!(
            spans(&result, line),
            vec![
                ("(".to_string(), "source.args".to_string()),
                ("a ".to_string(), "source.args meta.args".to_string()),
                ("1".to_string(), "source.args meta.args constant.numeric".to_string()),
                (")".to_string(), "source.args".to_string()),
            ]
        );
    }

    #[test]
    fn test_max_line_length() {
        let registry = registry(NUMBERS);
        let tokenizer = Tokenizer::new(&registry, "source.num")
            .unwrap()
            .with_config(TokenizerConfig::new().with_max_line_length(4));
        let initial = tokenizer.initial_state();
        let result = tokenizer.tokenize_line("12345678", Some(&initial));

        assert!(result.stopped_early);
        assert_eq!(result.tokens.len(), 1);
        assert_eq!(result.tokens[0].end, 8);
        assert_eq!(result.state.stack, initial.stack);
    }

    #[test]
    fn test_cancellation() {
        let registry = registry(NUMBERS);
        let tokenizer = Tokenizer::new(&registry, "source.num").unwrap();
        let cancel = CancellationToken::new();
        assert!(tokenizer.tokenize_line_with_cancel("1 2", None, 0, &cancel).is_ok());

        cancel.cancel();
        assert_eq!(
            tokenizer.tokenize_line_with_cancel("1 2", None, 0, &cancel),
            Err(TokenizeError::Cancelled { line: 0 })
        );
        let state = tokenizer.initial_state();
        assert_eq!(
            tokenizer.tokenize_line_with_cancel("1 2", Some(&state), 17, &cancel),
            Err(TokenizeError::Cancelled { line: 17 })
        );
        cancel.reset();
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_tokenizer_is_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<Tokenizer<'static>>();
        check::<Registry>();
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let registry = registry(
            r#"{
                "scopeName": "source.bad",
                "patterns": [
                    { "match": "(unclosed", "name": "bad" },
                    { "match": "ok", "name": "good" }
                ]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.bad").unwrap();
        let result = tokenizer.tokenize_line("ok", None);
        assert_eq!(result.tokens[0].scopes, vec!["source.bad", "good"]);
    }

    #[test]
    fn test_g_anchor_after_begin() {
        let registry = registry(
            r#"{
                "scopeName": "source.g",
                "patterns": [{
                    "begin": "@", "end": "(?!\\G)",
                    "name": "meta.at",
                    "patterns": [{ "match": "\\G\\w+", "name": "entity.name" }]
                }]
            }"#,
        );
        let tokenizer = Tokenizer::new(&registry, "source.g").unwrap();
        let line = "@name rest";
        let result = tokenizer.tokenize_line(line, None);
        assert_eq!(result.tokens[1].text(line), "name");
        assert!(result.tokens[1].has_scope("entity.name"));
        assert_eq!(result.state.depth(), 1);
    }
}
