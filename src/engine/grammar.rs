//! Compiled grammars
//!
//! [`Grammar::compile`] turns a [`RawGrammar`] into an arena of [`Rule`]s
//! addressed by [`RuleId`]. Includes are stored as ids, never inlined, so
//! recursive grammars (a rule including itself, two repository entries
//! including each other) compile to a finite arena and are expanded only
//! while a line is being tokenized.
//!
//! Rule 0 is always the grammar root: an include-only rule named after the
//! grammar scope holding the top-level patterns.

use super::error::GrammarError;
use super::pattern::{has_back_references, CompiledPattern};
use super::raw::{RawCaptures, RawGrammar, RawRule};
use super::selector::{parse_selector, SelectorMatcher};
use ahash::RandomState;
use hashbrown::HashMap;
use std::ops::Range;
use std::sync::OnceLock;

/// Hash map used throughout the engine
pub type FastMap<K, V> = HashMap<K, V, RandomState>;

// ============================================================================
// Identifiers
// ============================================================================

/// Index of a rule inside its grammar's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

impl RuleId {
    /// The grammar root
    pub const ROOT: RuleId = RuleId(0);

    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a grammar inside a [`Registry`](super::registry::Registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrammarId(pub u32);

impl GrammarId {
    #[inline]
    pub fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// A rule anywhere in a registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub grammar: GrammarId,
    pub rule: RuleId,
}

impl RuleRef {
    #[inline]
    pub fn new(grammar: GrammarId, rule: RuleId) -> Self {
        RuleRef { grammar, rule }
    }

    #[inline]
    pub fn root(grammar: GrammarId) -> Self {
        RuleRef::new(grammar, RuleId::ROOT)
    }
}

/// An entry of a `patterns` list after include resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternRef {
    /// A rule of the same grammar (`$self`, `#name` or an inline rule)
    Rule(RuleId),
    /// `$base`: the root of the grammar being tokenized
    Base,
    /// `scope.name` or `scope.name#entry` of another grammar
    External {
        scope_name: String,
        rule: Option<String>,
    },
}

// ============================================================================
// Scope names
// ============================================================================

fn capture_reference_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\$(\d+)|\$\{(\d+):/(downcase|upcase)\}")
            .unwrap_or_else(|_| unreachable!())
    })
}

/// A `name` or `contentName` value
///
/// May hold several space separated scopes and references to capture groups
/// of the match that applies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeName {
    raw: String,
    has_captures: bool,
}

impl ScopeName {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let has_captures = capture_reference_regex().is_match(&raw);
        ScopeName { raw, has_captures }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[inline]
    pub fn has_captures(&self) -> bool {
        self.has_captures
    }

    /// Scopes with capture references substituted from `haystack`
    ///
    /// References to groups that did not participate are left as written.
    pub fn resolve(&self, haystack: &str, captures: &[Option<Range<usize>>]) -> Vec<String> {
        if !self.has_captures {
            return split_scopes(&self.raw);
        }
        let resolved = capture_reference_regex().replace_all(&self.raw, |caps: &regex::Captures<'_>| {
            let group = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str());
            let text = group
                .and_then(|g| g.parse::<usize>().ok())
                .and_then(|n| captures.get(n).cloned().flatten())
                .and_then(|range| haystack.get(range));
            let Some(text) = text else {
                return caps[0].to_string();
            };
            let text = text.trim_start_matches('.');
            match caps.get(3).map(|m| m.as_str()) {
                Some("downcase") => text.to_lowercase(),
                Some("upcase") => text.to_uppercase(),
                _ => text.to_string(),
            }
        });
        split_scopes(&resolved)
    }
}

#[inline]
fn split_scopes(names: &str) -> Vec<String> {
    names.split_whitespace().map(str::to_string).collect()
}

/// Capture group → capture rule
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captures(pub Vec<Option<RuleId>>);

impl Captures {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    #[inline]
    pub fn get(&self, group: usize) -> Option<RuleId> {
        self.0.get(group).copied().flatten()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, RuleId)> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(group, rule)| rule.map(|r| (group, r)))
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug)]
pub struct MatchRule {
    pub name: Option<ScopeName>,
    pub pattern: CompiledPattern,
    pub captures: Captures,
}

#[derive(Debug)]
pub struct BeginEndRule {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: CompiledPattern,
    pub begin_captures: Captures,
    pub end: CompiledPattern,
    pub end_has_back_references: bool,
    pub end_captures: Captures,
    pub patterns: Vec<PatternRef>,
    pub apply_end_pattern_last: bool,
}

#[derive(Debug)]
pub struct BeginWhileRule {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub begin: CompiledPattern,
    pub begin_captures: Captures,
    pub while_: CompiledPattern,
    pub while_has_back_references: bool,
    pub while_captures: Captures,
    pub patterns: Vec<PatternRef>,
}

#[derive(Debug)]
pub struct IncludeOnlyRule {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<PatternRef>,
}

/// Scope of a capture group, optionally re-tokenized with `patterns`
#[derive(Debug)]
pub struct CaptureRule {
    pub name: Option<ScopeName>,
    pub content_name: Option<ScopeName>,
    pub patterns: Vec<PatternRef>,
}

/// A compiled rule
#[derive(Debug)]
pub enum Rule {
    Match(MatchRule),
    BeginEnd(BeginEndRule),
    BeginWhile(BeginWhileRule),
    IncludeOnly(IncludeOnlyRule),
    Capture(CaptureRule),
}

impl Rule {
    pub fn name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(r) => r.name.as_ref(),
            Rule::BeginEnd(r) => r.name.as_ref(),
            Rule::BeginWhile(r) => r.name.as_ref(),
            Rule::IncludeOnly(r) => r.name.as_ref(),
            Rule::Capture(r) => r.name.as_ref(),
        }
    }

    pub fn content_name(&self) -> Option<&ScopeName> {
        match self {
            Rule::Match(_) => None,
            Rule::BeginEnd(r) => r.content_name.as_ref(),
            Rule::BeginWhile(r) => r.content_name.as_ref(),
            Rule::IncludeOnly(r) => r.content_name.as_ref(),
            Rule::Capture(r) => r.content_name.as_ref(),
        }
    }

    /// Nested patterns; empty for match rules
    pub fn patterns(&self) -> &[PatternRef] {
        match self {
            Rule::Match(_) => &[],
            Rule::BeginEnd(r) => &r.patterns,
            Rule::BeginWhile(r) => &r.patterns,
            Rule::IncludeOnly(r) => &r.patterns,
            Rule::Capture(r) => &r.patterns,
        }
    }

    /// The pattern that selects this rule in a candidate list
    pub fn entry_pattern(&self) -> Option<&CompiledPattern> {
        match self {
            Rule::Match(r) => Some(&r.pattern),
            Rule::BeginEnd(r) => Some(&r.begin),
            Rule::BeginWhile(r) => Some(&r.begin),
            Rule::IncludeOnly(_) | Rule::Capture(_) => None,
        }
    }

    /// Whether this rule is expanded into its patterns when gathering candidates
    #[inline]
    pub fn is_container(&self) -> bool {
        matches!(self, Rule::IncludeOnly(_) | Rule::Capture(_))
    }
}

/// An entry of a grammar's own `injections` map
#[derive(Debug)]
pub struct GrammarInjection {
    /// Selector as written
    pub selector: String,
    pub matchers: Vec<SelectorMatcher>,
    pub rule: RuleId,
}

// ============================================================================
// Grammar
// ============================================================================

/// An immutable compiled grammar
#[derive(Debug)]
pub struct Grammar {
    scope_name: String,
    name: Option<String>,
    file_types: Vec<String>,
    first_line_match: Option<CompiledPattern>,
    rules: Vec<Rule>,
    repository: FastMap<String, RuleId>,
    injections: Vec<GrammarInjection>,
    injection_selector: Vec<SelectorMatcher>,
    external_dependencies: Vec<String>,
}

impl Grammar {
    /// Compile a raw grammar
    ///
    /// # Errors
    /// - `MissingScopeName` if the grammar has no scope name
    /// - `UnresolvedInclude` for a `#name` include with no repository entry
    /// - `MalformedRule` for inconsistent rule keys
    pub fn compile(raw: &RawGrammar) -> Result<Self, GrammarError> {
        let scope_name = raw.scope()?.to_string();
        let mut compiler = Compiler::new(&scope_name);

        let root = compiler.alloc();
        let repository = compiler.enter_repository(&raw.repository)?;
        let patterns = compiler.compile_patterns(&raw.patterns)?;
        compiler.set(
            root,
            Rule::IncludeOnly(IncludeOnlyRule {
                name: Some(ScopeName::new(scope_name.as_str())),
                content_name: None,
                patterns,
            }),
        );

        let mut injections = Vec::with_capacity(raw.injections.len());
        for (selector, rule) in &raw.injections {
            let id = compiler.compile_rule(rule)?;
            injections.push(GrammarInjection {
                selector: selector.clone(),
                matchers: parse_selector(selector),
                rule: id,
            });
        }
        compiler.repositories.pop();

        let first_line_match = raw.first_line_match.as_deref().map(CompiledPattern::new);
        let injection_selector = raw
            .injection_selector
            .as_deref()
            .map(parse_selector)
            .unwrap_or_default();
        let external_dependencies = compiler.external.clone();
        let rules = compiler.finish()?;

        log_debug!(
            "Compiled grammar '{}': {} rules, {} injections",
            scope_name,
            rules.len(),
            injections.len()
        );

        Ok(Grammar {
            scope_name,
            name: raw.name.clone(),
            file_types: raw.file_types.clone(),
            first_line_match,
            rules,
            repository,
            injections,
            injection_selector,
            external_dependencies,
        })
    }

    /// Parse and compile a grammar from TextMate JSON
    pub fn from_json(json: &str) -> Result<Self, GrammarError> {
        Grammar::compile(&RawGrammar::from_json(json)?)
    }

    #[inline]
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn file_types(&self) -> &[String] {
        &self.file_types
    }

    /// Rule by id
    ///
    /// Ids come from this grammar's own arena, so they are always in range.
    #[inline]
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.as_index()]
    }

    #[inline]
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Top-level repository entry, used by `scope#entry` includes
    #[inline]
    pub fn repository_rule(&self, name: &str) -> Option<RuleId> {
        self.repository.get(name).copied()
    }

    #[inline]
    pub fn injections(&self) -> &[GrammarInjection] {
        &self.injections
    }

    /// Where this grammar injects itself when used as an injector
    #[inline]
    pub fn injection_selector(&self) -> &[SelectorMatcher] {
        &self.injection_selector
    }

    /// Scope names of other grammars this grammar includes
    #[inline]
    pub fn external_dependencies(&self) -> &[String] {
        &self.external_dependencies
    }

    /// Whether `line` matches the grammar's `firstLineMatch`
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_match
            .as_ref()
            .and_then(|p| p.regex(Default::default()))
            .is_some_and(|re| re.find(line).is_some())
    }
}

// ============================================================================
// Compiler
// ============================================================================

struct Compiler<'a> {
    scope_name: &'a str,
    rules: Vec<Option<Rule>>,
    /// Lexically enclosing repositories, innermost last
    repositories: Vec<FastMap<String, RuleId>>,
    external: Vec<String>,
}

impl<'a> Compiler<'a> {
    fn new(scope_name: &'a str) -> Self {
        Compiler {
            scope_name,
            rules: Vec::new(),
            repositories: Vec::new(),
            external: Vec::new(),
        }
    }

    fn alloc(&mut self) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(None);
        id
    }

    fn set(&mut self, id: RuleId, rule: Rule) {
        self.rules[id.as_index()] = Some(rule);
    }

    fn finish(self) -> Result<Vec<Rule>, GrammarError> {
        let scope_name = self.scope_name;
        self.rules
            .into_iter()
            .map(|rule| rule.ok_or_else(|| GrammarError::malformed(scope_name, "rule never compiled")))
            .collect()
    }

    /// Allocate ids for all entries, make them visible, then compile bodies
    ///
    /// The caller pops the repository scope when done.
    fn enter_repository(
        &mut self,
        entries: &[(String, RawRule)],
    ) -> Result<FastMap<String, RuleId>, GrammarError> {
        let mut scope = FastMap::default();
        let mut ids = Vec::with_capacity(entries.len());
        for (name, _) in entries {
            let id = self.alloc();
            scope.insert(name.clone(), id);
            ids.push(id);
        }
        self.repositories.push(scope.clone());

        for ((_, raw), id) in entries.iter().zip(ids) {
            let rule = self.build(raw)?;
            self.set(id, rule);
        }
        Ok(scope)
    }

    fn compile_rule(&mut self, raw: &RawRule) -> Result<RuleId, GrammarError> {
        let id = self.alloc();
        let rule = self.build(raw)?;
        self.set(id, rule);
        Ok(id)
    }

    /// Compile a rule body, with its own repository in scope
    fn build(&mut self, raw: &RawRule) -> Result<Rule, GrammarError> {
        let nested = !raw.repository.is_empty();
        if nested {
            self.enter_repository(&raw.repository)?;
        }
        let rule = self.build_body(raw);
        if nested {
            self.repositories.pop();
        }
        rule
    }

    fn build_body(&mut self, raw: &RawRule) -> Result<Rule, GrammarError> {
        let name = raw.name.as_deref().map(ScopeName::new);
        let content_name = raw.content_name.as_deref().map(ScopeName::new);

        if let Some(pattern) = &raw.match_ {
            if raw.begin.is_some() {
                return Err(GrammarError::malformed(
                    self.scope_name,
                    format!("rule has both match and begin: {}", pattern),
                ));
            }
            return Ok(Rule::Match(MatchRule {
                name,
                pattern: CompiledPattern::new(pattern.as_str()),
                captures: self.compile_captures(raw.captures.as_ref())?,
            }));
        }

        if let Some(begin) = &raw.begin {
            // `captures` applies to begin/end/while when the specific key is absent
            let begin_captures = raw.begin_captures.as_ref().or(raw.captures.as_ref());
            let patterns = self.compile_patterns(raw.patterns.as_deref().unwrap_or(&[]))?;

            return match (&raw.end, &raw.while_) {
                (Some(_), Some(_)) => Err(GrammarError::malformed(
                    self.scope_name,
                    format!("rule has both end and while: {}", begin),
                )),
                (Some(end), None) => {
                    let end_captures = raw.end_captures.as_ref().or(raw.captures.as_ref());
                    Ok(Rule::BeginEnd(BeginEndRule {
                        name,
                        content_name,
                        begin: CompiledPattern::new(begin.as_str()),
                        begin_captures: self.compile_captures(begin_captures)?,
                        end: CompiledPattern::new(end.as_str()),
                        end_has_back_references: has_back_references(end),
                        end_captures: self.compile_captures(end_captures)?,
                        patterns,
                        apply_end_pattern_last: raw.apply_end_pattern_last,
                    }))
                }
                (None, Some(while_)) => {
                    let while_captures = raw.while_captures.as_ref().or(raw.captures.as_ref());
                    Ok(Rule::BeginWhile(BeginWhileRule {
                        name,
                        content_name,
                        begin: CompiledPattern::new(begin.as_str()),
                        begin_captures: self.compile_captures(begin_captures)?,
                        while_: CompiledPattern::new(while_.as_str()),
                        while_has_back_references: has_back_references(while_),
                        while_captures: self.compile_captures(while_captures)?,
                        patterns,
                    }))
                }
                (None, None) => Err(GrammarError::malformed(
                    self.scope_name,
                    format!("begin without end or while: {}", begin),
                )),
            };
        }

        if raw.end.is_some() || raw.while_.is_some() {
            return Err(GrammarError::malformed(
                self.scope_name,
                "end or while without begin",
            ));
        }

        let patterns = match (&raw.patterns, &raw.include) {
            (Some(patterns), _) => self.compile_patterns(patterns)?,
            (None, Some(include)) => vec![self.resolve_include(include)?],
            (None, None) => Vec::new(),
        };
        Ok(Rule::IncludeOnly(IncludeOnlyRule {
            name,
            content_name,
            patterns,
        }))
    }

    fn compile_patterns(&mut self, patterns: &[RawRule]) -> Result<Vec<PatternRef>, GrammarError> {
        let mut refs = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let reference = match &raw.include {
                Some(include) => self.resolve_include(include)?,
                None => PatternRef::Rule(self.compile_rule(raw)?),
            };
            refs.push(reference);
        }
        Ok(refs)
    }

    fn compile_captures(&mut self, raw: Option<&RawCaptures>) -> Result<Captures, GrammarError> {
        let Some(raw) = raw else {
            return Ok(Captures::default());
        };
        let entries = raw.entries().map_err(|key| {
            GrammarError::malformed(self.scope_name, format!("capture key is not a number: {}", key))
        })?;

        let len = entries.iter().map(|(group, _)| group + 1).max().unwrap_or(0);
        let mut captures = vec![None; len];
        for (group, rule) in entries {
            let patterns = match &rule.patterns {
                Some(patterns) => self.compile_patterns(patterns)?,
                None => Vec::new(),
            };
            let id = self.alloc();
            self.set(
                id,
                Rule::Capture(CaptureRule {
                    name: rule.name.as_deref().map(ScopeName::new),
                    content_name: rule.content_name.as_deref().map(ScopeName::new),
                    patterns,
                }),
            );
            captures[group] = Some(id);
        }
        Ok(Captures(captures))
    }

    fn lookup(&self, name: &str) -> Option<RuleId> {
        self.repositories
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn resolve_include(&mut self, include: &str) -> Result<PatternRef, GrammarError> {
        match include {
            "$self" => return Ok(PatternRef::Rule(RuleId::ROOT)),
            "$base" => return Ok(PatternRef::Base),
            _ => {}
        }

        if let Some(local) = include.strip_prefix('#') {
            return self
                .lookup(local)
                .map(PatternRef::Rule)
                .ok_or_else(|| GrammarError::unresolved(self.scope_name, include));
        }

        let (scope_name, entry) = match include.split_once('#') {
            Some((scope, entry)) => (scope, Some(entry)),
            None => (include, None),
        };

        // A bare repository name
        if entry.is_none() {
            if let Some(id) = self.lookup(scope_name) {
                return Ok(PatternRef::Rule(id));
            }
        }

        if scope_name == self.scope_name {
            return match entry {
                None => Ok(PatternRef::Rule(RuleId::ROOT)),
                Some(entry) => self
                    .lookup(entry)
                    .map(PatternRef::Rule)
                    .ok_or_else(|| GrammarError::unresolved(self.scope_name, include)),
            };
        }

        if !self.external.iter().any(|s| s == scope_name) {
            self.external.push(scope_name.to_string());
        }
        Ok(PatternRef::External {
            scope_name: scope_name.to_string(),
            rule: entry.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(json: &str) -> Result<Grammar, GrammarError> {
        Grammar::from_json(json)
    }

    #[test]
    fn test_root_rule_holds_top_level_patterns() {
        let g = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [
                    { "match": "a", "name": "a" },
                    { "include": "#b" }
                ],
                "repository": { "b": { "match": "b", "name": "b" } }
            }"##,
        )
        .unwrap();

        let root = g.rule(RuleId::ROOT);
        assert_eq!(root.name().unwrap().as_str(), "source.demo");
        assert_eq!(root.patterns().len(), 2);
        assert_eq!(
            root.patterns()[1],
            PatternRef::Rule(g.repository_rule("b").unwrap())
        );
    }

    #[test]
    fn test_recursive_repository_compiles() {
        let g = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [{ "include": "#block" }],
                "repository": {
                    "block": {
                        "begin": "\\{", "end": "\\}",
                        "patterns": [{ "include": "#block" }, { "include": "#inner" }]
                    },
                    "inner": { "patterns": [{ "include": "#block" }] }
                }
            }"##,
        )
        .unwrap();

        let block = g.repository_rule("block").unwrap();
        match g.rule(block) {
            Rule::BeginEnd(r) => assert_eq!(r.patterns[0], PatternRef::Rule(block)),
            other => panic!("expected begin/end rule, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_repository_is_lexical() {
        let g = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [{
                    "begin": "<", "end": ">",
                    "patterns": [{ "include": "#attr" }],
                    "repository": { "attr": { "match": "\\w+", "name": "attr" } }
                }]
            }"##,
        )
        .unwrap();
        assert!(g.repository_rule("attr").is_none());

        let err = compile(
            r##"{
                "scopeName": "source.demo",
                "patterns": [
                    { "begin": "<", "end": ">", "repository": { "attr": { "match": "x" } } },
                    { "include": "#attr" }
                ]
            }"##,
        )
        .unwrap_err();
        assert!(matches!(err, GrammarError::UnresolvedInclude { .. }));
    }

    #[test]
    fn test_unresolved_include() {
        let err = compile(
            r##"{ "scopeName": "source.demo", "patterns": [{ "include": "#nope" }] }"##,
        )
        .unwrap_err();
        assert_eq!(err, GrammarError::unresolved("source.demo", "#nope"));
    }

    #[test]
    fn test_malformed_rules() {
        let err = compile(r#"{ "scopeName": "s", "patterns": [{ "begin": "a" }] }"#).unwrap_err();
        assert!(matches!(err, GrammarError::MalformedRule { .. }));

        let err = compile(r#"{ "scopeName": "s", "patterns": [{ "begin": "a", "end": "b", "while": "c" }] }"#)
            .unwrap_err();
        assert!(matches!(err, GrammarError::MalformedRule { .. }));

        let err = compile(r#"{ "scopeName": "s", "patterns": [{ "end": "b" }] }"#).unwrap_err();
        assert!(matches!(err, GrammarError::MalformedRule { .. }));

        let err = compile(
            r#"{ "scopeName": "s", "patterns": [{ "match": "a", "captures": { "one": { "name": "x" } } }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, GrammarError::MalformedRule { .. }));
    }

    #[test]
    fn test_external_includes() {
        let g = compile(
            r#"{
                "scopeName": "text.html",
                "patterns": [
                    { "include": "source.js" },
                    { "include": "source.css#rules" },
                    { "include": "text.html#tag" },
                    { "include": "$base" }
                ],
                "repository": { "tag": { "match": "<\\w+>" } }
            }"#,
        )
        .unwrap();

        assert_eq!(g.external_dependencies(), ["source.js", "source.css"]);
        let patterns = g.rule(RuleId::ROOT).patterns();
        assert_eq!(
            patterns[1],
            PatternRef::External {
                scope_name: "source.css".into(),
                rule: Some("rules".into())
            }
        );
        assert_eq!(patterns[2], PatternRef::Rule(g.repository_rule("tag").unwrap()));
        assert_eq!(patterns[3], PatternRef::Base);
    }

    #[test]
    fn test_scope_name_capture_substitution() {
        let name = ScopeName::new("entity.name.$1 storage.${2:/upcase}");
        assert!(name.has_captures());
        let haystack = "fn .main";
        let captures = vec![Some(0..8), Some(3..8), Some(0..2)];
        assert_eq!(
            name.resolve(haystack, &captures),
            vec!["entity.name.main", "storage.FN"]
        );

        let missing = vec![Some(0..8)];
        assert_eq!(
            ScopeName::new("x.$1").resolve(haystack, &missing),
            vec!["x.$1"]
        );
    }

    #[test]
    fn test_captures_fall_back_to_shared_key() {
        let g = compile(
            r#"{
                "scopeName": "s",
                "patterns": [{
                    "begin": "(\")", "end": "(\")",
                    "captures": { "1": { "name": "punct" } }
                }]
            }"#,
        )
        .unwrap();
        match g.rule(RuleId(1)) {
            Rule::BeginEnd(r) => {
                assert!(r.begin_captures.get(1).is_some());
                assert!(r.end_captures.get(1).is_some());
            }
            other => panic!("expected begin/end rule, got {:?}", other),
        }
    }

    #[test]
    fn test_grammar_injections_and_selector() {
        let g = compile(
            r#"{
                "scopeName": "text.demo",
                "injectionSelector": "L:source.js",
                "injections": { "R:text.demo - comment": { "match": "TODO", "name": "todo" } }
            }"#,
        )
        .unwrap();
        assert_eq!(g.injections().len(), 1);
        assert_eq!(g.injections()[0].selector, "R:text.demo - comment");
        assert_eq!(g.injection_selector().len(), 1);
    }

    #[test]
    fn test_first_line_match() {
        let g = compile(r#"{ "scopeName": "source.sh", "firstLineMatch": "^#!.*sh" }"#).unwrap();
        assert!(g.matches_first_line("#!/bin/bash"));
        assert!(!g.matches_first_line("echo hi"));
    }
}
