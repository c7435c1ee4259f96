//! Grammar registry
//!
//! The registry owns every compiled grammar and hands out [`GrammarId`]s.
//! Grammars can be added directly, or pulled on demand from a
//! [`GrammarProvider`] together with every grammar they include and every
//! grammar registered to inject into them.
//!
//! # Example
//!
//! ```
//! use tmscope::engine::Registry;
//!
//! let mut registry = Registry::new();
//! let id = registry
//!     .add_grammar_json(r#"{ "scopeName": "source.demo", "patterns": [] }"#)
//!     .unwrap();
//! assert_eq!(registry.grammar(id).scope_name(), "source.demo");
//! ```

use super::error::GrammarError;
use super::grammar::{FastMap, Grammar, GrammarId, Rule, RuleId, RuleRef};
use super::injection::Injection;
use super::raw::RawGrammar;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where a provider finds a grammar
#[derive(Debug, Clone)]
pub enum GrammarSource {
    /// TextMate JSON text
    Json(String),
    /// Path to a `.tmLanguage.json` file
    File(PathBuf),
    /// An already parsed grammar
    Raw(RawGrammar),
}

impl GrammarSource {
    /// Read and parse the grammar
    pub fn into_raw(self) -> Result<RawGrammar, GrammarError> {
        match self {
            GrammarSource::Json(json) => RawGrammar::from_json(&json),
            GrammarSource::File(path) => read_grammar_file(&path),
            GrammarSource::Raw(raw) => Ok(raw),
        }
    }
}

fn read_grammar_file(path: &Path) -> Result<RawGrammar, GrammarError> {
    let json = std::fs::read_to_string(path).map_err(|err| GrammarError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })?;
    RawGrammar::from_json(&json)
}

/// Supplies grammars that are not yet in a registry
pub trait GrammarProvider: Send + Sync {
    /// The grammar for `scope_name`, if known
    fn grammar_source(&self, scope_name: &str) -> Option<GrammarSource>;

    /// Scope names of grammars that inject into `scope_name`
    fn injections_for(&self, _scope_name: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Owner of all compiled grammars
#[derive(Default)]
pub struct Registry {
    grammars: Vec<Grammar>,
    by_scope: FastMap<String, GrammarId>,
    /// Host scope → injector scopes, in registration order
    injectors: FastMap<String, Vec<String>>,
    provider: Option<Box<dyn GrammarProvider>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// A registry that loads missing grammars from `provider`
    pub fn with_provider(provider: impl GrammarProvider + 'static) -> Self {
        Registry {
            provider: Some(Box::new(provider)),
            ..Registry::default()
        }
    }

    pub fn set_provider(&mut self, provider: impl GrammarProvider + 'static) {
        self.provider = Some(Box::new(provider));
    }

    // ========================================================================
    // Adding grammars
    // ========================================================================

    /// Add an already compiled grammar
    ///
    /// A grammar with the same scope name is replaced and keeps its id.
    pub fn add_compiled(&mut self, grammar: Grammar) -> GrammarId {
        if let Some(&id) = self.by_scope.get(grammar.scope_name()) {
            log_debug!("Replacing grammar '{}'", grammar.scope_name());
            self.grammars[id.as_index()] = grammar;
            return id;
        }
        let id = GrammarId(self.grammars.len() as u32);
        self.by_scope.insert(grammar.scope_name().to_string(), id);
        self.grammars.push(grammar);
        id
    }

    /// Compile and add a raw grammar
    pub fn add_grammar(&mut self, raw: &RawGrammar) -> Result<GrammarId, GrammarError> {
        Ok(self.add_compiled(Grammar::compile(raw)?))
    }

    /// Parse, compile and add a grammar from TextMate JSON
    pub fn add_grammar_json(&mut self, json: &str) -> Result<GrammarId, GrammarError> {
        self.add_grammar(&RawGrammar::from_json(json)?)
    }

    /// Read, compile and add a `.tmLanguage.json` file
    pub fn add_grammar_file(&mut self, path: impl AsRef<Path>) -> Result<GrammarId, GrammarError> {
        self.add_grammar(&read_grammar_file(path.as_ref())?)
    }

    /// Register `injector_scope` to inject into `target_scope`
    pub fn add_injection(&mut self, target_scope: &str, injector_scope: &str) {
        let injectors = self.injectors.entry(target_scope.to_string()).or_default();
        if !injectors.iter().any(|s| s == injector_scope) {
            injectors.push(injector_scope.to_string());
        }
    }

    /// Ensure a grammar and everything it needs is loaded
    ///
    /// Grammars already in the registry are used as they are. Missing ones
    /// (the grammar itself, grammars it includes, grammars injecting into
    /// it) are requested from the provider.
    ///
    /// # Errors
    /// `UnknownGrammar` when a needed grammar is neither registered nor
    /// known to the provider, or any error from compiling a loaded grammar.
    pub fn load_grammar(&mut self, scope_name: &str) -> Result<GrammarId, GrammarError> {
        let mut queue = VecDeque::from([scope_name.to_string()]);
        let mut seen: Vec<String> = Vec::new();

        while let Some(scope) = queue.pop_front() {
            if seen.contains(&scope) {
                continue;
            }
            seen.push(scope.clone());

            let id = match self.grammar_id(&scope) {
                Some(id) => id,
                None => {
                    let source = self
                        .provider
                        .as_ref()
                        .and_then(|p| p.grammar_source(&scope))
                        .ok_or_else(|| GrammarError::UnknownGrammar {
                            scope_name: scope.clone(),
                        })?;
                    log_debug!("Loading grammar '{}' from provider", scope);
                    self.add_grammar(&source.into_raw()?)?
                }
            };

            queue.extend(self.grammar(id).external_dependencies().iter().cloned());
            queue.extend(self.injector_scopes(&scope));
        }

        self.grammar_id(scope_name)
            .ok_or_else(|| GrammarError::UnknownGrammar {
                scope_name: scope_name.to_string(),
            })
    }

    /// Check that every grammar reachable through includes is registered
    pub fn check_dependencies(&self, id: GrammarId) -> Result<(), GrammarError> {
        let mut stack = vec![id];
        let mut seen = vec![id];
        while let Some(id) = stack.pop() {
            for scope in self.grammar(id).external_dependencies() {
                let dep = self.grammar_id(scope).ok_or_else(|| GrammarError::UnknownGrammar {
                    scope_name: scope.clone(),
                })?;
                if !seen.contains(&dep) {
                    seen.push(dep);
                    stack.push(dep);
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Grammar by id
    ///
    /// Ids are only handed out by this registry and grammars are never
    /// removed, so every id is in range.
    #[inline]
    pub fn grammar(&self, id: GrammarId) -> &Grammar {
        &self.grammars[id.as_index()]
    }

    #[inline]
    pub fn grammar_id(&self, scope_name: &str) -> Option<GrammarId> {
        self.by_scope.get(scope_name).copied()
    }

    #[inline]
    pub fn grammar_for_scope(&self, scope_name: &str) -> Option<&Grammar> {
        self.grammar_id(scope_name).map(|id| self.grammar(id))
    }

    #[inline]
    pub fn rule(&self, rule: RuleRef) -> &Rule {
        self.grammar(rule.grammar).rule(rule.rule)
    }

    /// Resolve `scope#entry` (or the root when `entry` is `None`)
    pub fn external_rule(&self, scope_name: &str, entry: Option<&str>) -> Option<RuleRef> {
        let id = self.grammar_id(scope_name)?;
        let rule = match entry {
            Some(entry) => self.grammar(id).repository_rule(entry)?,
            None => RuleId::ROOT,
        };
        Some(RuleRef::new(id, rule))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.grammars.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.grammars.is_empty()
    }

    /// Scope names of all registered grammars
    pub fn scope_names(&self) -> impl Iterator<Item = &str> {
        self.grammars.iter().map(Grammar::scope_name)
    }

    // ========================================================================
    // Injections
    // ========================================================================

    /// Scopes registered or provided as injectors for `scope_name`
    pub fn injector_scopes(&self, scope_name: &str) -> Vec<String> {
        let mut scopes = self.injectors.get(scope_name).cloned().unwrap_or_default();
        if let Some(provider) = &self.provider {
            for scope in provider.injections_for(scope_name) {
                if !scopes.contains(&scope) {
                    scopes.push(scope);
                }
            }
        }
        scopes
    }

    /// All injections active for a host grammar, in declaration order
    ///
    /// The host's own `injections` come first, then injector grammars in
    /// registration order. Injectors that are not loaded are skipped.
    pub fn resolve_injections(&self, host: GrammarId) -> Vec<Injection> {
        let grammar = self.grammar(host);
        let mut injections = Vec::new();

        for entry in grammar.injections() {
            for matcher in &entry.matchers {
                injections.push(Injection::new(host, entry.rule, matcher.clone()));
            }
        }

        for scope in self.injector_scopes(grammar.scope_name()) {
            let Some(id) = self.grammar_id(&scope) else {
                log_warn!("Injector grammar '{}' is not loaded", scope);
                continue;
            };
            for matcher in self.grammar(id).injection_selector() {
                injections.push(Injection::new(id, RuleId::ROOT, matcher.clone()));
            }
        }

        injections
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("grammars", &self.scope_names().collect::<Vec<_>>())
            .field("injectors", &self.injectors)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}
