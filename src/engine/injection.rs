//! Injection resolution
//!
//! An injection adds patterns to a host grammar wherever its selector
//! matches the current scopes. Injections come from two places: the host
//! grammar's own `injections` map, and other grammars registered as
//! injectors for the host whose `injectionSelector` is used.
//!
//! At each tokenizer step the host's best match and the best injection
//! match are combined with [`prefer_injection`].

use super::grammar::{GrammarId, RuleId, RuleRef};
use super::selector::{InjectionPriority, SelectorMatcher};

/// A resolved injection for one host grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    /// Grammar owning the injected rule
    pub grammar: GrammarId,
    pub rule: RuleId,
    pub matcher: SelectorMatcher,
    pub priority: InjectionPriority,
}

impl Injection {
    pub fn new(grammar: GrammarId, rule: RuleId, matcher: SelectorMatcher) -> Self {
        Injection {
            grammar,
            rule,
            priority: matcher.priority,
            matcher,
        }
    }

    #[inline]
    pub fn rule_ref(&self) -> RuleRef {
        RuleRef::new(self.grammar, self.rule)
    }

    /// Whether the injection is active for these content scopes
    #[inline]
    pub fn applies_to<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        self.matcher.matches(scopes)
    }

    /// Whether the injection may compete while the host has a match
    #[inline]
    pub fn competes_with_host(&self) -> bool {
        self.priority != InjectionPriority::Right
    }
}

/// Whether an injection match beats the host's best match
///
/// - no host match: any injection match is taken
/// - `L:` wins when it starts at or before the host match
/// - no prefix wins only when strictly leftmost
/// - `R:` never beats an existing host match
#[inline]
pub fn prefer_injection(
    host_start: Option<usize>,
    injection_start: usize,
    priority: InjectionPriority,
) -> bool {
    let Some(host_start) = host_start else {
        return true;
    };
    match priority {
        InjectionPriority::Left => injection_start <= host_start,
        InjectionPriority::Default => injection_start < host_start,
        InjectionPriority::Right => false,
    }
}

/// Pick the best of several injection matches
///
/// `matches` holds `(injection index, match start, priority)` in declaration
/// order. The leftmost start wins. On equal starts `L:` ranks ahead of the
/// other priorities, then the earlier declaration is kept.
pub fn best_injection(
    matches: impl IntoIterator<Item = (usize, usize, InjectionPriority)>,
) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize, InjectionPriority)> = None;
    for (index, start, priority) in matches {
        if best.map_or(true, |(_, best_start, best_priority)| {
            (start, priority) < (best_start, best_priority)
        }) {
            best = Some((index, start, priority));
        }
    }
    best.map(|(index, start, _)| (index, start))
}
