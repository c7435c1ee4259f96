//! Persistent scope stacks
//!
//! A line state is the tip of a linked list of frames, one per open
//! begin/end or begin/while rule. Frames are reference counted and never
//! mutated: pushing allocates one node that points at the shared parent, and
//! popping just returns the parent. A document can therefore keep the end
//! state of every line at the cost of the frames each line actually adds.
//!
//! Equality is structural. Two states are equal when their frames have the
//! same rules, resolved end patterns and scopes, which is what the document
//! driver compares to decide that re-tokenization can stop. Positions stored
//! in frames are only meaningful on the line that pushed them and do not take
//! part in equality.

use super::grammar::RuleRef;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Scope lists
// ============================================================================

struct ScopeNode {
    scope: Arc<str>,
    parent: Option<Arc<ScopeNode>>,
    len: usize,
}

/// Persistent list of scope names, outermost first
#[derive(Clone, Default)]
pub struct ScopeList(Option<Arc<ScopeNode>>);

impl ScopeList {
    /// An empty list
    #[inline]
    pub fn new() -> Self {
        ScopeList(None)
    }

    /// A new list with `scope` appended; `self` is unchanged
    pub fn push(&self, scope: impl Into<Arc<str>>) -> ScopeList {
        ScopeList(Some(Arc::new(ScopeNode {
            scope: scope.into(),
            parent: self.0.clone(),
            len: self.len() + 1,
        })))
    }

    /// Append several scopes in order
    pub fn push_all<I, S>(&self, scopes: I) -> ScopeList
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        scopes
            .into_iter()
            .fold(self.clone(), |list, scope| list.push(scope))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, |node| node.len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Innermost scope
    #[inline]
    pub fn last(&self) -> Option<&str> {
        self.0.as_ref().map(|node| &*node.scope)
    }

    /// Scopes from innermost to outermost
    pub fn iter_rev(&self) -> impl Iterator<Item = &str> {
        let mut node = self.0.as_deref();
        std::iter::from_fn(move || {
            let current = node?;
            node = current.parent.as_deref();
            Some(&*current.scope)
        })
    }

    /// Scopes from outermost to innermost
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.iter_rev().collect();
        names.reverse();
        names
    }

    /// Owned scopes from outermost to innermost
    pub fn to_vec(&self) -> Vec<String> {
        self.names().into_iter().map(str::to_string).collect()
    }
}

impl PartialEq for ScopeList {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) if Arc::ptr_eq(a, b) => true,
            (Some(a), Some(b)) => {
                a.len == b.len && self.iter_rev().zip(other.iter_rev()).all(|(x, y)| x == y)
            }
            _ => false,
        }
    }
}

impl Eq for ScopeList {}

impl fmt::Debug for ScopeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Frames
// ============================================================================

/// One nesting level of the tokenizer
#[derive(Clone)]
pub struct StackFrame {
    /// Rule that opened this frame
    pub rule: RuleRef,
    /// Offset where the rule was entered, on the line that pushed it
    pub enter_position: usize,
    /// `\G` position in effect before the push, restored on pop
    pub anchor_position: Option<usize>,
    /// The begin match reached the end of its line
    pub begin_captured_eol: bool,
    /// End or while source resolved with backreferences of the begin match
    pub end_source: Option<Arc<str>>,
    /// Scopes up to and including the rule's `name`
    pub name_scopes: ScopeList,
    /// `name_scopes` plus the rule's `contentName`
    pub content_scopes: ScopeList,
}

impl StackFrame {
    fn structural_eq(&self, other: &StackFrame) -> bool {
        self.rule == other.rule
            && self.begin_captured_eol == other.begin_captured_eol
            && self.end_source == other.end_source
            && self.content_scopes == other.content_scopes
            && self.name_scopes == other.name_scopes
    }
}

struct FrameNode {
    frame: StackFrame,
    parent: Option<ScopeStack>,
    depth: usize,
}

/// Persistent stack of frames; the handle is the tip
#[derive(Clone)]
pub struct ScopeStack(Arc<FrameNode>);

impl ScopeStack {
    /// The bottom frame of a grammar, holding its root scopes
    pub fn root(rule: RuleRef, scopes: ScopeList) -> Self {
        ScopeStack(Arc::new(FrameNode {
            frame: StackFrame {
                rule,
                enter_position: 0,
                anchor_position: None,
                begin_captured_eol: false,
                end_source: None,
                name_scopes: scopes.clone(),
                content_scopes: scopes,
            },
            parent: None,
            depth: 1,
        }))
    }

    /// A new tip on top of `self`
    pub fn push(&self, frame: StackFrame) -> ScopeStack {
        ScopeStack(Arc::new(FrameNode {
            frame,
            parent: Some(self.clone()),
            depth: self.depth() + 1,
        }))
    }

    /// The parent stack, or `None` at the root which is never popped
    #[inline]
    pub fn pop(&self) -> Option<ScopeStack> {
        self.0.parent.clone()
    }

    /// Replace the tip frame, keeping its parent
    pub fn with_top(&self, frame: StackFrame) -> ScopeStack {
        ScopeStack(Arc::new(FrameNode {
            frame,
            parent: self.0.parent.clone(),
            depth: self.0.depth,
        }))
    }

    #[inline]
    pub fn top(&self) -> &StackFrame {
        &self.0.frame
    }

    #[inline]
    pub fn parent(&self) -> Option<&ScopeStack> {
        self.0.parent.as_ref()
    }

    /// Number of frames, root included
    #[inline]
    pub fn depth(&self) -> usize {
        self.0.depth
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    /// Stacks from the tip down to the root
    pub fn ancestors(&self) -> impl Iterator<Item = &ScopeStack> {
        let mut next = Some(self);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent();
            Some(current)
        })
    }

    /// Content scopes of the tip, outermost first
    #[inline]
    pub fn scope_names(&self) -> Vec<&str> {
        self.top().content_scopes.names()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ScopeStack) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ScopeStack {
    fn eq(&self, other: &Self) -> bool {
        if self.depth() != other.depth() {
            return false;
        }
        for (a, b) in self.ancestors().zip(other.ancestors()) {
            if a.ptr_eq(b) {
                return true;
            }
            if !a.top().structural_eq(b.top()) {
                return false;
            }
        }
        true
    }
}

impl Eq for ScopeStack {}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStack")
            .field("depth", &self.depth())
            .field("scopes", &self.top().content_scopes)
            .finish()
    }
}

// ============================================================================
// Line state
// ============================================================================

/// State carried from the end of one line to the start of the next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineState {
    pub stack: ScopeStack,
    /// The next line is the first of the document (`\A` may match)
    pub first_line: bool,
}

impl LineState {
    #[inline]
    pub fn new(stack: ScopeStack, first_line: bool) -> Self {
        LineState { stack, first_line }
    }

    /// Content scopes in effect at the start of the next line
    #[inline]
    pub fn scope_names(&self) -> Vec<&str> {
        self.stack.scope_names()
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::grammar::{GrammarId, RuleId};

    fn rule(n: u32) -> RuleRef {
        RuleRef::new(GrammarId(0), RuleId(n))
    }

    fn frame(base: &ScopeStack, n: u32, name: &str, pos: usize) -> StackFrame {
        let scopes = base.top().content_scopes.push(name);
        StackFrame {
            rule: rule(n),
            enter_position: pos,
            anchor_position: None,
            begin_captured_eol: false,
            end_source: None,
            name_scopes: scopes.clone(),
            content_scopes: scopes,
        }
    }

    fn root() -> ScopeStack {
        ScopeStack::root(rule(0), ScopeList::new().push("source.c"))
    }

    #[test]
    fn test_scope_list_order() {
        let list = ScopeList::new().push("a").push_all(["b", "c"]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.names(), vec!["a", "b", "c"]);
        assert_eq!(list.last(), Some("c"));
        assert_eq!(list.iter_rev().collect::<Vec<_>>(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_scope_list_structural_equality() {
        let a = ScopeList::new().push("x").push("y");
        let b = ScopeList::new().push("x").push("y");
        let c = ScopeList::new().push("x").push("z");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ScopeList::new().push("x"));
    }

    #[test]
    fn test_push_does_not_mutate() {
        let base = root();
        let pushed = base.push(frame(&base, 1, "comment.block", 0));

        assert_eq!(base.depth(), 1);
        assert_eq!(pushed.depth(), 2);
        assert_eq!(base.scope_names(), vec!["source.c"]);
        assert_eq!(pushed.scope_names(), vec!["source.c", "comment.block"]);
        assert!(pushed.pop().unwrap().ptr_eq(&base));
    }

    #[test]
    fn test_root_is_never_popped() {
        assert!(root().pop().is_none());
        assert!(root().is_root());
    }

    #[test]
    fn test_equality_ignores_positions() {
        let base = root();
        let a = base.push(frame(&base, 1, "string", 3));
        let b = root().push(frame(&root(), 1, "string", 9));
        assert_eq!(a, b);

        let c = base.push(frame(&base, 2, "string", 3));
        assert_ne!(a, c);
    }

    #[test]
    fn test_equality_compares_end_source() {
        let base = root();
        let mut f1 = frame(&base, 1, "string.heredoc", 0);
        let mut f2 = f1.clone();
        f1.end_source = Some(Arc::from("^EOF$"));
        f2.end_source = Some(Arc::from("^END$"));
        assert_ne!(base.push(f1), base.push(f2));
    }

    #[test]
    fn test_with_top_replaces_tip() {
        let base = root();
        let pushed = base.push(frame(&base, 1, "meta.block", 0));
        let mut top = pushed.top().clone();
        top.content_scopes = top.name_scopes.push("meta.body");
        let replaced = pushed.with_top(top);

        assert_eq!(replaced.depth(), 2);
        assert!(replaced.parent().unwrap().ptr_eq(&base));
        assert_eq!(
            replaced.scope_names(),
            vec!["source.c", "meta.block", "meta.body"]
        );
    }

    #[test]
    fn test_ancestors() {
        let base = root();
        let one = base.push(frame(&base, 1, "a", 0));
        let two = one.push(frame(&one, 2, "b", 0));
        let depths: Vec<usize> = two.ancestors().map(|s| s.depth()).collect();
        assert_eq!(depths, vec![3, 2, 1]);
    }
}
