//! Integration tests for incremental document tokenization
//!
//! These tests cover:
//! - Lazy tokenization on demand
//! - Edits that stop early when the end state is unchanged
//! - Edits that propagate state changes to following lines
//! - Line insertion and deletion
//! - Cancellation of re-tokenization

use tmscope::engine::{
    CancellationToken, Document, LineEdit, Registry, TokenizeError, Tokenizer,
};

const CLIKE: &str = include_str!("fixtures/clike.tmLanguage.json");

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.add_grammar_json(CLIKE).unwrap();
    registry
}

fn program() -> String {
    [
        "let a = 1;",
        "let b = 2;",
        "{",
        "  let c = a + b;",
        "}",
        "let d = \"text\";",
        "// note",
        "let e = 5;",
        "let f = 6;",
        "let g = 7;",
    ]
    .join("\n")
}

fn assert_matches_fresh(doc: &mut Document<'_>, tokenizer: &Tokenizer<'_>) {
    doc.tokenize_all();
    let mut fresh = Document::new(tokenizer, &doc.text());
    fresh.tokenize_all();
    assert_eq!(doc.line_count(), fresh.line_count());
    for i in 0..doc.line_count() {
        assert_eq!(doc.tokens(i), fresh.tokens(i), "line {}", i);
        assert_eq!(doc.state_after(i), fresh.state_after(i), "state after line {}", i);
    }
}

// ============================================================================
// Edits
// ============================================================================

#[test]
fn test_edit_with_unchanged_state_reports_only_that_line() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();
    assert_eq!(doc.line_count(), 10);

    let changed = doc.apply_edit(5, 5, &["let d = \"other\";"]);
    assert_eq!(changed, vec![5]);
    assert_eq!(doc.invalid_from(), 10);
    assert_matches_fresh(&mut doc, &tokenizer);
}

#[test]
fn test_unclosed_string_propagates() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();

    // Strings stay open across lines until their closing quote
    let changed = doc.apply_edit(5, 5, &["let d = \"open"]);
    assert_eq!(changed, (5..10).collect::<Vec<_>>());
    assert!(doc.tokens(9).unwrap()[0].has_scope("string.quoted.double.clike"));
    assert_matches_fresh(&mut doc, &tokenizer);
}

#[test]
fn test_closing_brace_removed_then_restored() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();

    let changed = doc.apply_edit(4, 4, &[""]);
    assert_eq!(changed, (4..10).collect::<Vec<_>>());
    assert_eq!(doc.state_after(9).unwrap().depth(), 2);

    let changed = doc.apply_edit(4, 4, &["}"]);
    assert_eq!(changed, (4..10).collect::<Vec<_>>());
    assert_eq!(doc.state_after(9).unwrap().depth(), 1);
    assert_matches_fresh(&mut doc, &tokenizer);
}

#[test]
fn test_multi_line_replacement() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();

    let changed = doc.apply_edit(1, 3, &["/* x", "y */"]);
    assert_eq!(doc.line_count(), 9);
    assert_eq!(changed[0], 1);
    assert!(doc.tokens(2).unwrap()[0].has_scope("comment.block.clike"));
    assert_matches_fresh(&mut doc, &tokenizer);
}

#[test]
fn test_insert_and_delete_lines() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();

    let changed = doc.apply_line_edit(LineEdit::insert(7, 2), &["/*", "*/"]);
    assert_eq!(changed, vec![7, 8]);
    assert_eq!(doc.line_count(), 12);
    assert_eq!(doc.line(9), Some("let e = 5;"));

    let changed = doc.apply_line_edit(LineEdit::delete(8, 1), &[]);
    assert_eq!(changed, (8..11).collect::<Vec<_>>());
    assert!(doc.tokens(10).unwrap()[0].has_scope("comment.block"));
    assert_matches_fresh(&mut doc, &tokenizer);
}

#[test]
fn test_edit_before_lazy_tokenization() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());

    let changed = doc.apply_edit(3, 3, &["  let c = 3;"]);
    assert_eq!(changed, vec![3]);
    assert_eq!(doc.invalid_from(), 4);
    assert_matches_fresh(&mut doc, &tokenizer);
}

// ============================================================================
// Lazy access
// ============================================================================

#[test]
fn test_tokenize_line_on_demand() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());

    let tokens = doc.tokenize_line(3).to_vec();
    assert_eq!(doc.invalid_from(), 4);
    assert!(tokens.iter().all(|t| t.has_scope("meta.block.clike")));
    assert!(doc.tokens(4).is_none());
}

#[test]
fn test_crlf_text() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, "let a;\r\nlet b;\r\n");
    assert_eq!(doc.line_count(), 3);
    assert_eq!(doc.line(1), Some("let b;"));
    assert_eq!(doc.tokenize_line(1).last().unwrap().end, 6);
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_cancelled_edit_resumes_lazily() {
    let registry = registry();
    let tokenizer = Tokenizer::new(&registry, "source.clike").unwrap();
    let mut doc = Document::new(&tokenizer, &program());
    doc.tokenize_all();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = doc
        .apply_edit_with_cancel(2, 2, &["/*"], &cancel)
        .unwrap_err();
    assert_eq!(err, TokenizeError::Cancelled { line: 2 });
    assert_eq!(doc.invalid_from(), 2);
    assert_eq!(doc.line(2), Some("/*"));

    cancel.reset();
    let changed = doc
        .apply_edit_with_cancel(0, 0, &["let a = 1;"], &cancel)
        .unwrap();
    assert_eq!(changed, vec![0]);
    assert_matches_fresh(&mut doc, &tokenizer);
    assert!(doc.tokens(9).unwrap()[0].has_scope("comment.block"));
}
