//! Token Dump Example
//!
//! Tokenizes a source file with a TextMate grammar and prints every token
//! with its scopes. Without arguments a small built-in grammar and program
//! are used.
//!
//! Run with: cargo run --example highlight -- <grammar.tmLanguage.json> <file>

use std::process::ExitCode;
use tmscope::engine::{Document, Registry, TokenPrinter, Tokenizer};

const DEMO_GRAMMAR: &str = r#"{
    "scopeName": "source.demo",
    "patterns": [
        { "begin": "/\\*", "end": "\\*/", "name": "comment.block.demo" },
        { "begin": "\"", "end": "\"", "name": "string.quoted.double.demo",
          "patterns": [{ "match": "\\\\.", "name": "constant.character.escape.demo" }] },
        { "match": "\\b(let|if|else|return)\\b", "name": "keyword.control.demo" },
        { "match": "\\b\\d+\\b", "name": "constant.numeric.demo" },
        { "match": "[=+*/-]", "name": "keyword.operator.demo" }
    ]
}"#;

const DEMO_SOURCE: &str = "let greeting = \"say \\\"hi\\\"\";\n/* a comment\n   over two lines */ let n = 42;\n";

fn run(grammar: Option<String>, source: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut registry = Registry::new();
    let id = match &grammar {
        Some(path) => registry.add_grammar_file(path)?,
        None => registry.add_grammar_json(DEMO_GRAMMAR)?,
    };
    let scope_name = registry.grammar(id).scope_name().to_string();

    let text = match &source {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEMO_SOURCE.to_string(),
    };

    let tokenizer = Tokenizer::for_grammar(&registry, id)?;
    let mut doc = Document::new(&tokenizer, &text);
    let printer = TokenPrinter::new().show_text(true);

    println!("Grammar: {}", scope_name);
    for index in 0..doc.line_count() {
        let tokens = doc.tokenize_line(index).to_vec();
        let line = doc.line(index).unwrap_or_default();
        println!("\nLine {}: {:?}", index + 1, line);
        print!("{}", printer.print(line, &tokens));
    }

    // Show incremental re-tokenization: open a comment on the first line
    let changed = doc.apply_edit(0, 0, &["/* let greeting"]);
    println!("\nAfter opening a comment on line 1, re-tokenized lines: {:?}", changed);
    Ok(())
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let grammar = args.next();
    let source = args.next();

    match run(grammar, source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
