//! Syntax checks and file outlines via tree-sitter. Rust and Python are
//! wired up; other extensions pass through unchecked.

use tree_sitter::{Language, Node, Parser};

enum Grammar {
    Rust,
    Python,
}

fn grammar_for(filename: &str) -> Option<Grammar> {
    let extension = filename.rsplit('.').next()?;
    match extension {
        "rs" => Some(Grammar::Rust),
        "py" => Some(Grammar::Python),
        _ => None,
    }
}

fn language(grammar: &Grammar) -> Language {
    match grammar {
        Grammar::Rust => tree_sitter_rust::LANGUAGE.into(),
        Grammar::Python => tree_sitter_python::LANGUAGE.into(),
    }
}

fn parse(code: &str, grammar: &Grammar) -> Option<tree_sitter::Tree> {
    let mut parser = Parser::new();
    parser.set_language(&language(grammar)).ok()?;
    parser.parse(code, None)
}

/// `None` when the code parses cleanly or the extension is unrecognized;
/// otherwise a message locating the first problem.
#[must_use]
pub fn validate_syntax(code: &str, filename: &str) -> Option<String> {
    let grammar = grammar_for(filename)?;
    let tree = parse(code, &grammar)?;
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }
    let node = first_error_node(root)?;
    let row = node.start_position().row + 1;
    if node.is_missing() {
        Some(format!("line {row}: missing {}", node.kind()))
    } else {
        Some(format!("line {row}: syntax error"))
    }
}

fn first_error_node(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if !child.has_error() {
            continue;
        }
        if let Some(found) = first_error_node(child) {
            return Some(found);
        }
    }
    None
}

/// Outline of type and function definitions with 1-based line numbers,
/// nested to mirror the syntax tree.
pub fn file_outline(code: &str, filename: &str) -> Option<String> {
    let grammar = grammar_for(filename)?;
    let tree = parse(code, &grammar)?;
    let mut out = String::new();
    collect_outline(tree.root_node(), code, &grammar, 0, &mut out);
    Some(out.trim_end().to_string())
}

fn collect_outline(node: Node<'_>, code: &str, grammar: &Grammar, depth: usize, out: &mut String) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match outline_label(child, grammar) {
            Some(label) => {
                // impl blocks name their subject via the "type" field.
                let name = child
                    .child_by_field_name("name")
                    .or_else(|| child.child_by_field_name("type"))
                    .and_then(|n| n.utf8_text(code.as_bytes()).ok())
                    .unwrap_or("?");
                let line = child.start_position().row + 1;
                out.push_str(&format!(
                    "{}{label} {name} (line {line})\n",
                    "  ".repeat(depth)
                ));
                collect_outline(child, code, grammar, depth + 1, out);
            }
            None => collect_outline(child, code, grammar, depth, out),
        }
    }
}

fn outline_label(node: Node<'_>, grammar: &Grammar) -> Option<&'static str> {
    match grammar {
        Grammar::Rust => match node.kind() {
            "function_item" => Some("fn"),
            "struct_item" => Some("struct"),
            "enum_item" => Some("enum"),
            "trait_item" => Some("trait"),
            "impl_item" => Some("impl"),
            "mod_item" => Some("mod"),
            _ => None,
        },
        Grammar::Python => match node.kind() {
            "function_definition" => Some("def"),
            "class_definition" => Some("class"),
            _ => None,
        },
    }
}
