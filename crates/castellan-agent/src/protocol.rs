//! Tag protocol: extracting tool calls from assistant output.
//!
//! The model requests tools with XML-ish tags. Calls carrying body content
//! use paired tags (`<write_file path="x">...</write_file>`); calls whose
//! arguments fit in attributes use the self-closing form
//! (`<read_file path="x" />`). `edit_file` accepts both. The whole message
//! is scanned and calls are returned in document order; a message with no
//! recognized tags means the model is done with tools for this turn.

use castellan_core::ToolCall;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

const PAIRED_TOOLS: &[&str] = &["write_file", "edit_file", "execute_command"];

/// One pattern per paired tool; the closing tag is spelled out literally
/// because the regex engine has no backreferences.
static PAIRED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    PAIRED_TOOLS
        .iter()
        .map(|tag| {
            // The attr group must not end in '/' so a self-closing opener
            // cannot pair with a later closing tag.
            let pattern = format!(r"(?s)<{tag}\b((?:[^>]*[^/>])?)>(.*?)</\s*{tag}\s*>");
            (*tag, Regex::new(&pattern).expect("valid regex"))
        })
        .collect()
});

static SELF_CLOSING_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<(read_file|list_files|search_files|move_file|copy_file|delete_file|get_file_structure|edit_file|web_search|fetch_url|search_memory)\b([^>]*?)/\s*>",
    )
    .expect("valid regex")
});

static ATTR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([a-z_]+)\s*=\s*"([^"]*)""#).expect("valid regex"));

pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut found: Vec<(usize, ToolCall)> = Vec::new();

    for &(name, ref pattern) in PAIRED_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            let offset = captures.get(0).map(|m| m.start()).unwrap_or(0);
            let raw_attrs = &captures[1];
            // Covers the degenerate '/ >' spelling the pattern lets through.
            if raw_attrs.trim_end().ends_with('/') {
                continue;
            }
            let attrs = parse_attrs(raw_attrs);
            let body = &captures[2];
            if let Some(call) = build_paired_call(name, &attrs, body) {
                found.push((offset, call));
            }
        }
    }

    for captures in SELF_CLOSING_PATTERN.captures_iter(text) {
        let offset = captures.get(0).map(|m| m.start()).unwrap_or(0);
        let name = &captures[1];
        let attrs = parse_attrs(&captures[2]);
        if let Some(call) = build_self_closing_call(name, &attrs) {
            found.push((offset, call));
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    found.into_iter().map(|(_, call)| call).collect()
}

/// Attribute values are double-quoted; anything malformed is simply absent.
fn parse_attrs(raw: &str) -> HashMap<String, String> {
    ATTR_PATTERN
        .captures_iter(raw)
        .map(|c| (c[1].to_string(), c[2].to_string()))
        .collect()
}

fn build_paired_call(
    name: &str,
    attrs: &HashMap<String, String>,
    body: &str,
) -> Option<ToolCall> {
    match name {
        "write_file" => Some(ToolCall::WriteFile {
            path: attrs.get("path")?.clone(),
            content: strip_edge_newlines(body).to_string(),
        }),
        "edit_file" => {
            let old_text = inner_tag(body, &OLD_TEXT_PATTERN)?;
            let new_text = inner_tag(body, &NEW_TEXT_PATTERN)?;
            Some(ToolCall::EditFile {
                path: attrs.get("path")?.clone(),
                old_text,
                new_text,
            })
        }
        "execute_command" => {
            let command = body.trim().to_string();
            if command.is_empty() {
                return None;
            }
            Some(ToolCall::ExecuteCommand {
                command,
                cwd: attrs.get("cwd").cloned().unwrap_or_default(),
            })
        }
        _ => None,
    }
}

fn build_self_closing_call(name: &str, attrs: &HashMap<String, String>) -> Option<ToolCall> {
    match name {
        "read_file" => Some(ToolCall::ReadFile {
            path: attrs.get("path")?.clone(),
            start_line: numeric(attrs, "start_line"),
            end_line: numeric(attrs, "end_line"),
        }),
        "list_files" => Some(ToolCall::ListFiles {
            path: attrs.get("path").cloned().unwrap_or_else(|| ".".to_string()),
        }),
        "search_files" => Some(ToolCall::SearchFiles {
            query: attrs.get("query")?.clone(),
            root_dir: attrs
                .get("root_dir")
                .cloned()
                .unwrap_or_else(|| ".".to_string()),
        }),
        "move_file" => Some(ToolCall::MoveFile {
            src: attrs.get("src")?.clone(),
            dst: attrs.get("dst")?.clone(),
        }),
        "copy_file" => Some(ToolCall::CopyFile {
            src: attrs.get("src")?.clone(),
            dst: attrs.get("dst")?.clone(),
        }),
        "delete_file" => Some(ToolCall::DeleteFile {
            path: attrs.get("path")?.clone(),
        }),
        // Attribute form for short single-line edits; multi-line edits use
        // the paired form with nested old_text/new_text blocks.
        "edit_file" => Some(ToolCall::EditFile {
            path: attrs.get("path")?.clone(),
            old_text: attrs.get("old_text")?.clone(),
            new_text: attrs.get("new_text")?.clone(),
        }),
        "get_file_structure" => Some(ToolCall::GetFileStructure {
            path: attrs.get("path")?.clone(),
        }),
        "web_search" => Some(ToolCall::WebSearch {
            query: attrs.get("query")?.clone(),
            max_results: numeric(attrs, "max_results"),
        }),
        "fetch_url" => Some(ToolCall::FetchUrl {
            url: attrs.get("url")?.clone(),
        }),
        "search_memory" => Some(ToolCall::SearchMemory {
            query: attrs.get("query")?.clone(),
        }),
        _ => None,
    }
}

fn numeric(attrs: &HashMap<String, String>, key: &str) -> Option<usize> {
    attrs.get(key).and_then(|v| v.trim().parse().ok())
}

static OLD_TEXT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<old_text>(.*?)</old_text>").expect("valid regex"));
static NEW_TEXT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<new_text>(.*?)</new_text>").expect("valid regex"));

fn inner_tag(body: &str, pattern: &Regex) -> Option<String> {
    pattern
        .captures(body)
        .map(|c| strip_edge_newlines(&c[1]).to_string())
}

/// Tag bodies usually start right after the opening tag's newline; strip one
/// leading and one trailing newline so file content matches what the model
/// visibly wrote, without disturbing intentional blank lines.
fn strip_edge_newlines(body: &str) -> &str {
    let body = body.strip_prefix('\n').unwrap_or(body);
    body.strip_suffix('\n').unwrap_or(body)
}
