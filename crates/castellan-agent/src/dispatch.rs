//! The stringification boundary: typed tool results become the bracketed
//! markers the model sees. Nothing below this layer formats markers, and
//! nothing above it sees typed errors.

use castellan_core::{Retriever, ToolCall, format_context_block};
use castellan_tools::{ToolError, ToolHost};
use castellan_web::{WebClient, WebError};

const DEFAULT_SEARCH_RESULTS: usize = 5;

pub fn dispatch_tool_call(
    call: &ToolCall,
    host: &ToolHost,
    web: &WebClient,
    retriever: &dyn Retriever,
) -> String {
    match call {
        ToolCall::ReadFile { path, start_line, end_line } => {
            render_read(host.read_file(path, *start_line, *end_line), call)
        }
        ToolCall::ListFiles { path } => render_read(host.list_files(path), call),
        ToolCall::SearchFiles { query, root_dir } => {
            render_read(host.search_files(query, root_dir), call)
        }
        ToolCall::GetFileStructure { path } => render_read(host.get_file_structure(path), call),
        ToolCall::WriteFile { path, content } => {
            render_mutation(host.write_file(path, content), call)
        }
        ToolCall::EditFile { path, old_text, new_text } => {
            render_mutation(host.edit_file(path, old_text, new_text), call)
        }
        ToolCall::MoveFile { src, dst } => render_mutation(host.move_file(src, dst), call),
        ToolCall::CopyFile { src, dst } => render_mutation(host.copy_file(src, dst), call),
        ToolCall::DeleteFile { path } => render_mutation(host.delete_file(path), call),
        ToolCall::ExecuteCommand { command, cwd } => {
            let cwd = if cwd.trim().is_empty() { None } else { Some(cwd.as_str()) };
            render_read(host.execute_command(command, cwd), call)
        }
        ToolCall::WebSearch { query, max_results } => render_web(
            web.search(query, max_results.unwrap_or(DEFAULT_SEARCH_RESULTS)),
        ),
        ToolCall::FetchUrl { url } => render_web(web.fetch(url)),
        ToolCall::SearchMemory { query } => match retriever.retrieve(query) {
            Ok(chunks) if chunks.is_empty() => {
                "No memory archive entries matched that query.".to_string()
            }
            Ok(chunks) => format_context_block(&chunks),
            Err(err) => format!("[TOOL_ERROR] {}: {err}", call.name()),
        },
    }
}

/// Read-style results pass through as-is on success.
fn render_read(result: Result<String, ToolError>, call: &ToolCall) -> String {
    match result {
        Ok(text) => text,
        Err(err) => render_tool_error(err, call),
    }
}

/// Mutations get an explicit success marker so the model can tell an
/// applied change from a description of one.
fn render_mutation(result: Result<String, ToolError>, call: &ToolCall) -> String {
    match result {
        Ok(text) => format!("[Success: {text}]"),
        Err(err) => render_tool_error(err, call),
    }
}

fn render_tool_error(err: ToolError, call: &ToolCall) -> String {
    match err {
        ToolError::Denied(inner) => format!("[Permission Denied: {inner}]"),
        ToolError::Unsupported(msg) => format!("[Info: {msg}]"),
        ToolError::NotFound(_)
        | ToolError::InvalidArgument(_)
        | ToolError::Parse(_)
        | ToolError::Timeout(_) => format!("[Error: {err}]"),
        ToolError::Io(msg) => format!("[TOOL_ERROR] {}: {msg}", call.name()),
    }
}

fn render_web(result: Result<String, WebError>) -> String {
    match result {
        Ok(text) => text,
        Err(WebError::EmptyBody(url)) => {
            format!("[Warning: fetched {url} but found no readable content]")
        }
        Err(err) => format!("[Error: {err}]"),
    }
}
