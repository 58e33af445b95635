//! Filesystem and shell capabilities exposed to the agent.
//!
//! Read-only operations (read, list, search, outline) work anywhere on
//! disk. Every mutating operation resolves its path through the sandbox
//! first; `Sandbox::require_inside` is the only gate.

use castellan_core::ToolsConfig;
use castellan_policy::{Sandbox, SandboxError};
use ignore::WalkBuilder;
use similar::TextDiff;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod shell;
mod syntax;

pub use shell::{PlatformShellRunner, ShellOutput, ShellRunner};
pub use syntax::{file_outline, validate_syntax};

/// Directories that are runtime noise, never useful to the model.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "__pycache__",
    "node_modules",
    "venv",
    "env",
    "target",
    "build",
    "dist",
    ".castellan",
];

const CRASH_LOG: &str = "crash.log";
const SNIPPET_CHAR_CAP: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Denied(#[from] SandboxError),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("command timed out after {0} seconds")]
    Timeout(u64),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

pub struct ToolHost {
    sandbox: Sandbox,
    shell: Box<dyn ShellRunner>,
    cfg: ToolsConfig,
}

impl ToolHost {
    pub fn new(sandbox: Sandbox, cfg: ToolsConfig) -> Self {
        Self {
            sandbox,
            shell: Box::new(PlatformShellRunner),
            cfg,
        }
    }

    pub fn with_shell(sandbox: Sandbox, cfg: ToolsConfig, shell: Box<dyn ShellRunner>) -> Self {
        Self { sandbox, shell, cfg }
    }

    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Read-only resolution: relative paths anchor at the project root, no
    /// containment check.
    fn resolve_read(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.sandbox.root().join(path)
        }
    }

    pub fn read_file(
        &self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<String, ToolError> {
        let resolved = self.resolve_read(path);
        if resolved.file_name().is_some_and(|n| n == CRASH_LOG) {
            return Err(ToolError::Unsupported(format!(
                "{CRASH_LOG} holds runtime diagnostics and is not readable through tools"
            )));
        }
        if !resolved.is_file() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        let raw = fs::read(&resolved)?;
        let content = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        if total == 0 {
            return Ok("(empty file)".to_string());
        }

        let start = start_line.unwrap_or(1).max(1);
        if start > total {
            return Err(ToolError::InvalidArgument(format!(
                "start_line {start} is beyond the end of the file ({total} lines)"
            )));
        }
        let default_end = start + self.cfg.read_page_lines - 1;
        let end = end_line.unwrap_or(default_end).min(total).max(start);

        let mut out = lines[start - 1..end].join("\n");
        if start > 1 || end < total {
            out.push_str(&format!(
                "\n\n[Showing lines {start}-{end} of {total}. Use start_line/end_line to read more.]"
            ));
        }
        Ok(out)
    }

    pub fn list_files(&self, root_dir: &str) -> Result<String, ToolError> {
        let root = self.resolve_read(root_dir);
        if !root.is_dir() {
            return Err(ToolError::NotFound(root_dir.to_string()));
        }
        let paths = walk_paths(&root);
        if paths.is_empty() {
            return Ok("(no files)".to_string());
        }
        Ok(paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub fn search_files(&self, query: &str, root_dir: &str) -> Result<String, ToolError> {
        if query.is_empty() {
            return Err(ToolError::InvalidArgument(
                "search query must not be empty".to_string(),
            ));
        }
        let root = self.resolve_read(root_dir);
        if !root.is_dir() {
            return Err(ToolError::NotFound(root_dir.to_string()));
        }

        let mut matches = Vec::new();
        let mut truncated = false;
        'files: for rel in walk_paths(&root) {
            let Ok(content) = fs::read_to_string(root.join(&rel)) else {
                // Binary or unreadable; skip.
                continue;
            };
            for (idx, line) in content.lines().enumerate() {
                if !line.contains(query) {
                    continue;
                }
                matches.push(format!(
                    "{}:{}: {}",
                    rel.display(),
                    idx + 1,
                    cap_chars(line.trim(), SNIPPET_CHAR_CAP)
                ));
                if matches.len() >= self.cfg.search_match_cap {
                    truncated = true;
                    break 'files;
                }
            }
        }

        if matches.is_empty() {
            return Ok(format!("No matches found for '{query}'."));
        }
        let mut out = matches.join("\n");
        if truncated {
            out.push_str("\n... (truncated)");
        }
        Ok(out)
    }

    pub fn get_file_structure(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve_read(path);
        if !resolved.is_file() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        let content = fs::read_to_string(&resolved)?;
        let filename = file_name_of(&resolved);
        match file_outline(&content, &filename) {
            Some(outline) if outline.is_empty() => Ok("(no definitions found)".to_string()),
            Some(outline) => {
                if let Some(problem) = validate_syntax(&content, &filename) {
                    return Err(ToolError::Parse(format!(
                        "cannot outline {path}: {problem}"
                    )));
                }
                Ok(outline)
            }
            None => Err(ToolError::Unsupported(format!(
                "structure view is not supported for '{filename}' (supported: .rs, .py)"
            ))),
        }
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<String, ToolError> {
        let resolved = self.sandbox.require_inside(Path::new(path), "write_file")?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&resolved, content)?;
        let mut out = format!("Wrote {} bytes to {}", content.len(), resolved.display());
        if let Some(problem) = validate_syntax(content, &file_name_of(&resolved)) {
            out.push_str(&format!("\n[Warning: file was written but has a syntax error: {problem}]"));
        }
        Ok(out)
    }

    pub fn edit_file(
        &self,
        path: &str,
        old_text: &str,
        new_text: &str,
    ) -> Result<String, ToolError> {
        if old_text.is_empty() {
            return Err(ToolError::InvalidArgument(
                "old_text must not be empty".to_string(),
            ));
        }
        let resolved = self.sandbox.require_inside(Path::new(path), "edit_file")?;
        if !resolved.is_file() {
            return Err(ToolError::NotFound(path.to_string()));
        }
        let content = fs::read_to_string(&resolved)?;
        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Err(ToolError::InvalidArgument(format!(
                "old_text was not found in {path}"
            )));
        }
        if occurrences > 1 {
            return Err(ToolError::InvalidArgument(format!(
                "old_text matches {occurrences} locations in {path}; include more surrounding context"
            )));
        }
        let updated = content.replacen(old_text, new_text, 1);
        fs::write(&resolved, &updated)?;

        let filename = file_name_of(&resolved);
        let mut out = format!(
            "Edited {}.\n{}",
            resolved.display(),
            get_diff(&content, &updated, &filename)
        );
        if let Some(problem) = validate_syntax(&updated, &filename) {
            out.push_str(&format!("\n[Warning: file was edited but has a syntax error: {problem}]"));
        }
        Ok(out)
    }

    pub fn move_file(&self, src: &str, dst: &str) -> Result<String, ToolError> {
        let src_resolved = self.sandbox.require_inside(Path::new(src), "move_file")?;
        let dst_resolved = self.sandbox.require_inside(Path::new(dst), "move_file")?;
        if !src_resolved.exists() {
            return Err(ToolError::NotFound(src.to_string()));
        }
        if let Some(parent) = dst_resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src_resolved, &dst_resolved)?;
        Ok(format!(
            "Moved {} to {}",
            src_resolved.display(),
            dst_resolved.display()
        ))
    }

    pub fn copy_file(&self, src: &str, dst: &str) -> Result<String, ToolError> {
        // Sources may be read from anywhere; only the destination mutates
        // the project.
        let src_resolved = self.resolve_read(src);
        let dst_resolved = self.sandbox.require_inside(Path::new(dst), "copy_file")?;
        if !src_resolved.is_file() {
            return Err(ToolError::NotFound(src.to_string()));
        }
        if let Some(parent) = dst_resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&src_resolved, &dst_resolved)?;
        Ok(format!(
            "Copied {} to {}",
            src_resolved.display(),
            dst_resolved.display()
        ))
    }

    pub fn delete_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.sandbox.require_inside(Path::new(path), "delete_file")?;
        if resolved.is_dir() {
            fs::remove_dir_all(&resolved)?;
            Ok(format!("Deleted directory {}", resolved.display()))
        } else if resolved.is_file() {
            fs::remove_file(&resolved)?;
            Ok(format!("Deleted file {}", resolved.display()))
        } else {
            Err(ToolError::NotFound(path.to_string()))
        }
    }

    pub fn execute_command(&self, command: &str, cwd: Option<&str>) -> Result<String, ToolError> {
        if command.trim().is_empty() {
            return Err(ToolError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        let cwd = match cwd {
            Some(dir) if !dir.trim().is_empty() => {
                self.sandbox.require_inside(Path::new(dir), "execute_command")?
            }
            _ => self.sandbox.root().to_path_buf(),
        };
        if !cwd.is_dir() {
            return Err(ToolError::NotFound(cwd.display().to_string()));
        }

        let timeout = Duration::from_secs(self.cfg.shell_timeout_seconds);
        let output = self
            .shell
            .run(command, &cwd, timeout)
            .map_err(|e| ToolError::Io(e.to_string()))?;
        if output.timed_out {
            return Err(ToolError::Timeout(self.cfg.shell_timeout_seconds));
        }

        let mut out = String::new();
        if !output.stdout.trim().is_empty() {
            out.push_str(output.stdout.trim_end());
        }
        if !output.stderr.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("[stderr]\n");
            out.push_str(output.stderr.trim_end());
        }
        match output.status {
            Some(0) | None if out.is_empty() => out.push_str("(no output)"),
            Some(code) if code != 0 => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&format!("[exit code: {code}]"));
            }
            _ => {}
        }
        Ok(out)
    }
}

/// Unified diff with three lines of context and `a/`/`b/` labels.
#[must_use]
pub fn get_diff(old: &str, new: &str, filename: &str) -> String {
    if old == new {
        return "(no changes)".to_string();
    }
    let diff = TextDiff::from_lines(old, new);
    diff.unified_diff()
        .context_radius(3)
        .header(&format!("a/{filename}"), &format!("b/{filename}"))
        .to_string()
}

fn walk_paths(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .follow_links(false)
        .filter_entry(|entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            let name = entry.file_name().to_string_lossy();
            !(entry.depth() > 0 && is_dir && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if entry.file_name() == CRASH_LOG {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    out.sort();
    out
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn cap_chars(input: &str, cap: usize) -> String {
    if input.chars().count() <= cap {
        return input.to_string();
    }
    input.chars().take(cap).collect()
}
