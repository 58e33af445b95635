//! Project sandbox: the single enforcement point deciding whether a path may
//! be mutated. Containment is decided on canonicalized paths compared
//! component by component, never on string prefixes.

use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox root {root}: {source}")]
    Root {
        root: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{action} denied: {path} is outside the project root {root}")]
    OutsideRoot {
        action: String,
        path: PathBuf,
        root: PathBuf,
    },
}

/// Explicit sandbox context. Each `Sandbox` value carries its own root;
/// callers that need a different root construct a different value.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Build a sandbox rooted at `root`. The root must exist; it is
    /// canonicalized once so later checks compare real paths.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|source| SandboxError::Root {
            root: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root: canonical })
    }

    /// Sandbox rooted at the process working directory.
    pub fn current_dir() -> Result<Self, SandboxError> {
        let cwd = std::env::current_dir().map_err(|source| SandboxError::Root {
            root: PathBuf::from("."),
            source,
        })?;
        Self::new(cwd)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a tool-supplied path: relative paths are anchored at the
    /// sandbox root, then the result is canonicalized as far as the
    /// filesystem allows (targets about to be created do not exist yet, so
    /// the nearest existing ancestor is canonicalized and the remainder is
    /// normalized lexically on top of it).
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        canonicalize_lenient(&absolute)
    }

    #[must_use]
    pub fn is_inside(&self, path: &Path) -> bool {
        self.resolve(path).starts_with(&self.root)
    }

    /// Enforcement point for mutating operations. Returns the resolved
    /// absolute path so callers operate on exactly what was checked.
    pub fn require_inside(&self, path: &Path, action: &str) -> Result<PathBuf, SandboxError> {
        let resolved = self.resolve(path);
        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(SandboxError::OutsideRoot {
                action: action.to_string(),
                path: resolved,
                root: self.root.clone(),
            })
        }
    }
}

/// Canonicalize the longest existing prefix of `path`, then append the
/// non-existing remainder with `.` and `..` components folded lexically.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for part in remainder.iter().rev() {
                    if part == ".." {
                        out.pop();
                    } else if part != "." {
                        out.push(part);
                    }
                }
                return out;
            }
            Err(_) => match existing.file_name() {
                Some(name) => {
                    remainder.push(name.to_os_string());
                    existing.pop();
                }
                // Ran out of ancestors; fall back to a lexical cleanup.
                None => return normalize_lexical(path),
            },
        }
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
