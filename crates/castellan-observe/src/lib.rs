//! Runtime logging: timestamped lines appended to `.castellan/observe.log`,
//! with optional verbose echo to stderr.

use anyhow::Result;
use castellan_core::runtime_dir;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(workspace: &Path) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Record a runtime event. Failures to write the log are swallowed;
    /// observability must never take the session down.
    pub fn record(&self, msg: &str) {
        let _ = self.append_log_line(&format!("{} INFO {msg}", Utc::now().to_rfc3339()));
        if self.verbose {
            eprintln!("[castellan] {msg}");
        }
    }

    /// Warnings go to stderr unconditionally and to the log file.
    pub fn warn(&self, msg: &str) {
        eprintln!("[castellan WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
