use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::matcher::{glob_match, regex_full_match};

/// Which rule form accepted a minion id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutosignMatch {
    Exact(String),
    Glob(String),
    Regex(String),
}

/// Rules read from an autosign (or autoreject) file: one entry per line,
/// `#` comments ignored. The file is re-read when its mtime changes and is
/// ignored entirely when it is writable by others.
#[derive(Debug, Default)]
pub struct AutoSign {
    path: Option<PathBuf>,
    mtime: Option<SystemTime>,
    entries: Vec<String>,
}

impl AutoSign {
    pub fn from_file(path: Option<PathBuf>) -> Self {
        Self {
            path,
            mtime: None,
            entries: Vec::new(),
        }
    }

    pub fn from_entries(entries: &[&str]) -> Self {
        Self {
            path: None,
            mtime: None,
            entries: entries.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// Match `id` against every entry by exact string first, then glob, then
    /// full regex. The first hit wins.
    pub fn check(&mut self, id: &str) -> Option<AutosignMatch> {
        self.refresh();

        if let Some(e) = self.entries.iter().find(|e| e.as_str() == id) {
            return Some(AutosignMatch::Exact(e.clone()));
        }
        if let Some(e) = self.entries.iter().find(|e| glob_match(e, id)) {
            return Some(AutosignMatch::Glob(e.clone()));
        }
        self.entries
            .iter()
            .find(|e| regex_full_match(e, id))
            .map(|e| AutosignMatch::Regex(e.clone()))
    }

    fn refresh(&mut self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => {
                self.entries.clear();
                self.mtime = None;
                return;
            }
        };

        if !permissions_ok(&path, &meta) {
            tracing::warn!(path = %path.display(), "Wrong permissions on signing file, ignoring content");
            self.entries.clear();
            self.mtime = None;
            return;
        }

        let mtime = meta.modified().ok();
        if mtime.is_some() && mtime == self.mtime {
            return;
        }

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                self.entries = text
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                self.mtime = mtime;
                tracing::debug!(path = %path.display(), entries = self.entries.len(), "Loaded signing file");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read signing file");
                self.entries.clear();
            }
        }
    }
}

#[cfg(unix)]
fn permissions_ok(_path: &Path, meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o002 == 0
}

#[cfg(not(unix))]
fn permissions_ok(_path: &Path, _meta: &std::fs::Metadata) -> bool {
    true
}
