//! Ephemeral files staged during a render cycle.
//!
//! Every render gets a [`StagingSession`] whose files carry the report id and
//! a per-session token, so overlapping renders never share a file. The session
//! removes its files on `finish()` and again on drop.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PortalError;

const MAX_LABEL_LEN: usize = 48;

/// The process-local directory that holds staged files
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

/// Outcome of a stale-file sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Open a session for one render of `report_id`
    pub fn session(&self, report_id: &str) -> StagingSession {
        StagingSession {
            dir: self.dir.clone(),
            label: sanitize(report_id),
            token: Uuid::new_v4().simple().to_string(),
            paths: Mutex::new(Vec::new()),
        }
    }

    /// Remove files last modified more than `max_age` ago.
    ///
    /// Bounds leftovers from renders that died before cleaning up. Failures are
    /// logged and counted, never returned.
    pub fn purge_stale(&self, max_age: Duration) -> PurgeReport {
        let mut report = PurgeReport::default();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return report,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "cannot read staging directory");
                return report;
            }
        };

        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), age_secs = age.as_secs(), "removed stale staged file");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to remove stale staged file");
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 || report.failed > 0 {
            info!(
                removed = report.removed,
                failed = report.failed,
                "staging directory purge finished"
            );
        }
        report
    }
}

/// Files staged by one render cycle
#[derive(Debug)]
pub struct StagingSession {
    dir: PathBuf,
    label: String,
    token: String,
    paths: Mutex<Vec<PathBuf>>,
}

impl StagingSession {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a staged file named `name` gets in this session
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("report_{}_{}_{}", self.label, self.token, sanitize_file(name)))
    }

    /// Write `bytes` to a new staged file and track it for cleanup
    pub fn stage(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, PortalError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            PortalError::staging(format!("cannot create {}: {}", self.dir.display(), e))
        })?;
        let path = self.path_for(name);
        // Track before writing so a partial write is still cleaned up.
        self.track(path.clone());
        fs::write(&path, bytes)
            .map_err(|e| PortalError::staging(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    fn track(&self, path: PathBuf) {
        if let Ok(mut paths) = self.paths.lock()
            && !paths.contains(&path)
        {
            paths.push(path);
        }
    }

    pub fn staged_paths(&self) -> Vec<PathBuf> {
        self.paths.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Remove every file staged so far; returns how many were removed
    pub fn finish(&self) -> usize {
        let paths = match self.paths.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return 0,
        };
        cleanup(&paths)
    }
}

impl Drop for StagingSession {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Best-effort removal of staged files. Errors are logged, never propagated.
pub fn cleanup(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove staged file"),
        }
    }
    if removed > 0 {
        debug!(removed, "cleaned up staged files");
    }
    removed
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(MAX_LABEL_LEN)
        .collect();
    if cleaned.is_empty() {
        "anonymous".to_string()
    } else {
        cleaned
    }
}

fn sanitize_file(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .take(MAX_LABEL_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
