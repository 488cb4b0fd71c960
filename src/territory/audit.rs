//! Append-only JSONL trail of assignment reconciliation runs.
//!
//! One line per run: who reconciled whose territory, what was planned, what
//! was applied, and running totals since start-up. With chaining enabled each
//! line also carries the SHA-256 of the previous line's content, and the chain
//! only advances once a line is on disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::sync::{Mutex, OnceLock};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::AuditConfig;
use crate::db::EmployeeId;
use crate::territory::scope::Role;

pub const EVENT_RECONCILED: &str = "assignment_reconciled";
pub const EVENT_RECONCILE_FAILED: &str = "assignment_reconcile_failed";

/// What one reconciliation run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileRun {
    pub actor_id: EmployeeId,
    pub actor_role: Role,
    pub employee_id: EmployeeId,
    pub before: usize,
    pub desired: usize,
    pub planned_added: usize,
    pub planned_removed: usize,
    pub applied_added: usize,
    pub applied_removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReconcileRun {
    pub fn event_type(&self) -> &'static str {
        if self.error.is_some() {
            EVENT_RECONCILE_FAILED
        } else {
            EVENT_RECONCILED
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
struct Totals {
    runs: u64,
    failures: u64,
    rows_added: u64,
    rows_removed: u64,
}

impl Totals {
    fn after(mut self, run: &ReconcileRun) -> Self {
        self.runs += 1;
        if run.error.is_some() {
            self.failures += 1;
        }
        self.rows_added += run.applied_added as u64;
        self.rows_removed += run.applied_removed as u64;
        self
    }
}

#[derive(Serialize)]
struct TrailLine<'a> {
    ts: String,
    event_type: &'static str,
    #[serde(flatten)]
    run: &'a ReconcileRun,
    totals: Totals,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
}

#[derive(Debug, Default)]
struct ChainHead {
    last_hash: Option<String>,
    totals: Totals,
}

#[derive(Debug, thiserror::Error)]
enum TrailError {
    #[error("trail state lock poisoned")]
    Poisoned,
    #[error("encoding trail line: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} has mode {mode:o}, expected 600", path.display())]
    InsecureMode { path: PathBuf, mode: u32 },
}

struct Trail {
    path: PathBuf,
    hash_chain: bool,
    head: Mutex<ChainHead>,
}

impl Trail {
    fn new(path: PathBuf, hash_chain: bool) -> Self {
        Self {
            path,
            hash_chain,
            head: Mutex::new(ChainHead::default()),
        }
    }

    fn io_error(&self, source: std::io::Error) -> TrailError {
        TrailError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// The head lock is held until the line is on disk.
    fn append(&self, run: &ReconcileRun) -> Result<(), TrailError> {
        let mut head = self.head.lock().map_err(|_| TrailError::Poisoned)?;
        let totals = head.totals.after(run);

        let mut line = TrailLine {
            ts: Utc::now().to_rfc3339(),
            event_type: run.event_type(),
            run,
            totals,
            prev_hash: head.last_hash.clone(),
            hash: None,
        };
        if self.hash_chain {
            line.hash = Some(format!("{:x}", Sha256::digest(serde_json::to_vec(&line)?)));
        }
        let encoded = serde_json::to_string(&line)?;

        let mut file = self.open()?;
        writeln!(file, "{encoded}").map_err(|e| self.io_error(e))?;

        head.totals = totals;
        if line.hash.is_some() {
            head.last_hash = line.hash;
        }
        Ok(())
    }

    /// Files are created 0600. An existing file with any other mode is
    /// refused, never written to or chmod-ed.
    fn open(&self) -> Result<File, TrailError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(&self.path).map_err(|e| self.io_error(e))?;

        #[cfg(unix)]
        {
            let mode = file.metadata().map_err(|e| self.io_error(e))?.permissions().mode() & 0o777;
            if mode != 0o600 {
                return Err(TrailError::InsecureMode {
                    path: self.path.clone(),
                    mode,
                });
            }
        }
        Ok(file)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

static TRAIL: OnceLock<Trail> = OnceLock::new();
#[cfg(test)]
static CAPTURED: OnceLock<Mutex<Vec<ReconcileRun>>> = OnceLock::new();

/// Start writing the trail. No-op when disabled or already initialized.
pub fn init(config: &AuditConfig) {
    if !config.enabled {
        return;
    }
    if TRAIL
        .set(Trail::new(config.path.clone(), config.hash_chain))
        .is_ok()
    {
        tracing::debug!(path = %config.path.display(), "assignment audit trail enabled");
    }
}

/// Append one run to the trail. A line that cannot be written is logged and
/// dropped; reconciliation itself is never failed by the trail.
pub fn record(run: &ReconcileRun) {
    #[cfg(test)]
    {
        if let Ok(mut captured) = CAPTURED.get_or_init(|| Mutex::new(Vec::new())).lock() {
            captured.push(run.clone());
        }
    }
    let Some(trail) = TRAIL.get() else {
        return;
    };
    if let Err(e) = trail.append(run) {
        tracing::warn!(
            path = %trail.path().display(),
            employee_id = %run.employee_id,
            "assignment audit line dropped: {}",
            e
        );
    }
}

/// Runs recorded so far, in order. Tests share this across threads, so
/// callers filter by an employee id they own.
#[cfg(test)]
pub(crate) fn captured_runs() -> Vec<ReconcileRun> {
    CAPTURED
        .get()
        .and_then(|runs| runs.lock().ok().map(|runs| runs.clone()))
        .unwrap_or_default()
}
