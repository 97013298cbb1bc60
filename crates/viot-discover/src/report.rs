//! Per-cycle JSON report.
//!
//! Each cycle leaves one report on disk as its audit record:
//!
//! ```text
//! {report_dir}/
//!   2026/
//!     10/
//!       16/
//!         {cycle_id}.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coordinator::{CoordinatorOutcome, RoomTally};
use crate::persist::PersistSummary;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Totals and failures for one discovery cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Rooms requested for this cycle.
    pub rooms: Vec<String>,
    pub rooms_scanned: usize,
    pub alive: usize,
    pub identified: usize,
    /// SNMP hosts that matched no signature.
    pub unknown: usize,
    pub duplicates: usize,
    pub rows_written: usize,
    pub tallies: Vec<RoomTally>,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn start(cycle_id: Uuid, rooms: Vec<String>) -> Self {
        Self {
            cycle_id,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
            rooms,
            rooms_scanned: 0,
            alive: 0,
            identified: 0,
            unknown: 0,
            duplicates: 0,
            rows_written: 0,
            tallies: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Fold in a coordinator pass. Room and host errors become strings.
    pub fn record_scan(&mut self, outcome: &CoordinatorOutcome) {
        self.rooms_scanned += outcome.tallies.len();
        self.alive += outcome.tallies.iter().map(|t| t.alive).sum::<usize>();
        self.identified += outcome.records.iter().filter(|r| !r.is_unknown()).count();
        self.unknown += outcome.records.iter().filter(|r| r.is_unknown()).count();
        self.tallies.extend(outcome.tallies.iter().cloned());
        self.errors
            .extend(outcome.room_errors.iter().map(ToString::to_string));
        self.errors
            .extend(outcome.host_errors.iter().map(ToString::to_string));
    }

    pub fn record_persist(&mut self, summary: &PersistSummary) {
        self.rows_written += summary.written();
        self.duplicates += summary.duplicates;
        self.errors.extend(summary.errors.iter().map(ToString::to_string));
    }

    pub fn record_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
    }

    pub fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }

    /// Where this report lives under `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        let date = self.started_at.format("%Y/%m/%d");
        root.join(format!("{date}/{}.json", self.cycle_id))
    }

    pub fn save(&self, root: &Path) -> Result<PathBuf, ReportError> {
        let path = self.path_in(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Write `report` under `dir`. A failed write is logged, never fatal.
pub fn store_report(report: &CycleReport, dir: &Path) -> Option<PathBuf> {
    match report.save(dir) {
        Ok(path) => {
            tracing::info!(
                cycle_id = %report.cycle_id,
                path = %path.display(),
                "Cycle report recorded"
            );
            Some(path)
        }
        Err(e) => {
            tracing::warn!(cycle_id = %report.cycle_id, error = %e, "Failed to store cycle report");
            None
        }
    }
}
