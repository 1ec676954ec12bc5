use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::spec::CommitMode;
use crate::config::{DatasetSpec, WarehouseConfig};
use crate::error::{Classify, ErrorKind};
use crate::ingestion::types::FetchWindow;

pub mod postgres;
pub mod schema;
#[cfg(test)]
pub mod memory;

use schema::{Column, SchemaConflict, TableSchema};

/// `<project>.<dataset>.<table>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn for_spec(cfg: &WarehouseConfig, spec: &DatasetSpec) -> Self {
        TableRef { project: cfg.project.clone(), dataset: cfg.dataset.clone(), table: spec.table_name() }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// What a coverage query should look at.
#[derive(Clone, Debug)]
pub struct CoverageProbe {
    /// Range whose loaded windows should be listed; None skips the listing.
    pub range: Option<FetchWindow>,
    pub recent_since: DateTime<Utc>,
}

/// Observed state of one table, queried fresh every run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WarehouseCoverage {
    /// Loaded windows overlapping the probe range, merged and sorted.
    pub covered: Vec<FetchWindow>,
    pub latest_window_end: Option<DateTime<Utc>>,
    pub latest_record: Option<DateTime<Utc>>,
    pub row_count: i64,
    pub distinct_days: i64,
    pub recent_rows: i64,
}

impl WarehouseCoverage {
    pub fn is_empty(&self) -> bool { self.row_count == 0 }
}

/// Merge possibly overlapping or touching windows into sorted disjoint ranges.
pub fn merge_ranges(mut windows: Vec<FetchWindow>) -> Vec<FetchWindow> {
    windows.retain(|w| !w.is_empty());
    windows.sort();
    let mut out: Vec<FetchWindow> = Vec::with_capacity(windows.len());
    for w in windows {
        match out.last_mut() {
            Some(last) if w.from <= last.to => { if w.to > last.to { last.to = w.to; } }
            _ => out.push(w),
        }
    }
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMethod {
    /// Row-at-a-time inserts, low latency, small batches only.
    Streaming,
    /// Multi-row statements in bounded chunks.
    Bulk,
}

/// One record as the sink sees it.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedRow {
    pub key: String,
    pub record_time: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

/// A single atomic commit of one batch into one table.
#[derive(Clone, Debug)]
pub struct CommitRequest<'a> {
    pub table: &'a TableRef,
    pub dataset: &'a str,
    pub batch_id: Uuid,
    pub window: FetchWindow,
    pub ingested_at: DateTime<Utc>,
    pub mode: CommitMode,
    pub method: LoadMethod,
    pub all_or_nothing: bool,
    /// Record columns to write, in insert order: the table's known columns
    /// plus the batch's new ones. The sink re-checks them under its lock and
    /// adds whatever is still missing as nullable columns.
    pub columns: &'a [Column],
    pub rows: &'a [StagedRow],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RowError {
    pub key: String,
    pub message: String,
}

/// Per-row outcome of a commit; `inserted + existing + rejected.len()` equals rows sent.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SinkReport {
    pub inserted: usize,
    /// Keys already stored: replaced under merge, skipped under append.
    pub existing: usize,
    pub rejected: Vec<RowError>,
}

#[derive(Debug)]
pub enum WarehouseError {
    Db(sqlx::Error),
    Timeout(Duration),
    SchemaConflict { table: String, conflict: SchemaConflict },
    /// All-or-nothing batch had rejected rows and was rolled back.
    Rejected { table: String, rows: Vec<RowError> },
    Unavailable(String),
    Exhausted { attempts: u32, last: Box<WarehouseError> },
}

impl std::fmt::Display for WarehouseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarehouseError::Db(e) => write!(f, "database error: {e}"),
            WarehouseError::Timeout(d) => write!(f, "load timed out after {}s", d.as_secs()),
            WarehouseError::SchemaConflict { table, conflict } => write!(f, "schema conflict on {table}: {conflict}"),
            WarehouseError::Rejected { table, rows } => {
                let first = rows.first().map(|r| format!(" (first: {} {})", r.key, r.message)).unwrap_or_default();
                write!(f, "{} rows rejected by {table}, batch rolled back{first}", rows.len())
            }
            WarehouseError::Unavailable(msg) => write!(f, "warehouse unavailable: {msg}"),
            WarehouseError::Exhausted { attempts, last } => write!(f, "gave up after {attempts} attempts: {last}"),
        }
    }
}

impl std::error::Error for WarehouseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WarehouseError::Db(e) => Some(e),
            WarehouseError::Exhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for WarehouseError {
    fn from(e: sqlx::Error) -> Self { WarehouseError::Db(e) }
}

// serialization_failure, deadlock_detected, lock_not_available, too_many_connections, admin/crash shutdown
const RETRYABLE_SQLSTATES: [&str; 6] = ["40001", "40P01", "55P03", "53300", "57P01", "57P02"];

pub(crate) fn db_error_is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().map(|c| RETRYABLE_SQLSTATES.contains(&c.as_ref())).unwrap_or(false),
        _ => false,
    }
}

impl Classify for WarehouseError {
    fn kind(&self) -> ErrorKind {
        match self {
            WarehouseError::Db(e) if db_error_is_transient(e) => ErrorKind::Transient,
            WarehouseError::Db(_) => ErrorKind::Permanent,
            WarehouseError::Timeout(_) | WarehouseError::Unavailable(_) => ErrorKind::Transient,
            WarehouseError::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            WarehouseError::Rejected { .. } => ErrorKind::PartialLoadFailure,
            WarehouseError::Exhausted { last, .. } => last.kind(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::Exhausted { .. } => false,
            _ => self.kind() == ErrorKind::Transient,
        }
    }
}

/// The sink. Shared across workers; every `commit` is its own transaction.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Record columns of the table, or None if it does not exist yet.
    async fn describe(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError>;

    /// Coverage of the table; a missing table is empty coverage.
    async fn coverage(&self, table: &TableRef, probe: &CoverageProbe) -> Result<WarehouseCoverage, WarehouseError>;

    /// Evolve the schema and write the rows atomically: readers see all of
    /// the batch or none of it.
    async fn commit(&self, req: &CommitRequest<'_>) -> Result<SinkReport, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as Span, TimeZone};

    fn w(from_h: i64, to_h: i64) -> FetchWindow {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FetchWindow::new(base + Span::hours(from_h), base + Span::hours(to_h))
    }

    #[test]
    fn merges_touching_and_overlapping_ranges() {
        let merged = merge_ranges(vec![w(5, 6), w(0, 2), w(2, 3), w(1, 2), w(8, 8)]);
        assert_eq!(merged, vec![w(0, 3), w(5, 6)]);
    }

    #[test]
    fn exhausted_reports_cause_kind_but_is_final() {
        let e = WarehouseError::Exhausted { attempts: 5, last: Box::new(WarehouseError::Timeout(Duration::from_secs(900))) };
        assert_eq!(e.kind(), ErrorKind::Transient);
        assert!(!e.is_retryable());
        assert!(WarehouseError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!WarehouseError::Rejected { table: "t".into(), rows: vec![] }.is_retryable());
    }

    #[test]
    fn table_ref_display() {
        let spec = DatasetSpec::new("FUELINST", "startTime");
        let t = TableRef::for_spec(&WarehouseConfig::default(), &spec);
        assert_eq!(t.to_string(), "uk_energy.uk_energy_prod.bmrs_fuelinst");
    }
}
