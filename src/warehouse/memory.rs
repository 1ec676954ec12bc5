use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::schema::{infer, plan_evolution, TableSchema};
use super::{
    merge_ranges, CommitRequest, CoverageProbe, LoadMethod, RowError, SinkReport, TableRef, Warehouse, WarehouseCoverage,
    WarehouseError,
};
use crate::config::spec::CommitMode;
use crate::ingestion::types::FetchWindow;

#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    pub dataset: String,
    pub window: FetchWindow,
    pub batch_id: String,
    pub record_time: Option<DateTime<Utc>>,
    /// Every record column of the table; absent fields are Null.
    pub values: Map<String, Value>,
}

#[derive(Debug, Default)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<String, StoredRow>,
    /// Committed windows, the ledger coverage is read from.
    windows: Vec<FetchWindow>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitLog {
    pub table: String,
    pub method: LoadMethod,
    pub rows: usize,
}

/// Warehouse double with the same commit semantics as Postgres: additive
/// schema evolution, append/merge by key, per-row rejects, all-or-nothing.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<TableRef, MemTable>>,
    reject_keys: Mutex<HashSet<String>>,
    commit_failures: Mutex<VecDeque<WarehouseError>>,
    coverage_failures: Mutex<VecDeque<WarehouseError>>,
    commits: Mutex<Vec<CommitLog>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self { Self::default() }

    /// Rows with this key are rejected by the sink on every commit.
    pub fn reject_key(&self, key: &str) { self.reject_keys.lock().unwrap().insert(key.to_string()); }

    /// The next commit fails with `err` before touching anything.
    pub fn fail_next_commit(&self, err: WarehouseError) { self.commit_failures.lock().unwrap().push_back(err); }

    pub fn fail_next_coverage(&self, err: WarehouseError) { self.coverage_failures.lock().unwrap().push_back(err); }

    pub fn commits(&self) -> Vec<CommitLog> { self.commits.lock().unwrap().clone() }

    pub fn row_count(&self, table: &TableRef) -> usize {
        self.tables.lock().unwrap().get(table).map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn rows(&self, table: &TableRef) -> Vec<(String, StoredRow)> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.iter().map(|(k, r)| (k.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn schema(&self, table: &TableRef) -> Option<TableSchema> {
        self.tables.lock().unwrap().get(table).map(|t| t.schema.clone())
    }

    /// Seed a table as if an earlier run had loaded `rows` for `window`.
    pub fn seed(&self, table: &TableRef, window: FetchWindow, rows: Vec<(String, Option<DateTime<Utc>>, Map<String, Value>)>) {
        let mut tables = self.tables.lock().unwrap();
        let t = tables.entry(table.clone()).or_default();
        if let Ok(inferred) = infer(rows.iter().map(|(_, _, v)| v)) {
            if let Ok(added) = plan_evolution(&t.schema, &inferred) {
                for col in added { t.schema.push(col); }
            }
        }
        for (key, record_time, values) in rows {
            t.rows.insert(key, StoredRow { dataset: table.table.clone(), window, batch_id: "seed".into(), record_time, values });
        }
        t.windows.push(window);
    }

    /// Windows recorded as loaded, in commit order.
    pub fn loaded_windows(&self, table: &TableRef) -> Vec<FetchWindow> {
        self.tables.lock().unwrap().get(table).map(|t| t.windows.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn describe(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError> {
        Ok(self.schema(table))
    }

    async fn coverage(&self, table: &TableRef, probe: &CoverageProbe) -> Result<WarehouseCoverage, WarehouseError> {
        if let Some(err) = self.coverage_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let tables = self.tables.lock().unwrap();
        let Some(t) = tables.get(table) else { return Ok(WarehouseCoverage::default()) };
        let mut days = HashSet::new();
        let mut cov = WarehouseCoverage::default();
        for r in t.rows.values() {
            cov.row_count += 1;
            cov.latest_record = cov.latest_record.max(r.record_time);
            if let Some(ts) = r.record_time {
                days.insert(ts.date_naive());
                if ts >= probe.recent_since { cov.recent_rows += 1; }
            }
        }
        cov.distinct_days = days.len() as i64;
        cov.latest_window_end = t.windows.iter().map(|w| w.to).max();
        if let Some(range) = probe.range {
            cov.covered = merge_ranges(t.windows.iter().copied().filter(|w| w.to > range.from && w.from < range.to).collect());
        }
        Ok(cov)
    }

    async fn commit(&self, req: &CommitRequest<'_>) -> Result<SinkReport, WarehouseError> {
        if let Some(err) = self.commit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let rejects = self.reject_keys.lock().unwrap().clone();
        let mut tables = self.tables.lock().unwrap();
        let current = tables.get(req.table).map(|t| t.schema.clone()).unwrap_or_default();
        let wanted = TableSchema { columns: req.columns.to_vec() };
        let added = plan_evolution(&current, &wanted)
            .map_err(|conflict| WarehouseError::SchemaConflict { table: req.table.to_string(), conflict })?;

        let mut report = SinkReport::default();
        let mut writes = Vec::new();
        for row in req.rows {
            if rejects.contains(&row.key) {
                report.rejected.push(RowError { key: row.key.clone(), message: "rejected by sink".into() });
                continue;
            }
            writes.push(row);
        }
        if req.all_or_nothing && !report.rejected.is_empty() {
            return Err(WarehouseError::Rejected { table: req.table.to_string(), rows: report.rejected });
        }

        let t = tables.entry(req.table.clone()).or_default();
        for col in added {
            for stored in t.rows.values_mut() { stored.values.insert(col.name.clone(), Value::Null); }
            t.schema.push(col);
        }
        for row in writes {
            let exists = t.rows.contains_key(&row.key);
            if exists && req.mode == CommitMode::Append {
                report.existing += 1;
                continue;
            }
            let values = t
                .schema
                .columns
                .iter()
                .map(|c| (c.name.clone(), row.fields.get(&c.name).cloned().unwrap_or(Value::Null)))
                .collect();
            t.rows.insert(
                row.key.clone(),
                StoredRow {
                    dataset: req.dataset.to_string(),
                    window: req.window,
                    batch_id: req.batch_id.to_string(),
                    record_time: row.record_time,
                    values,
                },
            );
            if exists { report.existing += 1 } else { report.inserted += 1 }
        }
        t.windows.push(req.window);
        self.commits.lock().unwrap().push(CommitLog { table: req.table.to_string(), method: req.method, rows: req.rows.len() });
        Ok(report)
    }
}
