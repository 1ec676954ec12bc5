use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::spec::CommitMode;
use crate::config::{DatasetSpec, WarehouseConfig};
use crate::ingestion::types::IngestBatch;
use crate::util::retry::retry;
use crate::warehouse::schema::{infer, plan_evolution, Column, TableSchema};
use crate::warehouse::{CommitRequest, LoadMethod, RowError, SinkReport, StagedRow, TableRef, Warehouse, WarehouseError};

/// Outcome of one batch load; `attempted == loaded + duplicate + errored`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoadResult {
    pub attempted: usize,
    pub loaded: usize,
    /// Keys already in the table (replaced under merge, skipped under append).
    pub duplicate: usize,
    pub errored: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub row_errors: Vec<RowError>,
    pub method: Option<LoadMethod>,
}

impl LoadResult {
    fn from_report(attempted: usize, method: LoadMethod, report: SinkReport) -> Self {
        LoadResult {
            attempted,
            loaded: report.inserted,
            duplicate: report.existing,
            errored: report.rejected.len(),
            row_errors: report.rejected,
            method: Some(method),
        }
    }
}

/// Stages a batch, evolves the table, and commits it in one transaction.
pub struct BatchLoader {
    warehouse: Arc<dyn Warehouse>,
    cfg: WarehouseConfig,
}

impl BatchLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, cfg: WarehouseConfig) -> Self { Self { warehouse, cfg } }

    pub fn table_for(&self, spec: &DatasetSpec) -> TableRef { TableRef::for_spec(&self.cfg, spec) }

    /// Row-at-a-time only for small appends; merges and large batches go bulk.
    pub fn method_for(&self, spec: &DatasetSpec, rows: usize) -> LoadMethod {
        match spec.commit_mode {
            CommitMode::Append if rows <= self.cfg.bulk_threshold_rows => LoadMethod::Streaming,
            _ => LoadMethod::Bulk,
        }
    }

    pub async fn load(&self, spec: &DatasetSpec, batch: &IngestBatch) -> Result<LoadResult, WarehouseError> {
        if batch.is_empty() { return Ok(LoadResult::default()); }
        let table = self.table_for(spec);

        let rows: Vec<StagedRow> = batch
            .records
            .iter()
            .map(|k| StagedRow { key: k.key.0.clone(), record_time: k.record.record_time(spec), fields: k.record.fields.clone() })
            .collect();
        let batch_schema = infer(rows.iter().map(|r| &r.fields))
            .map_err(|conflict| WarehouseError::SchemaConflict { table: table.to_string(), conflict })?;
        let method = self.method_for(spec, rows.len());

        let label = format!("load {} {}", spec.code, batch.window);
        let report = retry(&spec.retry, &label, |_| self.commit_once(spec, batch, &table, &batch_schema, method, &rows))
            .await
            .map_err(|e| if e.exhausted { WarehouseError::Exhausted { attempts: e.attempts, last: Box::new(e.last) } } else { e.last })?;

        let result = LoadResult::from_report(rows.len(), method, report);
        debug!(dataset = %spec.code, table = %table, loaded = result.loaded, duplicate = result.duplicate, errored = result.errored, "batch committed");
        Ok(result)
    }

    async fn commit_once(
        &self,
        spec: &DatasetSpec,
        batch: &IngestBatch,
        table: &TableRef,
        batch_schema: &TableSchema,
        method: LoadMethod,
        rows: &[StagedRow],
    ) -> Result<SinkReport, WarehouseError> {
        // plan against the table as it is now; the sink re-checks under its lock
        let existing = self.warehouse.describe(table).await?.unwrap_or_default();
        let added = plan_evolution(&existing, batch_schema)
            .map_err(|conflict| WarehouseError::SchemaConflict { table: table.to_string(), conflict })?;
        if !added.is_empty() {
            let names: Vec<&str> = added.iter().map(|c| c.name.as_str()).collect();
            debug!(table = %table, columns = ?names, "adding nullable columns");
        }
        let columns: Vec<Column> = existing.columns.into_iter().chain(added).collect();

        let req = CommitRequest {
            table,
            dataset: &batch.dataset,
            batch_id: batch.id,
            window: batch.window,
            ingested_at: batch.ingested_at,
            mode: spec.commit_mode,
            method,
            all_or_nothing: spec.all_or_nothing,
            columns: &columns,
            rows,
        };
        let timeout = self.cfg.load_timeout();
        match tokio::time::timeout(timeout, self.warehouse.commit(&req)).await {
            Ok(res) => res,
            Err(_) => Err(WarehouseError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};
    use crate::ingestion::types::{FetchWindow, KeyedRecord, RawRecord};
    use crate::pipeline::dedup::dedupe;
    use crate::util::retry::fast_policy;
    use crate::warehouse::memory::MemoryWarehouse;
    use crate::warehouse::schema::FieldType;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn spec() -> DatasetSpec {
        let mut s = DatasetSpec::new("MID", "startTime");
        s.natural_key = vec!["startTime".into(), "dataProvider".into()];
        s.retry = fast_policy(3);
        s
    }

    fn window() -> FetchWindow {
        FetchWindow::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
    }

    fn batch(spec: &DatasetSpec, values: Vec<Value>) -> IngestBatch {
        let raw = values.into_iter().map(|v| RawRecord::new(&spec.code, v.as_object().cloned().unwrap())).collect();
        IngestBatch::new(&spec.code, window(), dedupe(spec, raw).records).unwrap()
    }

    fn loader(wh: &Arc<MemoryWarehouse>) -> BatchLoader {
        let cfg = WarehouseConfig { bulk_threshold_rows: 2, ..WarehouseConfig::default() };
        BatchLoader::new(wh.clone(), cfg)
    }

    #[tokio::test]
    async fn merge_reload_counts_duplicates() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        let b = batch(&s, vec![
            json!({"startTime": "2024-01-01T00:00:00Z", "dataProvider": "APX", "price": 50.5}),
            json!({"startTime": "2024-01-01T00:30:00Z", "dataProvider": "APX", "price": 51.0}),
        ]);
        let first = l.load(&s, &b).await.unwrap();
        assert_eq!((first.attempted, first.loaded, first.duplicate, first.errored), (2, 2, 0, 0));
        let second = l.load(&s, &b).await.unwrap();
        assert_eq!((second.attempted, second.loaded, second.duplicate, second.errored), (2, 0, 2, 0));
        assert_eq!(wh.row_count(&l.table_for(&s)), 2);
    }

    #[tokio::test]
    async fn new_field_becomes_nullable_column() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        let table = l.table_for(&s);
        l.load(&s, &batch(&s, vec![json!({"startTime": "2024-01-01T00:00:00Z", "dataProvider": "APX", "price": 50})])).await.unwrap();
        let res = l
            .load(&s, &batch(&s, vec![json!({"startTime": "2024-01-01T01:00:00Z", "dataProvider": "APX", "price": 52, "volume": 10.5})]))
            .await
            .unwrap();
        assert_eq!(res.loaded, 1);

        let schema = wh.schema(&table).unwrap();
        assert_eq!(schema.get("volume"), Some(FieldType::Float));
        let rows = wh.rows(&table);
        let old = rows.iter().find(|(_, r)| r.values.get("startTime") == Some(&json!("2024-01-01T00:00:00Z"))).unwrap();
        assert_eq!(old.1.values.get("volume"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn incompatible_type_is_a_schema_conflict() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        l.load(&s, &batch(&s, vec![json!({"startTime": "a", "dataProvider": "APX", "price": 50})])).await.unwrap();
        let err = l.load(&s, &batch(&s, vec![json!({"startTime": "b", "dataProvider": "APX", "price": "n/a"})])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
        assert_eq!(wh.row_count(&l.table_for(&s)), 1);
    }

    #[tokio::test]
    async fn rejected_rows_are_counted_not_fatal() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        let b = batch(&s, vec![json!({"startTime": "a", "dataProvider": "X"}), json!({"startTime": "b", "dataProvider": "X"})]);
        wh.reject_key(b.records[1].key.as_str());
        let res = l.load(&s, &b).await.unwrap();
        assert_eq!((res.attempted, res.loaded, res.errored), (2, 1, 1));
        assert_eq!(res.row_errors[0].key, b.records[1].key.0);
    }

    #[tokio::test]
    async fn all_or_nothing_rolls_back() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let mut s = spec();
        s.all_or_nothing = true;
        let b = batch(&s, vec![json!({"startTime": "a", "dataProvider": "X"}), json!({"startTime": "b", "dataProvider": "X"})]);
        wh.reject_key(b.records[0].key.as_str());
        let err = l.load(&s, &b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PartialLoadFailure);
        assert_eq!(wh.row_count(&l.table_for(&s)), 0);
    }

    #[tokio::test]
    async fn transient_commit_failures_are_retried() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        wh.fail_next_commit(WarehouseError::Timeout(Duration::from_secs(900)));
        wh.fail_next_commit(WarehouseError::Unavailable("connection reset".into()));
        let res = l.load(&s, &batch(&s, vec![json!({"startTime": "a", "dataProvider": "X"})])).await.unwrap();
        assert_eq!(res.loaded, 1);

        for _ in 0..3 { wh.fail_next_commit(WarehouseError::Unavailable("down".into())); }
        let err = l.load(&s, &batch(&s, vec![json!({"startTime": "b", "dataProvider": "X"})])).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn append_switches_to_bulk_above_threshold() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let mut s = spec();
        s.commit_mode = CommitMode::Append;
        l.load(&s, &batch(&s, vec![json!({"startTime": "a", "dataProvider": "X"})])).await.unwrap();
        l.load(&s, &batch(&s, (0..3).map(|i| json!({"startTime": format!("t{i}"), "dataProvider": "X"})).collect())).await.unwrap();
        let methods: Vec<LoadMethod> = wh.commits().iter().map(|c| c.method).collect();
        assert_eq!(methods, vec![LoadMethod::Streaming, LoadMethod::Bulk]);

        s.commit_mode = CommitMode::Merge;
        assert_eq!(l.method_for(&s, 1), LoadMethod::Bulk);
    }

    #[tokio::test]
    async fn empty_batch_is_not_committed() {
        let wh = Arc::new(MemoryWarehouse::new());
        let l = loader(&wh);
        let s = spec();
        let b = IngestBatch::new("MID", window(), Vec::<KeyedRecord>::new()).unwrap();
        assert_eq!(l.load(&s, &b).await.unwrap(), LoadResult::default());
        assert!(wh.commits().is_empty());
    }
}
