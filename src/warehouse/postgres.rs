use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::query_builder::Separated;
use sqlx::{Connection, Executor, QueryBuilder, Row, Transaction};
use tracing::{debug, warn};

use super::schema::{is_meta_column, plan_evolution, Column, FieldType, TableSchema, KEY_COLUMN, META_COLUMNS};
use super::{
    db_error_is_transient, merge_ranges, CommitRequest, CoverageProbe, LoadMethod, RowError, SinkReport, StagedRow, TableRef,
    Warehouse, WarehouseCoverage, WarehouseError,
};
use crate::config::spec::CommitMode;
use crate::ingestion::types::FetchWindow;
use crate::util::sql::quote_ident;

// Postgres caps bind parameters per statement at u16::MAX.
const MAX_BINDS: usize = 65_535;
const MAX_ROWS_PER_STATEMENT: usize = 1_000;
const LEDGER_TABLE: &str = "_ingest_windows";

/// Warehouse backed by one Postgres database: the warehouse dataset is a
/// schema, each dataset table a table in it.
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    /// Create the warehouse schema and its window ledger once, before workers start.
    pub async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset));
        sqlx::query(&sql).execute(&self.pool).await?;
        sqlx::query(&create_ledger_sql(dataset)).execute(&self.pool).await?;
        sqlx::query(&ledger_index_sql(dataset)).execute(&self.pool).await?;
        Ok(())
    }
}

fn qualified(t: &TableRef) -> String {
    format!("{}.{}", quote_ident(&t.dataset), quote_ident(&t.table))
}

pub(crate) fn create_table_sql(t: &TableRef) -> String {
    let cols: Vec<String> = META_COLUMNS
        .iter()
        .map(|(name, ty)| {
            let constraint = match *name {
                KEY_COLUMN => " PRIMARY KEY",
                "_record_time" => "",
                _ => " NOT NULL",
            };
            format!("{} {}{}", quote_ident(name), ty.sql_type(), constraint)
        })
        .collect();
    format!("CREATE TABLE IF NOT EXISTS {} ({})", qualified(t), cols.join(", "))
}

fn ledger(dataset: &str) -> String {
    format!("{}.{}", quote_ident(dataset), quote_ident(LEDGER_TABLE))
}

/// One row per committed window. Coverage is read from here, never from the
/// window columns on data rows, which a merge rewrites.
pub(crate) fn create_ledger_sql(dataset: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         table_name TEXT NOT NULL, \
         window_from TIMESTAMPTZ NOT NULL, \
         window_to TIMESTAMPTZ NOT NULL, \
         batch_id TEXT NOT NULL, \
         rows_sent INTEGER NOT NULL, \
         loaded_utc TIMESTAMPTZ NOT NULL, \
         PRIMARY KEY (table_name, batch_id))",
        ledger(dataset)
    )
}

pub(crate) fn ledger_index_sql(dataset: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} (table_name, window_from, window_to)",
        quote_ident(&format!("{LEDGER_TABLE}_range_idx")),
        ledger(dataset)
    )
}

pub(crate) fn record_window_sql(dataset: &str) -> String {
    format!(
        "INSERT INTO {} (table_name, window_from, window_to, batch_id, rows_sent, loaded_utc) \
         VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT DO NOTHING",
        ledger(dataset)
    )
}

pub(crate) fn add_column_sql(t: &TableRef, col: &Column) -> String {
    format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}", qualified(t), quote_ident(&col.name), col.ty.sql_type())
}

pub(crate) fn insert_head(t: &TableRef, columns: &[Column]) -> String {
    let names: Vec<String> = META_COLUMNS
        .iter()
        .map(|(n, _)| quote_ident(n))
        .chain(columns.iter().map(|c| quote_ident(&c.name)))
        .collect();
    format!("INSERT INTO {} ({}) ", qualified(t), names.join(", "))
}

/// Merge replaces every column of an existing key, so the stored row matches
/// the latest fetch exactly; append leaves stored keys alone.
pub(crate) fn conflict_clause(mode: CommitMode, columns: &[Column]) -> String {
    match mode {
        CommitMode::Append => format!(" ON CONFLICT ({}) DO NOTHING RETURNING TRUE AS inserted", quote_ident(KEY_COLUMN)),
        CommitMode::Merge => {
            let sets: Vec<String> = META_COLUMNS
                .iter()
                .map(|(n, _)| *n)
                .filter(|n| *n != KEY_COLUMN)
                .chain(columns.iter().map(|c| c.name.as_str()))
                .map(|n| format!("{0} = EXCLUDED.{0}", quote_ident(n)))
                .collect();
            format!(
                " ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
                quote_ident(KEY_COLUMN),
                sets.join(", ")
            )
        }
    }
}

pub(crate) fn rows_per_statement(method: LoadMethod, columns: usize) -> usize {
    match method {
        LoadMethod::Streaming => 1,
        LoadMethod::Bulk => (MAX_BINDS / (META_COLUMNS.len() + columns)).clamp(1, MAX_ROWS_PER_STATEMENT),
    }
}

fn bind_field<'args>(b: &mut Separated<'_, 'args, Postgres, &'static str>, ty: FieldType, v: Option<&Value>) {
    let v = v.filter(|v| !v.is_null());
    match ty {
        FieldType::Boolean => { b.push_bind(v.and_then(Value::as_bool)); }
        FieldType::Integer => { b.push_bind(v.and_then(Value::as_i64)); }
        FieldType::Float => { b.push_bind(v.and_then(Value::as_f64)); }
        FieldType::Text => { b.push_bind(v.and_then(Value::as_str).map(str::to_string)); }
        FieldType::Json => { b.push_bind(v.cloned()); }
        FieldType::Timestamp => {
            let ts = v.and_then(Value::as_str).and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|d| d.with_timezone(&Utc));
            b.push_bind(ts);
        }
    }
}

fn build_insert<'a>(req: &'a CommitRequest<'_>, rows: &'a [StagedRow]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(insert_head(req.table, req.columns));
    let batch_id = req.batch_id.to_string();
    qb.push_values(rows, |mut b, row| {
        b.push_bind(row.key.clone())
            .push_bind(req.dataset.to_string())
            .push_bind(req.window.from)
            .push_bind(req.window.to)
            .push_bind(req.ingested_at)
            .push_bind(batch_id.clone())
            .push_bind(row.record_time);
        for col in req.columns {
            bind_field(&mut b, col.ty, row.fields.get(&col.name));
        }
    });
    qb.push(conflict_clause(req.mode, req.columns));
    qb
}

async fn read_columns<'e, E>(exec: E, t: &TableRef) -> Result<Option<TableSchema>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows = sqlx::query(
        "SELECT column_name::text AS column_name, data_type::text AS data_type \
         FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 \
         ORDER BY ordinal_position",
    )
    .bind(&t.dataset)
    .bind(&t.table)
    .fetch_all(exec)
    .await?;
    if rows.is_empty() { return Ok(None); }
    let mut schema = TableSchema::default();
    for row in rows {
        let name: String = row.try_get("column_name")?;
        let data_type: String = row.try_get("data_type")?;
        if is_meta_column(&name) { continue; }
        match FieldType::from_sql(&data_type) {
            Some(ty) => schema.push(Column { name, ty }),
            None => warn!(table = %t, column = %name, data_type = %data_type, "ignoring column of unmanaged type"),
        }
    }
    Ok(Some(schema))
}

/// Write one statement's worth of rows under a savepoint. Returns (inserted, existing).
async fn write_rows(tx: &mut Transaction<'_, Postgres>, req: &CommitRequest<'_>, rows: &[StagedRow]) -> Result<(usize, usize), sqlx::Error> {
    let mut sp = tx.begin().await?;
    let mut qb = build_insert(req, rows);
    let outcome = qb.build().fetch_all(&mut *sp).await;
    match outcome {
        Ok(returned) => {
            sp.commit().await?;
            let mut inserted = 0;
            for r in &returned {
                if r.try_get::<bool, _>("inserted")? { inserted += 1; }
            }
            Ok((inserted, rows.len() - inserted))
        }
        Err(e) => {
            sp.rollback().await?;
            Err(e)
        }
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn describe(&self, table: &TableRef) -> Result<Option<TableSchema>, WarehouseError> {
        Ok(read_columns(&self.pool, table).await?)
    }

    async fn coverage(&self, table: &TableRef, probe: &CoverageProbe) -> Result<WarehouseCoverage, WarehouseError> {
        let exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(qualified(table))
            .fetch_one(&self.pool)
            .await?;
        if exists.is_none() {
            debug!(table = %table, "table missing, empty coverage");
            return Ok(WarehouseCoverage::default());
        }

        let agg = sqlx::query(&format!(
            "SELECT MAX(\"_record_time\") AS latest_record, \
                    COUNT(*) AS row_count, \
                    COUNT(DISTINCT (\"_record_time\" AT TIME ZONE 'UTC')::date) AS distinct_days, \
                    COUNT(*) FILTER (WHERE \"_record_time\" >= $1) AS recent_rows \
             FROM {}",
            qualified(table)
        ))
        .bind(probe.recent_since)
        .fetch_one(&self.pool)
        .await?;

        let mut cov = WarehouseCoverage {
            covered: Vec::new(),
            latest_window_end: None,
            latest_record: agg.try_get("latest_record")?,
            row_count: agg.try_get("row_count")?,
            distinct_days: agg.try_get("distinct_days")?,
            recent_rows: agg.try_get("recent_rows")?,
        };

        let ledger_exists: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind(ledger(&table.dataset))
            .fetch_one(&self.pool)
            .await?;
        if ledger_exists.is_none() {
            debug!(table = %table, "window ledger missing, no covered windows");
            return Ok(cov);
        }

        cov.latest_window_end = sqlx::query_scalar(&format!("SELECT MAX(window_to) FROM {} WHERE table_name = $1", ledger(&table.dataset)))
            .bind(&table.table)
            .fetch_one(&self.pool)
            .await?;

        if let Some(range) = probe.range {
            let pairs = sqlx::query(&format!(
                "SELECT DISTINCT window_from, window_to FROM {} \
                 WHERE table_name = $1 AND window_to > $2 AND window_from < $3",
                ledger(&table.dataset)
            ))
            .bind(&table.table)
            .bind(range.from)
            .bind(range.to)
            .fetch_all(&self.pool)
            .await?;
            let mut windows = Vec::with_capacity(pairs.len());
            for p in pairs {
                windows.push(FetchWindow::new(p.try_get("window_from")?, p.try_get("window_to")?));
            }
            cov.covered = merge_ranges(windows);
        }
        Ok(cov)
    }

    async fn commit(&self, req: &CommitRequest<'_>) -> Result<SinkReport, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(req.table.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(&create_table_sql(req.table)).execute(&mut *tx).await?;
        sqlx::query(&create_ledger_sql(&req.table.dataset)).execute(&mut *tx).await?;
        let current = read_columns(&mut *tx, req.table).await?.unwrap_or_default();
        let wanted = TableSchema { columns: req.columns.to_vec() };
        let added = plan_evolution(&current, &wanted)
            .map_err(|conflict| WarehouseError::SchemaConflict { table: req.table.to_string(), conflict })?;
        for col in &added {
            sqlx::query(&add_column_sql(req.table, col)).execute(&mut *tx).await?;
        }

        let mut report = SinkReport::default();
        for chunk in req.rows.chunks(rows_per_statement(req.method, req.columns.len())) {
            match write_rows(&mut tx, req, chunk).await {
                Ok((inserted, existing)) => {
                    report.inserted += inserted;
                    report.existing += existing;
                }
                Err(e) if db_error_is_transient(&e) => return Err(e.into()),
                Err(e) if chunk.len() == 1 => {
                    report.rejected.push(RowError { key: chunk[0].key.clone(), message: e.to_string() });
                }
                Err(e) => {
                    debug!(table = %req.table, rows = chunk.len(), error = %e, "chunk failed, isolating rows");
                    for row in chunk {
                        match write_rows(&mut tx, req, std::slice::from_ref(row)).await {
                            Ok((inserted, existing)) => {
                                report.inserted += inserted;
                                report.existing += existing;
                            }
                            Err(e) if db_error_is_transient(&e) => return Err(e.into()),
                            Err(e) => report.rejected.push(RowError { key: row.key.clone(), message: e.to_string() }),
                        }
                    }
                }
            }
        }

        if req.all_or_nothing && !report.rejected.is_empty() {
            tx.rollback().await?;
            return Err(WarehouseError::Rejected { table: req.table.to_string(), rows: report.rejected });
        }
        sqlx::query(&record_window_sql(&req.table.dataset))
            .bind(&req.table.table)
            .bind(req.window.from)
            .bind(req.window.to)
            .bind(req.batch_id.to_string())
            .bind(req.rows.len() as i32)
            .bind(req.ingested_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(report)
    }
}
