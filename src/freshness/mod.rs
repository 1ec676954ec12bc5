use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use tracing::Instrument;

use crate::config::{DatasetSpec, PipelineConfig, WarehouseConfig};
use crate::error::DatasetError;
use crate::telemetry::{self};
use crate::telemetry::ops::freshness::Phase as FreshnessPhase;
use crate::util::retry::retry;
use crate::warehouse::{CoverageProbe, TableRef, Warehouse, WarehouseCoverage, WarehouseError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreshnessStatus {
    Ok,
    Warning,
    Stale,
    Empty,
}

impl FreshnessStatus {
    pub fn icon(&self) -> &'static str {
        match self {
            FreshnessStatus::Ok => "🟢",
            FreshnessStatus::Warning => "🟡",
            FreshnessStatus::Stale => "🔴",
            FreshnessStatus::Empty => "⚪",
        }
    }

    pub fn is_healthy(&self) -> bool { matches!(self, FreshnessStatus::Ok | FreshnessStatus::Warning) }
}

impl std::fmt::Display for FreshnessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FreshnessStatus::Ok => "OK",
            FreshnessStatus::Warning => "WARNING",
            FreshnessStatus::Stale => "STALE",
            FreshnessStatus::Empty => "EMPTY",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FreshnessReport {
    pub dataset: String,
    pub table: String,
    pub status: FreshnessStatus,
    pub latest: Option<DateTime<Utc>>,
    /// `now - latest`; negative when the table holds forward-dated records.
    pub staleness_secs: Option<i64>,
    pub row_count: i64,
    pub recent_rows: i64,
    pub distinct_days: i64,
}

/// Classify one dataset's coverage against its thresholds.
pub fn classify(spec: &DatasetSpec, table: &TableRef, cov: &WarehouseCoverage, now: DateTime<Utc>) -> FreshnessReport {
    // prefer the newest record; fall back to the newest loaded window
    let latest = cov.latest_record.or(cov.latest_window_end);
    let staleness = latest.map(|t| now - t);
    let (warn_after, stale_after) = spec.staleness_cutoffs();
    let status = match staleness {
        _ if cov.is_empty() => FreshnessStatus::Empty,
        None => FreshnessStatus::Empty,
        Some(age) if age >= stale_after => FreshnessStatus::Stale,
        Some(age) if age >= warn_after => FreshnessStatus::Warning,
        Some(_) => FreshnessStatus::Ok,
    };
    FreshnessReport {
        dataset: spec.code.clone(),
        table: table.to_string(),
        status,
        latest,
        staleness_secs: staleness.map(|d| d.num_seconds()),
        row_count: cov.row_count,
        recent_rows: cov.recent_rows,
        distinct_days: cov.distinct_days,
    }
}

#[derive(Debug, Default, Serialize)]
pub struct FreshnessSummary {
    pub checked_at: Option<DateTime<Utc>>,
    pub reports: Vec<FreshnessReport>,
    pub errors: Vec<DatasetError>,
}

impl FreshnessSummary {
    pub fn unhealthy(&self) -> usize {
        self.reports.iter().filter(|r| !r.status.is_healthy()).count() + self.errors.len()
    }
}

/// Read-only health probe over the warehouse; never triggers ingestion.
pub struct FreshnessMonitor {
    warehouse: Arc<dyn Warehouse>,
    cfg: WarehouseConfig,
}

impl FreshnessMonitor {
    pub fn new(warehouse: Arc<dyn Warehouse>, cfg: WarehouseConfig) -> Self { Self { warehouse, cfg } }

    pub async fn check_one(&self, spec: &DatasetSpec, now: DateTime<Utc>) -> Result<FreshnessReport, WarehouseError> {
        let table = TableRef::for_spec(&self.cfg, spec);
        let probe = CoverageProbe { range: None, recent_since: spec.recent_since(now) };
        let label = format!("freshness {}", spec.code);
        let cov = retry(&spec.retry, &label, |_| self.warehouse.coverage(&table, &probe)).await.map_err(|e| {
            if e.exhausted { WarehouseError::Exhausted { attempts: e.attempts, last: Box::new(e.last) } } else { e.last }
        })?;
        Ok(classify(spec, &table, &cov, now))
    }

    pub async fn check(&self, specs: &[DatasetSpec], now: DateTime<Utc>) -> FreshnessSummary {
        let log = telemetry::freshness();
        let mut summary = FreshnessSummary { checked_at: Some(now), ..Default::default() };
        for spec in specs {
            let span = log.span_kv(&FreshnessPhase::Probe, [("dataset", spec.code.clone())]);
            match self.check_one(spec, now).instrument(span).await {
                Ok(report) => {
                    log.report(&report);
                    summary.reports.push(report);
                }
                Err(e) => {
                    log.warn_kv(&format!("⚠️ {} — freshness probe failed: {}", spec.code, e), [
                        ("dataset", spec.code.clone()),
                        ("error", e.to_string()),
                    ]);
                    summary.errors.push(DatasetError::new(&spec.code, &e));
                }
            }
        }
        summary
    }
}

#[derive(Args)]
pub struct FreshnessCmd {
    #[arg(long = "dataset")] datasets: Vec<String>,
    /// Exit non-zero when any dataset is STALE, EMPTY, or unreadable.
    #[arg(long, default_value_t = false)] strict: bool,
}

pub async fn run(cfg: &PipelineConfig, warehouse: Arc<dyn Warehouse>, args: FreshnessCmd) -> Result<()> {
    let log = telemetry::freshness();
    let _g = log.root_span_kv([
        ("datasets", format!("{:?}", args.datasets)),
        ("strict", args.strict.to_string()),
    ]).entered();

    let started = Instant::now();
    let specs = cfg.select(&args.datasets)?;
    let monitor = FreshnessMonitor::new(warehouse, cfg.warehouse.clone());
    let summary = monitor.check(&specs, Utc::now()).await;
    if telemetry::config::json_mode() { log.result_timed(&summary, started)?; }

    let unhealthy = summary.unhealthy();
    if args.strict && unhealthy > 0 {
        bail!("{} of {} dataset(s) unhealthy", unhealthy, specs.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::Span;
    use crate::ingestion::types::FetchWindow;
    use crate::util::retry::fast_policy;
    use crate::warehouse::memory::MemoryWarehouse;
    use crate::error::ErrorKind;
    use chrono::{Duration, TimeZone};
    use serde_json::Map;

    fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap() }

    fn fuelinst() -> DatasetSpec {
        let mut s = DatasetSpec::new("FUELINST", "startTime");
        s.freshness.warn_after = Span::hours(1);
        s.freshness.stale_after = Span::hours(6);
        s.retry = fast_policy(1);
        s
    }

    fn cov_at(latest: DateTime<Utc>) -> WarehouseCoverage {
        WarehouseCoverage { latest_record: Some(latest), row_count: 10, recent_rows: 4, distinct_days: 2, ..Default::default() }
    }

    fn table() -> TableRef { TableRef::for_spec(&WarehouseConfig::default(), &fuelinst()) }

    #[test]
    fn thresholds_partition_staleness() {
        let spec = fuelinst();
        let at = |mins: i64| classify(&spec, &table(), &cov_at(now() - Duration::minutes(mins)), now()).status;
        assert_eq!(at(10), FreshnessStatus::Ok);
        assert_eq!(at(60), FreshnessStatus::Warning);
        assert_eq!(at(5 * 60), FreshnessStatus::Warning);
        assert_eq!(at(6 * 60), FreshnessStatus::Stale);
        assert_eq!(at(-30), FreshnessStatus::Ok);
    }

    #[test]
    fn empty_table_is_empty_not_stale() {
        let r = classify(&fuelinst(), &table(), &WarehouseCoverage::default(), now());
        assert_eq!(r.status, FreshnessStatus::Empty);
        assert_eq!(r.staleness_secs, None);
        assert_eq!(r.row_count, 0);
    }

    #[test]
    fn window_end_stands_in_for_missing_record_time() {
        let cov = WarehouseCoverage { latest_window_end: Some(now() - Duration::minutes(30)), row_count: 3, ..Default::default() };
        let r = classify(&fuelinst(), &table(), &cov, now());
        assert_eq!(r.status, FreshnessStatus::Ok);
        assert_eq!(r.staleness_secs, Some(30 * 60));
    }

    #[tokio::test]
    async fn monitor_reads_without_writing() {
        let wh = Arc::new(MemoryWarehouse::new());
        let spec = fuelinst();
        let t = table();
        let latest = now() - Duration::hours(2);
        wh.seed(&t, FetchWindow::new(latest - Duration::hours(1), latest), vec![
            ("a".into(), Some(latest - Duration::minutes(30)), Map::new()),
            ("b".into(), Some(latest), Map::new()),
        ]);
        let monitor = FreshnessMonitor::new(wh.clone(), WarehouseConfig::default());
        let summary = monitor.check(&[spec], now()).await;
        assert_eq!(summary.reports.len(), 1);
        let r = &summary.reports[0];
        assert_eq!(r.status, FreshnessStatus::Warning);
        assert_eq!(r.latest, Some(latest));
        assert_eq!(r.row_count, 2);
        assert_eq!(summary.unhealthy(), 0);
        assert!(wh.commits().is_empty());
        assert_eq!(wh.row_count(&t), 2);
    }

    #[tokio::test]
    async fn probe_failure_is_reported_not_fatal() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.fail_next_coverage(WarehouseError::Unavailable("down".into()));
        let mut other = fuelinst();
        other.code = "FREQ".into();
        let monitor = FreshnessMonitor::new(wh, WarehouseConfig::default());
        let summary = monitor.check(&[fuelinst(), other], now()).await;
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].kind, ErrorKind::Transient);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].status, FreshnessStatus::Empty);
        assert_eq!(summary.unhealthy(), 2);
    }
}
