pub mod backfill;
pub mod dedup;
pub mod gaps;
pub mod load;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::error::DatasetError;
use crate::ingestion::fetch::ApiClient;
use crate::ingestion::types::FetchWindow;
use crate::telemetry::{self};
use crate::telemetry::ops::backfill::Phase as BackfillPhase;
use crate::util::time::{parse_span, parse_window_str};
use crate::warehouse::Warehouse;

use self::backfill::{BackfillOrchestrator, WindowQueue};

#[derive(Args)]
pub struct BackfillCmd {
    /// Dataset code; repeat for several. Defaults to every configured dataset.
    #[arg(long = "dataset")] datasets: Vec<String>,
    /// Range start: YYYY-MM-DD, RFC3339, or a span back from now (e.g. 3d).
    #[arg(long, conflicts_with = "since")] from: Option<String>,
    /// Range end; defaults to now.
    #[arg(long)] to: Option<String>,
    /// Shorthand for --from <span>.
    #[arg(long)] since: Option<String>,
    #[arg(long)] workers: Option<usize>,
    #[arg(long, default_value_t = false)] apply: bool,
    #[arg(long, default_value_t = 10)] plan_limit: usize,
}

const DEFAULT_LOOKBACK_DAYS: i64 = 7;

impl BackfillCmd {
    fn requested(&self, now: DateTime<Utc>) -> Result<FetchWindow> {
        let from = match (&self.from, &self.since) {
            (Some(f), _) => parse_window_str(f, now).ok_or_else(|| anyhow!("invalid --from: {f}"))?,
            (None, Some(s)) => {
                let span = parse_span(s).ok_or_else(|| anyhow!("invalid --since: {s} (expected e.g. 6h, 3d, 2w)"))?;
                now - span
            }
            (None, None) => now - Duration::days(DEFAULT_LOOKBACK_DAYS),
        };
        let to = match &self.to {
            Some(t) => parse_window_str(t, now).ok_or_else(|| anyhow!("invalid --to: {t}"))?,
            None => now,
        };
        if from >= to { bail!("empty range: --from {} is not before --to {}", from, to); }
        Ok(FetchWindow::new(from, to))
    }
}

#[derive(Serialize)]
struct DatasetPlan {
    dataset: String,
    table: String,
    windows: usize,
    sample: Vec<FetchWindow>,
}

#[derive(Serialize)]
struct BackfillPlan<'a> {
    requested: FetchWindow,
    workers: usize,
    windows_total: usize,
    datasets: Vec<DatasetPlan>,
    dataset_errors: &'a [DatasetError],
}

fn summarize_queue<'a>(orch: &BackfillOrchestrator, requested: FetchWindow, queue: &'a WindowQueue, limit: usize) -> BackfillPlan<'a> {
    let mut per: BTreeMap<&str, DatasetPlan> = BTreeMap::new();
    for item in &queue.items {
        let entry = per.entry(item.spec.code.as_str()).or_insert_with(|| DatasetPlan {
            dataset: item.spec.code.clone(),
            table: orch.table_for(&item.spec).to_string(),
            windows: 0,
            sample: Vec::new(),
        });
        entry.windows += 1;
        if entry.sample.len() < limit { entry.sample.push(item.window); }
    }
    BackfillPlan {
        requested,
        workers: orch.workers(),
        windows_total: queue.items.len(),
        datasets: per.into_values().collect(),
        dataset_errors: &queue.dataset_errors,
    }
}

pub async fn run(cfg: &PipelineConfig, warehouse: Arc<dyn Warehouse>, client: Arc<ApiClient>, args: BackfillCmd, cancel: CancellationToken) -> Result<()> {
    let log = telemetry::backfill();
    let _g = log.root_span_kv([
        ("datasets", format!("{:?}", args.datasets)),
        ("from", format!("{:?}", args.from)),
        ("to", format!("{:?}", args.to)),
        ("since", format!("{:?}", args.since)),
        ("workers", format!("{:?}", args.workers)),
        ("apply", args.apply.to_string()),
    ]).entered();

    let started = Instant::now();
    let now = Utc::now();
    let requested = args.requested(now)?;
    let specs = cfg.select(&args.datasets)?;
    let mut orch = BackfillOrchestrator::new(client, warehouse, cfg);
    if let Some(n) = args.workers { orch = orch.with_workers(n); }

    let queue = orch.build_queue(&specs, requested, now).instrument(log.span(&BackfillPhase::Plan)).await;
    let plan = summarize_queue(&orch, requested, &queue, args.plan_limit);

    if !args.apply {
        log.info(format!(
            "📝 Backfill plan — range={} datasets={} windows={} workers={}",
            requested, specs.len(), plan.windows_total, plan.workers
        ));
        for d in &plan.datasets {
            log.info(format!("  {} → {} ({} windows)", d.dataset, d.table, d.windows));
            for w in &d.sample { log.info(format!("    {}", w)); }
            if d.windows > d.sample.len() { log.info(format!("    ... ({} more)", d.windows - d.sample.len())); }
        }
        for e in plan.dataset_errors.iter() { log.warn(format!("  {} — coverage unavailable ({}): {}", e.dataset, e.kind, e.message)); }
        log.info("   Use --apply to execute.");
        if telemetry::config::json_mode() { log.plan(&plan)?; }
        return Ok(());
    }

    if queue.items.is_empty() && queue.dataset_errors.is_empty() {
        log.info(format!("ℹ️  Nothing to backfill in {}", requested));
    }
    let summary = orch.execute(queue, &cancel).await;
    if telemetry::config::json_mode() { log.result_timed(&summary, started)?; }

    if summary.failed > 0 || !summary.dataset_errors.is_empty() {
        for f in &summary.failures {
            log.warn(format!("  retry with: --dataset {} --from {} --to {}", f.dataset, f.window.from.to_rfc3339(), f.window.to.to_rfc3339()));
        }
        bail!("{} window(s) failed, {} dataset(s) without coverage", summary.failed, summary.dataset_errors.len());
    }
    if summary.abandoned > 0 {
        bail!("interrupted: {} window(s) abandoned", summary.abandoned);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, DatasetSpec};
    use crate::ingestion::fetch::mock::{reply, MockTransport};
    use crate::ingestion::fetch::Transport;
    use crate::util::retry::fast_policy;
    use crate::warehouse::memory::MemoryWarehouse;
    use crate::warehouse::WarehouseError;
    use chrono::TimeZone;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        cmd: BackfillCmd,
    }

    fn parse(args: &[&str]) -> BackfillCmd {
        let mut argv = vec!["ingest"];
        argv.extend_from_slice(args);
        Harness::parse_from(argv).cmd
    }

    fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap() }

    #[test]
    fn explicit_range() {
        let cmd = parse(&["--from", "2024-03-01", "--to", "2024-03-04", "--dataset", "MID", "--dataset", "BOD"]);
        let w = cmd.requested(now()).unwrap();
        assert_eq!(w, FetchWindow::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(), Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()));
        assert_eq!(cmd.datasets, vec!["MID".to_string(), "BOD".to_string()]);
        assert!(!cmd.apply);
    }

    #[test]
    fn since_is_relative_to_now() {
        let w = parse(&["--since", "3d"]).requested(now()).unwrap();
        assert_eq!(w.to, now());
        assert_eq!(w.span(), chrono::Duration::days(3));
        let default = parse(&[]).requested(now()).unwrap();
        assert_eq!(default.span(), chrono::Duration::days(7));
    }

    #[test]
    fn bad_ranges_are_rejected() {
        assert!(parse(&["--from", "2024-03-05", "--to", "2024-03-04"]).requested(now()).is_err());
        assert!(parse(&["--since", "soon"]).requested(now()).is_err());
        assert!(parse(&["--to", "yesterday"]).requested(now()).is_err());
    }

    fn planning_setup(wh: &Arc<MemoryWarehouse>, transport: &Arc<MockTransport>) -> (PipelineConfig, Arc<dyn Warehouse>, Arc<ApiClient>) {
        let mut spec = DatasetSpec::new("MID", "startTime");
        spec.retry = fast_policy(1);
        let cfg = PipelineConfig {
            api: ApiConfig { base_url: "http://bmrs.test".into(), min_interval_ms: 0, ..ApiConfig::default() },
            datasets: vec![spec],
            ..PipelineConfig::default()
        };
        let t: Arc<dyn Transport> = transport.clone();
        let client = Arc::new(ApiClient::new(t, &cfg.api, &cfg.datasets));
        let warehouse: Arc<dyn Warehouse> = wh.clone();
        (cfg, warehouse, client)
    }

    #[tokio::test]
    async fn plan_mode_reports_unreadable_coverage_without_touching_anything() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.fail_next_coverage(WarehouseError::Unavailable("down".into()));
        let transport = Arc::new(MockTransport::with_handler(|_, _| reply(200, r#"{"data": []}"#)));
        let (cfg, warehouse, client) = planning_setup(&wh, &transport);

        let args = parse(&["--dataset", "MID", "--from", "2024-03-01", "--to", "2024-03-03"]);
        run(&cfg, warehouse, client, args, CancellationToken::new()).await.unwrap();
        assert!(transport.calls().is_empty());
        assert!(wh.commits().is_empty());
    }

    #[tokio::test]
    async fn plan_mode_never_fetches() {
        let wh = Arc::new(MemoryWarehouse::new());
        let transport = Arc::new(MockTransport::with_handler(|_, _| reply(200, r#"{"data": []}"#)));
        let (cfg, warehouse, client) = planning_setup(&wh, &transport);

        let args = parse(&["--dataset", "MID", "--from", "2024-03-01", "--to", "2024-03-03", "--workers", "64"]);
        run(&cfg, warehouse, client, args, CancellationToken::new()).await.unwrap();
        assert!(transport.calls().is_empty());
        assert!(wh.commits().is_empty());
    }
}
