use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::dedup::dedupe;
use super::gaps::GapDetector;
use super::load::{BatchLoader, LoadResult};
use crate::config::{DatasetSpec, PipelineConfig, MAX_WORKERS};
use crate::error::{Classify, DatasetError, ErrorKind, FailureReason};
use crate::ingestion::fetch::ApiClient;
use crate::ingestion::types::{FetchWindow, IngestBatch};
use crate::telemetry;
use crate::telemetry::ops::backfill::Phase as BackfillPhase;
use crate::util::retry::retry;
use crate::warehouse::{TableRef, Warehouse, WarehouseError};

/// Lifecycle of one window. FAILED is reachable from every non-terminal
/// state; ABANDONED only from PENDING, when the run is cancelled first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    Pending,
    Fetching,
    Deduping,
    Loading,
    Done,
    Failed,
    Abandoned,
}

impl WindowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WindowState::Done | WindowState::Failed | WindowState::Abandoned)
    }

    pub fn can_move_to(self, next: WindowState) -> bool {
        use WindowState::*;
        match (self, next) {
            (Pending, Fetching) | (Fetching, Deduping) | (Deduping, Loading) | (Loading, Done) => true,
            (Pending, Abandoned) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkItem {
    pub spec: Arc<DatasetSpec>,
    pub window: FetchWindow,
}

/// Windows to process, built once per run from fresh coverage.
#[derive(Debug, Default)]
pub struct WindowQueue {
    pub items: Vec<WorkItem>,
    /// Datasets whose coverage could not be read; they contribute no windows.
    pub dataset_errors: Vec<DatasetError>,
}

/// Progress of one window through fetch, dedup and load.
#[derive(Clone, Debug)]
pub struct WindowRun {
    pub dataset: String,
    pub window: FetchWindow,
    pub state: WindowState,
    pub fetched: usize,
    pub intra_duplicates: usize,
    pub load: LoadResult,
    pub failure: Option<FailureReason>,
}

impl WindowRun {
    fn new(dataset: &str, window: FetchWindow) -> Self {
        WindowRun {
            dataset: dataset.to_string(),
            window,
            state: WindowState::Pending,
            fetched: 0,
            intra_duplicates: 0,
            load: LoadResult::default(),
            failure: None,
        }
    }

    fn advance(&mut self, next: WindowState) {
        debug_assert!(self.state.can_move_to(next), "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail<E: Classify + std::fmt::Display>(mut self, stage: &'static str, err: &E) -> Self {
        self.advance(WindowState::Failed);
        self.failure = Some(FailureReason::new(stage, err));
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WindowFailure {
    pub dataset: String,
    pub window: FetchWindow,
    pub kind: ErrorKind,
    pub stage: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DatasetTotals {
    pub dataset: String,
    pub windows: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub loaded: usize,
    pub duplicate: usize,
    pub errored: usize,
}

/// Outcome of a run; lists every failed window so it can be re-run narrowly.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub windows_total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub records_fetched: usize,
    pub loaded: usize,
    /// Intra-batch duplicates plus keys already stored.
    pub duplicate: usize,
    pub errored: usize,
    pub failures: Vec<WindowFailure>,
    pub dataset_errors: Vec<DatasetError>,
    pub per_dataset: Vec<DatasetTotals>,
}

impl RunSummary {
    pub fn from_runs(runs: &[WindowRun], dataset_errors: Vec<DatasetError>) -> Self {
        let mut s = RunSummary { windows_total: runs.len(), dataset_errors, ..Default::default() };
        let mut per: BTreeMap<&str, DatasetTotals> = BTreeMap::new();
        for r in runs {
            let t = per.entry(r.dataset.as_str()).or_insert_with(|| DatasetTotals { dataset: r.dataset.clone(), ..Default::default() });
            t.windows += 1;
            s.records_fetched += r.fetched;
            let duplicate = r.intra_duplicates + r.load.duplicate;
            s.loaded += r.load.loaded;
            s.duplicate += duplicate;
            s.errored += r.load.errored;
            t.loaded += r.load.loaded;
            t.duplicate += duplicate;
            t.errored += r.load.errored;
            match r.state {
                WindowState::Done => { s.succeeded += 1; t.succeeded += 1; }
                WindowState::Abandoned => s.abandoned += 1,
                _ => {
                    s.failed += 1;
                    t.failed += 1;
                    if let Some(f) = &r.failure {
                        s.failures.push(WindowFailure {
                            dataset: r.dataset.clone(),
                            window: r.window,
                            kind: f.kind,
                            stage: f.stage,
                            message: f.message.clone(),
                        });
                    }
                }
            }
        }
        s.failures.sort_by(|a, b| (a.dataset.as_str(), a.window).cmp(&(b.dataset.as_str(), b.window)));
        s.per_dataset = per.into_values().collect();
        s
    }
}

/// Drives gap detection, then fetch, dedup and load per window on a
/// bounded pool. One window's failure never touches its siblings.
pub struct BackfillOrchestrator {
    client: Arc<ApiClient>,
    gaps: GapDetector,
    loader: BatchLoader,
    workers: usize,
}

impl BackfillOrchestrator {
    pub fn new(client: Arc<ApiClient>, warehouse: Arc<dyn Warehouse>, cfg: &PipelineConfig) -> Self {
        Self {
            client,
            gaps: GapDetector::new(warehouse.clone(), cfg.warehouse.clone()),
            loader: BatchLoader::new(warehouse, cfg.warehouse.clone()),
            workers: cfg.workers.clamp(1, MAX_WORKERS),
        }
    }

    /// Override the pool size; held to the same bounds as the config value.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn workers(&self) -> usize { self.workers }

    pub fn table_for(&self, spec: &DatasetSpec) -> TableRef { self.gaps.table_for(spec) }

    /// Query coverage per dataset and queue every missing window.
    pub async fn build_queue(&self, specs: &[DatasetSpec], requested: FetchWindow, now: DateTime<Utc>) -> WindowQueue {
        let log = telemetry::backfill();
        let mut queue = WindowQueue::default();
        for spec in specs {
            let spec = Arc::new(spec.clone());
            let label = format!("coverage {}", spec.code);
            let span = log.span_kv(&BackfillPhase::Gaps, [("dataset", spec.code.clone()), ("requested", requested.to_string())]);
            let found = retry(&spec.retry, &label, |_| self.gaps.find_gaps(&spec, requested, now)).instrument(span).await;
            match found {
                Ok(windows) => {
                    log.info_kv(&format!("🔎 {} — {} missing windows", spec.code, windows.len()), [
                        ("dataset", spec.code.clone()),
                        ("windows", windows.len().to_string()),
                    ]);
                    queue.items.extend(windows.into_iter().map(|window| WorkItem { spec: spec.clone(), window }));
                }
                Err(e) => {
                    let err = if e.exhausted { WarehouseError::Exhausted { attempts: e.attempts, last: Box::new(e.last) } } else { e.last };
                    log.warn_kv(&format!("⚠️ {} — gap detection failed: {}", spec.code, err), [
                        ("dataset", spec.code.clone()),
                        ("error", err.to_string()),
                    ]);
                    queue.dataset_errors.push(DatasetError::new(&spec.code, &err));
                }
            }
        }
        queue
    }

    /// Process the queue. Once `cancel` fires, windows not yet started are
    /// abandoned; in-flight windows run to completion.
    pub async fn execute(&self, queue: WindowQueue, cancel: &CancellationToken) -> RunSummary {
        let log = telemetry::backfill();
        let runs: Vec<WindowRun> = stream::iter(queue.items.iter())
            .map(|item| {
                let cancel = cancel.clone();
                let span = log.span_kv(&BackfillPhase::Window, [("dataset", item.spec.code.clone()), ("window", item.window.to_string())]);
                async move {
                    if cancel.is_cancelled() {
                        let mut run = WindowRun::new(&item.spec.code, item.window);
                        run.advance(WindowState::Abandoned);
                        return run;
                    }
                    self.process(item).instrument(span).await
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        let summary = RunSummary::from_runs(&runs, queue.dataset_errors);
        log.totals(&summary);
        summary
    }

    async fn process(&self, item: &WorkItem) -> WindowRun {
        let log = telemetry::backfill();
        let spec = item.spec.as_ref();
        let mut run = WindowRun::new(&spec.code, item.window);

        run.advance(WindowState::Fetching);
        let records = match self.client.fetch(spec, &item.window).instrument(log.span(&BackfillPhase::Fetch)).await {
            Ok(records) => records,
            Err(e) => return self.failed(run.fail("fetch", &e)),
        };
        run.fetched = records.len();

        run.advance(WindowState::Deduping);
        let outcome = {
            let _s = log.span(&BackfillPhase::Dedup).entered();
            dedupe(spec, records)
        };
        run.intra_duplicates = outcome.duplicates;
        let batch = match IngestBatch::new(&spec.code, item.window, outcome.records) {
            Ok(batch) => batch,
            Err(e) => return self.failed(run.fail("dedup", &e)),
        };

        run.advance(WindowState::Loading);
        match self.loader.load(spec, &batch).instrument(log.span(&BackfillPhase::Load)).await {
            Ok(result) => run.load = result,
            Err(e) => return self.failed(run.fail("load", &e)),
        }
        run.advance(WindowState::Done);
        log.window_done(&run.dataset, &run.window, run.fetched, run.load.loaded, run.intra_duplicates + run.load.duplicate, run.load.errored);
        run
    }

    fn failed(&self, run: WindowRun) -> WindowRun {
        if let Some(reason) = &run.failure {
            telemetry::backfill().window_failed(&run.dataset, &run.window, reason);
        }
        run
    }
}
