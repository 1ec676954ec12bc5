use anyhow::Result;
use serde::Serialize;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{info, warn, Span};

use super::emit;
use crate::output::types::Meta;
use crate::error::FailureReason;
use crate::freshness::FreshnessReport;
use crate::ingestion::types::FetchWindow;
use crate::pipeline::backfill::RunSummary;

pub trait PhaseSpan {
    fn name(&self) -> &'static str;
    fn span(&self) -> Span;
}

pub trait OpMarker {
    const NAME: &'static str;
    type Phase: PhaseSpan;
    fn root_span() -> Span;
}

pub struct LogCtx<O: OpMarker> {
    pub(crate) json: bool,
    pub(crate) _marker: PhantomData<O>,
}

impl<O: OpMarker> LogCtx<O> {
    fn op_name(&self) -> &'static str { O::NAME }

    pub fn root_span(&self) -> Span { O::root_span() }

    pub fn root_span_kv<'a, T>(&self, fields: T) -> Span
    where
        T: IntoIterator<Item = (&'a str, String)>,
    {
        let span = self.root_span();
        let details = kv_to_string(fields);
        if details.is_empty() {
            info!(op = %self.op_name(), "start");
        } else {
            info!(op = %self.op_name(), details = %details, "start");
        }
        span
    }

    pub fn span(&self, ph: &O::Phase) -> Span { ph.span() }

    pub fn span_kv<'a, T>(&self, ph: &O::Phase, fields: T) -> Span
    where
        T: IntoIterator<Item = (&'a str, String)>,
    {
        let span = self.span(ph);
        let details = kv_to_string(fields);
        if details.is_empty() {
            info!(op = %self.op_name(), phase = ph.name(), "span_start");
        } else {
            info!(op = %self.op_name(), phase = ph.name(), details = %details, "span_start");
        }
        span
    }

    pub fn info(&self, msg: impl AsRef<str>) { if self.json { info!(op = %self.op_name(), "{}", msg.as_ref()); } else { info!("{}", msg.as_ref()); } }
    pub fn warn(&self, msg: impl AsRef<str>) { if self.json { warn!(op = %self.op_name(), "{}", msg.as_ref()); } else { warn!("{}", msg.as_ref()); } }

    pub fn info_kv<'a, D>(&self, msg: &str, kv: D)
    where
        D: IntoIterator<Item = (&'a str, String)>,
    {
        if self.json { let details = kv_to_string(kv); info!(op = %self.op_name(), details = %details, "{}", msg); }
        else { info!("{}", msg); }
    }

    pub fn warn_kv<'a, D>(&self, msg: &str, kv: D)
    where
        D: IntoIterator<Item = (&'a str, String)>,
    {
        if self.json { let details = kv_to_string(kv); warn!(op = %self.op_name(), details = %details, "{}", msg); }
        else { warn!("{}", msg); }
    }

    pub fn plan<T: Serialize>(&self, plan: &T) -> Result<()> { emit::print_plan(self.op_name(), plan, None) }
    pub fn result<T: Serialize>(&self, result: &T) -> Result<()> { emit::print_result(self.op_name(), result, None) }
    pub fn result_timed<T: Serialize>(&self, result: &T, started: Instant) -> Result<()> {
        let meta = Meta { duration_ms: Some(started.elapsed().as_millis()) };
        emit::print_result(self.op_name(), result, Some(meta))
    }
}

impl LogCtx<crate::telemetry::ops::backfill::Backfill> {
    pub fn window_done(&self, dataset: &str, window: &FetchWindow, fetched: usize, loaded: usize, duplicate: usize, errored: usize) {
        if self.json { info!(op = %self.op_name(), dataset, window = %window, fetched, loaded, duplicate, errored, "window_done"); }
        else { info!("✅ {} {} — fetched={} loaded={} duplicate={} errored={}", dataset, window, fetched, loaded, duplicate, errored); }
    }

    pub fn window_failed(&self, dataset: &str, window: &FetchWindow, reason: &FailureReason) {
        if self.json { warn!(op = %self.op_name(), dataset, window = %window, kind = %reason.kind, stage = reason.stage, message = %reason.message, "window_failed"); }
        else { warn!("❌ {} {} — {} during {}: {}", dataset, window, reason.kind, reason.stage, reason.message); }
    }

    pub fn totals(&self, s: &RunSummary) {
        if self.json {
            info!(op = %self.op_name(), windows_total = s.windows_total, succeeded = s.succeeded, failed = s.failed, abandoned = s.abandoned,
                  records_fetched = s.records_fetched, loaded = s.loaded, duplicate = s.duplicate, errored = s.errored, "backfill_totals");
        } else {
            info!("📊 Backfill totals — windows={} succeeded={} failed={} abandoned={} fetched={} loaded={} duplicate={} errored={}",
                  s.windows_total, s.succeeded, s.failed, s.abandoned, s.records_fetched, s.loaded, s.duplicate, s.errored);
        }
    }
}

impl LogCtx<crate::telemetry::ops::freshness::Freshness> {
    pub fn report(&self, r: &FreshnessReport) {
        let age = r.staleness_secs.map(|s| format!("{}s", s)).unwrap_or_else(|| "-".to_string());
        if self.json { info!(op = %self.op_name(), dataset = %r.dataset, status = %r.status, staleness = %age, rows = r.row_count, recent_rows = r.recent_rows, "freshness"); }
        else { info!("{} {} — status={} staleness={} rows={} recent_rows={}", r.status.icon(), r.dataset, r.status, age, r.row_count, r.recent_rows); }
    }
}

fn kv_to_string<'a, T>(kv: T) -> String
where
    T: IntoIterator<Item = (&'a str, String)>,
{
    let mut parts: Vec<String> = Vec::new();
    for (k, v) in kv { parts.push(format!("{}={}", k, v)); }
    parts.join(" ")
}
