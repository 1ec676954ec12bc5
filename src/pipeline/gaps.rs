use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};

use crate::config::spec::CoverageMode;
use crate::config::{DatasetSpec, WarehouseConfig};
use crate::ingestion::types::FetchWindow;
use crate::warehouse::{merge_ranges, CoverageProbe, TableRef, Warehouse, WarehouseCoverage, WarehouseError};

/// Sub-ranges of `requested` not covered by `covered`, in order.
pub fn uncovered(requested: FetchWindow, covered: &[FetchWindow]) -> Vec<FetchWindow> {
    let mut gaps = Vec::new();
    let mut cursor = requested.from;
    for c in merge_ranges(covered.to_vec()) {
        if c.to <= cursor { continue; }
        if c.from >= requested.to { break; }
        if c.from > cursor { gaps.push(FetchWindow::new(cursor, c.from)); }
        cursor = cursor.max(c.to);
        if cursor >= requested.to { break; }
    }
    if cursor < requested.to { gaps.push(FetchWindow::new(cursor, requested.to)); }
    gaps
}

/// Split a gap into windows of at most `span`, starting at the gap start.
pub fn chunk(gap: FetchWindow, span: Duration) -> Vec<FetchWindow> {
    if span <= Duration::zero() { return vec![gap]; }
    let mut out = Vec::new();
    let mut from = gap.from;
    while from < gap.to {
        let to = (from + span).min(gap.to);
        out.push(FetchWindow::new(from, to));
        from = to;
    }
    out
}

fn floor_to(t: DateTime<Utc>, unit: Duration) -> DateTime<Utc> {
    t.duration_trunc(unit).unwrap_or(t)
}

fn ceil_to(t: DateTime<Utc>, unit: Duration) -> DateTime<Utc> {
    let floor = floor_to(t, unit);
    if floor == t { t } else { floor + unit }
}

/// Widen every gap to whole `unit`s inside `bounds`, then re-merge. Bounds
/// must already be aligned, so the result is aligned too.
fn align_gaps(gaps: Vec<FetchWindow>, bounds: FetchWindow, unit: Duration) -> Vec<FetchWindow> {
    let widened = gaps
        .into_iter()
        .map(|g| FetchWindow::new(floor_to(g.from, unit).max(bounds.from), ceil_to(g.to, unit).min(bounds.to)))
        .collect();
    merge_ranges(widened)
}

/// Covered ranges implied by the observed coverage for this dataset's mode.
fn covered_ranges(spec: &DatasetSpec, requested: FetchWindow, cov: &WarehouseCoverage) -> Vec<FetchWindow> {
    match spec.coverage {
        CoverageMode::Ranges => cov.covered.clone(),
        // everything before the latest loaded window end counts as covered
        CoverageMode::Latest => match cov.latest_window_end {
            Some(t) if t > requested.from => vec![FetchWindow::new(requested.from, t)],
            _ => Vec::new(),
        },
    }
}

/// Ordered, disjoint, chunked windows still missing from `requested`.
/// The request is clamped to `now`; an empty or inverted request has no gaps.
///
/// Day-addressed endpoints only see whole UTC days: the request snaps to
/// day edges (today waits until it is over), gaps widen to day edges and
/// chunks are whole days, so no two windows ever ask for the same date.
pub fn plan_gaps(spec: &DatasetSpec, requested: FetchWindow, cov: &WarehouseCoverage, now: DateTime<Utc>) -> Vec<FetchWindow> {
    let bounds = plannable(spec, requested, now);
    if bounds.is_empty() { return Vec::new(); }
    let mut gaps = uncovered(bounds, &covered_ranges(spec, bounds, cov));
    let mut span = spec.chunk();
    if let Some(unit) = spec.date_params.granularity() {
        gaps = align_gaps(gaps, bounds, unit);
        span = ceil_span(span, unit);
    }
    gaps.into_iter().flat_map(|gap| chunk(gap, span)).collect()
}

/// `requested` clamped to `now`, snapped to the endpoint's granularity.
pub fn plannable(spec: &DatasetSpec, requested: FetchWindow, now: DateTime<Utc>) -> FetchWindow {
    let clamped = FetchWindow::new(requested.from, requested.to.min(now));
    match spec.date_params.granularity() {
        Some(unit) => FetchWindow::new(floor_to(clamped.from, unit), floor_to(clamped.to, unit)),
        None => clamped,
    }
}

/// Round `span` up to a positive multiple of `unit`.
fn ceil_span(span: Duration, unit: Duration) -> Duration {
    let units = (span.num_seconds().max(1) as u64).div_ceil(unit.num_seconds().max(1) as u64);
    unit * units as i32
}

pub struct GapDetector {
    warehouse: Arc<dyn Warehouse>,
    cfg: WarehouseConfig,
}

impl GapDetector {
    pub fn new(warehouse: Arc<dyn Warehouse>, cfg: WarehouseConfig) -> Self { Self { warehouse, cfg } }

    pub fn table_for(&self, spec: &DatasetSpec) -> TableRef { TableRef::for_spec(&self.cfg, spec) }

    /// Query coverage fresh and return the missing windows.
    pub async fn find_gaps(&self, spec: &DatasetSpec, requested: FetchWindow, now: DateTime<Utc>) -> Result<Vec<FetchWindow>, WarehouseError> {
        let probe = CoverageProbe { range: Some(plannable(spec, requested, now)), recent_since: spec.recent_since(now) };
        let cov = self.warehouse.coverage(&self.table_for(spec), &probe).await?;
        Ok(plan_gaps(spec, requested, &cov, now))
    }
}
