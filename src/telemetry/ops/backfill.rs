use tracing::Span;
use tracing::info_span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Backfill;

#[derive(Copy, Clone, Debug)]
pub enum Phase { Plan, Gaps, Window, Fetch, Dedup, Load }

impl PhaseSpan for Phase {
    fn name(&self) -> &'static str { match self {
        Phase::Plan => "plan",
        Phase::Gaps => "gaps",
        Phase::Window => "window",
        Phase::Fetch => "fetch",
        Phase::Dedup => "dedup",
        Phase::Load => "load",
    }}
    fn span(&self) -> Span { match self {
        Phase::Plan => info_span!("plan"),
        Phase::Gaps => info_span!("gaps"),
        Phase::Window => info_span!("window"),
        Phase::Fetch => info_span!("fetch"),
        Phase::Dedup => info_span!("dedup"),
        Phase::Load => info_span!("load"),
    }}
}

impl OpMarker for Backfill {
    const NAME: &'static str = "backfill";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("backfill") }
}
