use tracing::Span;
use tracing::info_span;

use crate::telemetry::ctx::{OpMarker, PhaseSpan};

#[derive(Copy, Clone, Debug)]
pub struct Freshness;

#[derive(Copy, Clone, Debug)]
pub enum Phase { Probe }

impl PhaseSpan for Phase {
    fn name(&self) -> &'static str { match self { Phase::Probe => "probe" } }
    fn span(&self) -> Span { match self { Phase::Probe => info_span!("probe") } }
}

impl OpMarker for Freshness {
    const NAME: &'static str = "freshness";
    type Phase = Phase;
    fn root_span() -> Span { info_span!("freshness") }
}
