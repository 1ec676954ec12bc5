pub mod config;
pub mod ctx;
pub mod emit;
pub mod ops;

use ctx::LogCtx;

pub fn backfill() -> LogCtx<ops::backfill::Backfill> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
pub fn freshness() -> LogCtx<ops::freshness::Freshness> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
pub fn datasets() -> LogCtx<ops::datasets::Datasets> { LogCtx { json: config::logs_are_json(), _marker: std::marker::PhantomData } }
