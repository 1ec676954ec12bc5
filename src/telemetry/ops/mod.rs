pub mod backfill;
pub mod datasets;
pub mod freshness;
