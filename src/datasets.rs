use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::config::spec::{CommitMode, CoverageMode};
use crate::config::{DatasetSpec, PipelineConfig, WarehouseConfig};
use crate::telemetry::{self};
use crate::telemetry::ops::datasets::Phase as DatasetsPhase;
use crate::util::time::format_span;
use crate::warehouse::TableRef;

/// `ingest datasets`
#[derive(Args)]
pub struct DatasetsCmd {
    /// Only these codes; repeatable.
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DatasetRow {
    pub code: String,
    pub table: String,
    pub endpoint: String,
    pub chunk_span: String,
    pub commit_mode: CommitMode,
    pub coverage: CoverageMode,
    pub natural_key: Vec<String>,
}

impl DatasetRow {
    pub fn new(cfg: &WarehouseConfig, spec: &DatasetSpec) -> Self {
        DatasetRow {
            code: spec.code.clone(),
            table: TableRef::for_spec(cfg, spec).to_string(),
            endpoint: spec.endpoint_path(),
            chunk_span: format_span(spec.chunk()),
            commit_mode: spec.commit_mode,
            coverage: spec.coverage,
            natural_key: spec.natural_key.clone(),
        }
    }
}

pub fn run(cfg: &PipelineConfig, args: DatasetsCmd) -> Result<()> {
    let log = telemetry::datasets();
    let _s = log.span(&DatasetsPhase::List).entered();
    let rows: Vec<DatasetRow> = cfg.select(&args.datasets)?.iter().map(|s| DatasetRow::new(&cfg.warehouse, s)).collect();

    if telemetry::config::json_mode() {
        log.result(&rows)?;
        return Ok(());
    }
    for r in &rows {
        let key = if r.natural_key.is_empty() { "<content hash>".to_string() } else { r.natural_key.join(",") };
        println!(
            "[{}] {} chunk={} commit={:?} coverage={:?} key={} endpoint={}",
            r.code, r.table, r.chunk_span, r.commit_mode, r.coverage, key, r.endpoint
        );
    }
    Ok(())
}
