use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;
use crate::util::sql::is_plain_ident;

pub mod catalog;
pub mod spec;

pub use spec::DatasetSpec;

const DEFAULT_BASE_URL: &str = "https://data.elexon.co.uk/bmrs/api/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 90;
const DEFAULT_MIN_INTERVAL_MS: u64 = 250;
const DEFAULT_PROJECT: &str = "uk_energy";
const DEFAULT_WAREHOUSE_DATASET: &str = "uk_energy_prod";
const DEFAULT_BULK_THRESHOLD_ROWS: usize = 500;
const DEFAULT_LOAD_TIMEOUT_SECS: u64 = 900;
const DEFAULT_WORKERS: usize = 3;
pub(crate) const MAX_WORKERS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// API-wide spacing between requests, across all workers.
    pub min_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            api_key: None,
            min_interval_ms: DEFAULT_MIN_INTERVAL_MS,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }
    pub fn min_interval(&self) -> Duration { Duration::from_millis(self.min_interval_ms) }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    pub project: String,
    pub dataset: String,
    /// Batches larger than this go through the bulk path.
    pub bulk_threshold_rows: usize,
    pub load_timeout_secs: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            dataset: DEFAULT_WAREHOUSE_DATASET.to_string(),
            bulk_threshold_rows: DEFAULT_BULK_THRESHOLD_ROWS,
            load_timeout_secs: DEFAULT_LOAD_TIMEOUT_SECS,
        }
    }
}

impl WarehouseConfig {
    pub fn load_timeout(&self) -> Duration { Duration::from_secs(self.load_timeout_secs) }
}

fn default_workers() -> usize { DEFAULT_WORKERS }

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            warehouse: WarehouseConfig::default(),
            workers: DEFAULT_WORKERS,
            datasets: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Read the JSON config (or start from defaults), apply env overrides,
    /// fall back to the built-in catalog, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let shown = p.display().to_string();
                let raw = std::fs::read_to_string(p).map_err(|source| ConfigError::Io { path: shown.clone(), source })?;
                serde_json::from_str::<PipelineConfig>(&raw).map_err(|source| ConfigError::Parse { path: shown, source })?
            }
            None => PipelineConfig::default(),
        };
        cfg.apply_env();
        if cfg.datasets.is_empty() { cfg.datasets = catalog::builtin(); }
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(base) = std::env::var("BMRS_BASE_URL") {
            self.api.base_url = base;
        }
        if let Ok(key) = std::env::var("BMRS_API_KEY") {
            if !key.trim().is_empty() { self.api.api_key = Some(key); }
        }
        if let Ok(timeout) = std::env::var("BMRS_TIMEOUT_SECS") {
            if let Ok(parsed) = timeout.parse::<u64>() { self.api.timeout_secs = parsed; }
        }
        if let Ok(workers) = std::env::var("INGEST_WORKERS") {
            if let Ok(parsed) = workers.parse::<usize>() { self.workers = parsed; }
        }
        if let Ok(ds) = std::env::var("INGEST_WAREHOUSE_DATASET") {
            self.warehouse.dataset = ds;
        }
        self.workers = self.workers.clamp(1, MAX_WORKERS);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Url::parse(&self.api.base_url).is_err() {
            return Err(ConfigError::invalid(None, format!("api base_url is not a URL: {}", self.api.base_url)));
        }
        if !is_plain_ident(&self.warehouse.dataset) {
            return Err(ConfigError::invalid(None, format!("warehouse dataset is not a plain identifier: {}", self.warehouse.dataset)));
        }
        if self.api.timeout_secs == 0 || self.warehouse.load_timeout_secs == 0 {
            return Err(ConfigError::invalid(None, "timeouts must be positive"));
        }
        let mut codes = HashSet::new();
        for spec in &self.datasets {
            if !codes.insert(spec.code.as_str()) {
                return Err(ConfigError::invalid(Some(&spec.code), "duplicate dataset code"));
            }
            self.validate_spec(spec)?;
        }
        Ok(())
    }

    fn validate_spec(&self, spec: &DatasetSpec) -> Result<(), ConfigError> {
        let code = Some(spec.code.as_str());
        if spec.code.trim().is_empty() {
            return Err(ConfigError::invalid(None, "dataset code is empty"));
        }
        if !is_plain_ident(&spec.table_name()) {
            return Err(ConfigError::invalid(code, format!("table is not a plain identifier: {}", spec.table_name())));
        }
        let url = format!("{}{}", self.api.base_url.trim_end_matches('/'), spec.endpoint_path());
        if !spec.endpoint.starts_with('/') || Url::parse(&url).is_err() {
            return Err(ConfigError::invalid(code, format!("endpoint does not form a URL: {}", spec.endpoint)));
        }
        if spec.time_field.trim().is_empty() {
            return Err(ConfigError::invalid(code, "time_field is empty"));
        }
        if spec.chunk().num_seconds() <= 0 {
            return Err(ConfigError::invalid(code, "chunk_span must be positive"));
        }
        if spec.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(code, "retry.max_attempts must be at least 1"));
        }
        let mut seen = HashSet::new();
        for field in &spec.natural_key {
            if field.trim().is_empty() || !seen.insert(field.as_str()) {
                return Err(ConfigError::invalid(code, format!("bad or repeated natural key field '{field}'")));
            }
        }
        let (warn, stale) = spec.staleness_cutoffs();
        if warn >= stale {
            return Err(ConfigError::invalid(code, "freshness warn_after must be below stale_after"));
        }
        Ok(())
    }

    /// Specs for the requested codes (case-insensitive); all when empty.
    pub fn select(&self, codes: &[String]) -> Result<Vec<DatasetSpec>, ConfigError> {
        if codes.is_empty() { return Ok(self.datasets.clone()); }
        codes
            .iter()
            .map(|c| {
                self.datasets
                    .iter()
                    .find(|s| s.code.eq_ignore_ascii_case(c))
                    .cloned()
                    .ok_or_else(|| ConfigError::invalid(Some(c.as_str()), "unknown dataset"))
            })
            .collect()
    }
}
