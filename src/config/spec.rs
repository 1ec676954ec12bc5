use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ingestion::types::FetchWindow;
use crate::util::retry::RetryPolicy;
use crate::util::sql::safe_table_name;
use crate::util::time::{date_only, format_span, parse_span, rfc3339_z};

pub const TABLE_PREFIX: &str = "bmrs";
const DEFAULT_ENDPOINT: &str = "/datasets/{code}";

/// A positive duration written as "30m", "1h", "1d", "2w" in config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Span(Duration);

impl Span {
    pub fn minutes(n: i64) -> Self { Span(Duration::minutes(n)) }
    pub fn hours(n: i64) -> Self { Span(Duration::hours(n)) }
    pub fn days(n: i64) -> Self { Span(Duration::days(n)) }
    pub fn duration(&self) -> Duration { self.0 }
}

impl TryFrom<String> for Span {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_span(&s).map(Span).ok_or_else(|| format!("bad span '{s}' (expected e.g. 30m, 1h, 1d, 2w)"))
    }
}

impl From<Span> for String {
    fn from(s: Span) -> Self { format_span(s.0) }
}

/// How the upstream endpoint names its window bounds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateParams {
    /// `from` / `to`, RFC3339 instants.
    #[default]
    FromTo,
    /// `publishDateTimeFrom` / `publishDateTimeTo`, RFC3339 instants.
    PublishDateTime,
    /// `settlementDateFrom` / `settlementDateTo`, inclusive calendar dates.
    SettlementDate,
}

impl DateParams {
    /// Smallest step the endpoint can address; windows are aligned to it.
    pub fn granularity(&self) -> Option<Duration> {
        match self {
            DateParams::SettlementDate => Some(Duration::days(1)),
            DateParams::FromTo | DateParams::PublishDateTime => None,
        }
    }

    pub fn query_pairs(&self, window: &FetchWindow) -> Vec<(String, String)> {
        match self {
            DateParams::FromTo => vec![
                ("from".into(), rfc3339_z(window.from)),
                ("to".into(), rfc3339_z(window.to)),
            ],
            DateParams::PublishDateTime => vec![
                ("publishDateTimeFrom".into(), rfc3339_z(window.from)),
                ("publishDateTimeTo".into(), rfc3339_z(window.to)),
            ],
            DateParams::SettlementDate => {
                // [from, to) -> inclusive date range
                let last = (window.to - Duration::seconds(1)).max(window.from);
                vec![
                    ("settlementDateFrom".into(), date_only(window.from)),
                    ("settlementDateTo".into(), date_only(last)),
                ]
            }
        }
    }
}

/// Response body variant declared per dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// `{"data": [...]}`
    #[default]
    Data,
    /// bare JSON array
    Stream,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Plain inserts; only for key-spaces known disjoint from stored rows.
    Append,
    /// Upsert by ingest key.
    #[default]
    Merge,
}

/// What the warehouse is asked for when looking for gaps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    /// Explicit set of loaded windows; holes anywhere are backfilled.
    #[default]
    Ranges,
    /// Everything before the latest loaded window end counts as covered.
    Latest,
}

/// Which record survives when several in one fetch share an ingest key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorRule {
    /// Latest publish time wins; ties keep the earlier record.
    #[default]
    LatestPublish,
    FirstSeen,
    LastSeen,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessThresholds {
    pub warn_after: Span,
    pub stale_after: Span,
    /// Look-back for the "recent rows" count.
    pub recent_window: Span,
}

impl Default for FreshnessThresholds {
    fn default() -> Self {
        Self { warn_after: Span::hours(2), stale_after: Span::days(1), recent_window: Span::days(1) }
    }
}

fn default_endpoint() -> String { DEFAULT_ENDPOINT.to_string() }
fn default_chunk_span() -> Span { Span::days(7) }

/// Everything the pipeline knows about one upstream dataset. Loaded once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub code: String,
    /// Path template under the API base; `{code}` is substituted.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub date_params: DateParams,
    #[serde(default)]
    pub response_shape: ResponseShape,
    /// Target table; defaults to `bmrs_<code>`.
    #[serde(default)]
    pub table: Option<String>,
    /// Fields forming the record identity; empty means content hash.
    #[serde(default)]
    pub natural_key: Vec<String>,
    /// Record timestamp used for coverage and freshness.
    pub time_field: String,
    /// Settlement period field refining a date-only `time_field`.
    #[serde(default)]
    pub period_field: Option<String>,
    #[serde(default)]
    pub publish_time_field: Option<String>,
    #[serde(default)]
    pub survivor: SurvivorRule,
    #[serde(default = "default_chunk_span")]
    pub chunk_span: Span,
    #[serde(default)]
    pub coverage: CoverageMode,
    #[serde(default)]
    pub commit_mode: CommitMode,
    #[serde(default)]
    pub all_or_nothing: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Per-dataset request spacing on top of the API-wide limit.
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
    #[serde(default)]
    pub freshness: FreshnessThresholds,
}

impl DatasetSpec {
    /// Minimal spec with defaults for everything but identity and timing.
    pub fn new(code: &str, time_field: &str) -> Self {
        DatasetSpec {
            code: code.to_string(),
            endpoint: default_endpoint(),
            date_params: DateParams::default(),
            response_shape: ResponseShape::default(),
            table: None,
            natural_key: Vec::new(),
            time_field: time_field.to_string(),
            period_field: None,
            publish_time_field: None,
            survivor: SurvivorRule::default(),
            chunk_span: default_chunk_span(),
            coverage: CoverageMode::default(),
            commit_mode: CommitMode::default(),
            all_or_nothing: false,
            retry: RetryPolicy::default(),
            min_interval_ms: 0,
            extra_params: BTreeMap::new(),
            freshness: FreshnessThresholds::default(),
        }
    }

    pub fn table_name(&self) -> String {
        match &self.table {
            Some(t) if !t.is_empty() => t.clone(),
            _ => safe_table_name(TABLE_PREFIX, &self.code),
        }
    }

    pub fn endpoint_path(&self) -> String {
        self.endpoint.replace("{code}", &self.code)
    }

    pub fn chunk(&self) -> Duration { self.chunk_span.duration() }

    /// Full query string for one window, `format=json` included.
    pub fn query_for(&self, window: &FetchWindow) -> Vec<(String, String)> {
        let mut q = self.date_params.query_pairs(window);
        for (k, v) in &self.extra_params { q.push((k.clone(), v.clone())); }
        q.push(("format".into(), "json".into()));
        q
    }

    /// Freshness classification cut-offs as a pair (warn, stale).
    pub fn staleness_cutoffs(&self) -> (Duration, Duration) {
        (self.freshness.warn_after.duration(), self.freshness.stale_after.duration())
    }

    pub fn recent_since(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.freshness.recent_window.duration()
    }
}
