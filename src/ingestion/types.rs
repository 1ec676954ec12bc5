use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::DatasetSpec;
use crate::error::{Classify, ErrorKind};
use crate::util::time::parse_date_midnight;

/// Half-open `[from, to)` range requested from the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FetchWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self { Self { from, to } }

    pub fn is_empty(&self) -> bool { self.to <= self.from }

    pub fn span(&self) -> Duration { self.to - self.from }

    pub fn contains(&self, t: DateTime<Utc>) -> bool { self.from <= t && t < self.to }
}

impl std::fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from.to_rfc3339(), self.to.to_rfc3339())
    }
}

/// One parsed record from an API response, tagged with its dataset code.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub dataset: String,
    pub fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new(dataset: &str, fields: Map<String, Value>) -> Self {
        Self { dataset: dataset.to_string(), fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> { self.fields.get(field) }

    /// Scalar rendered the way it appears on the wire; None for null/absent.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        let raw = self.text(field)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Some(dt.with_timezone(&Utc));
        }
        parse_date_midnight(&raw)
    }

    /// Event time per the dataset's `time_field`; a date-only value is
    /// advanced by `(period - 1) * 30min` when a settlement period is declared.
    pub fn record_time(&self, spec: &DatasetSpec) -> Option<DateTime<Utc>> {
        let raw = self.text(&spec.time_field)?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
            return Some(dt.with_timezone(&Utc));
        }
        let day = parse_date_midnight(&raw)?;
        let period = spec
            .period_field
            .as_deref()
            .and_then(|f| self.text(f))
            .and_then(|p| p.parse::<i64>().ok())
            .filter(|p| *p >= 1);
        Some(match period {
            Some(p) => day + Duration::minutes(30 * (p - 1)),
            None => day,
        })
    }

    pub fn publish_time(&self, spec: &DatasetSpec) -> Option<DateTime<Utc>> {
        spec.publish_time_field.as_deref().and_then(|f| self.timestamp(f))
    }
}

/// Deterministic record identity: natural-key tuple or content hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IngestKey(pub String);

impl IngestKey {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for IngestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KeyedRecord {
    pub key: IngestKey,
    pub record: RawRecord,
}

/// Records of exactly one dataset from one window, ready to load.
#[derive(Clone, Debug)]
pub struct IngestBatch {
    pub id: Uuid,
    pub dataset: String,
    pub window: FetchWindow,
    pub ingested_at: DateTime<Utc>,
    pub records: Vec<KeyedRecord>,
}

impl IngestBatch {
    pub fn new(dataset: &str, window: FetchWindow, records: Vec<KeyedRecord>) -> Result<Self, MixedBatch> {
        if let Some(stray) = records.iter().find(|r| r.record.dataset != dataset) {
            return Err(MixedBatch { expected: dataset.to_string(), found: stray.record.dataset.clone() });
        }
        Ok(IngestBatch { id: Uuid::new_v4(), dataset: dataset.to_string(), window, ingested_at: Utc::now(), records })
    }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixedBatch {
    pub expected: String,
    pub found: String,
}

impl std::fmt::Display for MixedBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch for {} contains a {} record", self.expected, self.found)
    }
}

impl std::error::Error for MixedBatch {}

impl Classify for MixedBatch {
    fn kind(&self) -> ErrorKind { ErrorKind::Permanent }
    fn is_retryable(&self) -> bool { false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn rec(v: Value) -> RawRecord {
        RawRecord::new("DISBSAD", v.as_object().cloned().unwrap())
    }

    #[test]
    fn record_time_from_date_and_period() {
        let mut spec = DatasetSpec::new("DISBSAD", "settlementDate");
        spec.period_field = Some("settlementPeriod".into());
        let r = rec(json!({"settlementDate": "2024-01-02", "settlementPeriod": 3}));
        assert_eq!(r.record_time(&spec), Some(Utc.with_ymd_and_hms(2024, 1, 2, 1, 0, 0).unwrap()));

        spec.period_field = None;
        assert_eq!(r.record_time(&spec), Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()));
    }

    #[test]
    fn record_time_from_instant() {
        let spec = DatasetSpec::new("FUELINST", "startTime");
        let r = rec(json!({"startTime": "2024-01-02T10:30:00Z"}));
        assert_eq!(r.record_time(&spec), Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 30, 0).unwrap()));
        let r = rec(json!({"startTime": null}));
        assert_eq!(r.record_time(&spec), None);
    }

    #[test]
    fn text_renders_scalars() {
        let r = rec(json!({"a": "x", "b": 7, "c": true, "d": null, "e": 1.5}));
        assert_eq!(r.text("a").as_deref(), Some("x"));
        assert_eq!(r.text("b").as_deref(), Some("7"));
        assert_eq!(r.text("c").as_deref(), Some("true"));
        assert_eq!(r.text("d"), None);
        assert_eq!(r.text("missing"), None);
        assert_eq!(r.text("e").as_deref(), Some("1.5"));
    }

    #[test]
    fn batch_refuses_mixed_datasets() {
        let w = FetchWindow::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        let a = KeyedRecord { key: IngestKey("a".into()), record: RawRecord::new("MID", Map::new()) };
        let b = KeyedRecord { key: IngestKey("b".into()), record: RawRecord::new("BOD", Map::new()) };
        assert!(IngestBatch::new("MID", w, vec![a.clone()]).is_ok());
        let err = IngestBatch::new("MID", w, vec![a, b]).unwrap_err();
        assert_eq!(err.found, "BOD");
    }

    #[test]
    fn window_basics() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let w = FetchWindow::new(from, from + Duration::hours(1));
        assert!(w.contains(from));
        assert!(!w.contains(w.to));
        assert!(!w.is_empty());
        assert!(FetchWindow::new(from, from).is_empty());
    }
}
