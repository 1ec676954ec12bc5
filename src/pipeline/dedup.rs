use std::collections::HashMap;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::spec::SurvivorRule;
use crate::config::DatasetSpec;
use crate::ingestion::types::{IngestKey, KeyedRecord, RawRecord};

/// Identity of a record: its natural-key values, or a content hash when the
/// dataset declares no natural key. Two records with the same hash are taken
/// to be the same logical record.
pub fn ingest_key(spec: &DatasetSpec, record: &RawRecord) -> IngestKey {
    if spec.natural_key.is_empty() {
        return IngestKey(content_hash(&record.fields));
    }
    let parts: Vec<Option<String>> = spec.natural_key.iter().map(|f| record.text(f)).collect();
    // a JSON array keeps field boundaries and nulls unambiguous
    IngestKey(Value::from(parts.into_iter().map(|p| p.map(Value::String).unwrap_or(Value::Null)).collect::<Vec<_>>()).to_string())
}

/// `sha256:<hex>` of the record as canonical JSON: keys sorted, nulls dropped.
pub fn content_hash(fields: &Map<String, Value>) -> String {
    let canonical = canonicalize(&Value::Object(fields.clone()));
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256:");
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn canonicalize(v: &Value) -> Value {
    match v {
        // serde_json::Map is ordered by key
        Value::Object(m) => Value::Object(
            m.iter().filter(|(_, v)| !v.is_null()).map(|(k, v)| (k.clone(), canonicalize(v))).collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Default)]
pub struct DedupOutcome {
    /// One survivor per key, in the order the survivors arrived.
    pub records: Vec<KeyedRecord>,
    /// Records dropped as intra-batch duplicates.
    pub duplicates: usize,
}

/// Keep one record per IngestKey within this fetch. Cross-batch duplicates
/// are left to the loader's merge.
pub fn dedupe(spec: &DatasetSpec, records: Vec<RawRecord>) -> DedupOutcome {
    let mut slots: Vec<(usize, KeyedRecord)> = Vec::with_capacity(records.len());
    let mut index: HashMap<IngestKey, usize> = HashMap::with_capacity(records.len());
    let mut duplicates = 0;

    for (ordinal, record) in records.into_iter().enumerate() {
        let key = ingest_key(spec, &record);
        match index.get(&key) {
            None => {
                index.insert(key.clone(), slots.len());
                slots.push((ordinal, KeyedRecord { key, record }));
            }
            Some(&slot) => {
                duplicates += 1;
                if replaces(spec, &slots[slot].1.record, &record) {
                    slots[slot] = (ordinal, KeyedRecord { key, record });
                }
            }
        }
    }

    slots.sort_by_key(|(ordinal, _)| *ordinal);
    DedupOutcome { records: slots.into_iter().map(|(_, r)| r).collect(), duplicates }
}

fn replaces(spec: &DatasetSpec, kept: &RawRecord, challenger: &RawRecord) -> bool {
    match spec.survivor {
        SurvivorRule::FirstSeen => false,
        SurvivorRule::LastSeen => true,
        // strictly later publish time wins; ties keep the earlier record
        SurvivorRule::LatestPublish => challenger.publish_time(spec) > kept.publish_time(spec),
    }
}
