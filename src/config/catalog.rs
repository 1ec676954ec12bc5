// Built-in BMRS datasets, used when no config file is given.

use super::spec::{CommitMode, CoverageMode, DatasetSpec, DateParams, ResponseShape, Span};

pub fn builtin() -> Vec<DatasetSpec> {
    vec![fuelinst(), freq(), bod(), boalf(), disbsad(), mid(), indo(), windfor(), nonbm()]
}

fn fuelinst() -> DatasetSpec {
    let mut s = DatasetSpec::new("FUELINST", "startTime");
    s.endpoint = "/datasets/{code}/stream".into();
    s.response_shape = ResponseShape::Stream;
    s.natural_key = keys(&["startTime", "fuelType"]);
    s.publish_time_field = Some("publishTime".into());
    s.chunk_span = Span::days(1);
    s.freshness.warn_after = Span::minutes(30);
    s.freshness.stale_after = Span::hours(2);
    s
}

fn freq() -> DatasetSpec {
    let mut s = DatasetSpec::new("FREQ", "measurementTime");
    s.endpoint = "/datasets/{code}/stream".into();
    s.response_shape = ResponseShape::Stream;
    s.natural_key = keys(&["measurementTime"]);
    s.chunk_span = Span::days(1);
    // forward-filled, key-space never overlaps stored rows
    s.commit_mode = CommitMode::Append;
    s.coverage = CoverageMode::Latest;
    s.freshness.warn_after = Span::minutes(15);
    s.freshness.stale_after = Span::hours(1);
    s
}

fn bod() -> DatasetSpec {
    let mut s = DatasetSpec::new("BOD", "timeFrom");
    s.endpoint = "/datasets/{code}/stream".into();
    s.response_shape = ResponseShape::Stream;
    s.natural_key = keys(&["settlementDate", "settlementPeriod", "bmUnit", "pairId"]);
    s.chunk_span = Span::hours(1);
    s.extra_params.insert("settlementPeriodFrom".into(), "1".into());
    s.extra_params.insert("settlementPeriodTo".into(), "50".into());
    s
}

fn boalf() -> DatasetSpec {
    let mut s = DatasetSpec::new("BOALF", "timeFrom");
    s.endpoint = "/datasets/{code}/stream".into();
    s.response_shape = ResponseShape::Stream;
    s.natural_key = keys(&["settlementDate", "settlementPeriodFrom", "bmUnit", "acceptanceNumber"]);
    s.chunk_span = Span::days(1);
    s
}

fn disbsad() -> DatasetSpec {
    let mut s = DatasetSpec::new("DISBSAD", "settlementDate");
    s.period_field = Some("settlementPeriod".into());
    s.natural_key = keys(&["settlementDate", "settlementPeriod", "id"]);
    s.publish_time_field = Some("publishTime".into());
    s.date_params = DateParams::SettlementDate;
    s.chunk_span = Span::days(1);
    s
}

fn mid() -> DatasetSpec {
    let mut s = DatasetSpec::new("MID", "startTime");
    s.natural_key = keys(&["settlementDate", "settlementPeriod", "dataProvider"]);
    s.chunk_span = Span::days(7);
    s
}

fn indo() -> DatasetSpec {
    let mut s = DatasetSpec::new("INDO", "startTime");
    s.natural_key = keys(&["settlementDate", "settlementPeriod"]);
    s.publish_time_field = Some("publishTime".into());
    s.date_params = DateParams::PublishDateTime;
    s.chunk_span = Span::days(7);
    s
}

fn windfor() -> DatasetSpec {
    let mut s = DatasetSpec::new("WINDFOR", "startTime");
    s.natural_key = keys(&["publishTime", "startTime"]);
    s.date_params = DateParams::PublishDateTime;
    s.chunk_span = Span::days(7);
    s.freshness.warn_after = Span::hours(6);
    s.freshness.stale_after = Span::days(2);
    s
}

fn nonbm() -> DatasetSpec {
    // no published identity; rows are keyed by content hash
    let mut s = DatasetSpec::new("NONBM", "startTime");
    s.chunk_span = Span::days(7);
    s
}

fn keys(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}
