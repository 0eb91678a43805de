//! Correlation Assembler: joins a per-day categorical score onto daily
//! averages of a continuous sensor.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::debug;
use yuru_adapters::{extractor_for, json_i64};
use yuru_core::{
    round1, CanonicalTz, CorrelationRow, CorrelationTable, Metric, RawRecord, Source,
};
use yuru_storage::{FetchOrder, LakeQuery, RawDataLake, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationSpec {
    pub categorical_source: Source,
    pub categorical_category: String,
    /// Payload key holding the integer score.
    pub score_key: String,
    pub score_column: String,
    /// Payload key holding the date the score belongs to.
    pub date_key: String,
    pub continuous_source: Source,
    pub continuous_category: String,
    pub metrics: Vec<Metric>,
}

impl Default for CorrelationSpec {
    fn default() -> Self {
        Self {
            categorical_source: Source::SleepRing,
            categorical_category: "sleep".to_string(),
            score_key: "score".to_string(),
            score_column: "sleep_score".to_string(),
            date_key: "day".to_string(),
            continuous_source: Source::IndoorSensor,
            continuous_category: "environment".to_string(),
            metrics: vec![Metric::Co2, Metric::Temp, Metric::Humidity],
        }
    }
}

impl CorrelationSpec {
    pub fn columns(&self) -> Vec<String> {
        let mut columns = vec!["date".to_string(), self.score_column.clone()];
        columns.extend(self.metrics.iter().map(Metric::avg_column));
        columns
    }
}

pub async fn correlate(lake: &RawDataLake, user_id: &str, days: u32) -> StoreResult<CorrelationTable> {
    correlate_with(lake, user_id, days, &CorrelationSpec::default()).await
}

pub async fn correlate_with(
    lake: &RawDataLake,
    user_id: &str,
    days: u32,
    spec: &CorrelationSpec,
) -> StoreResult<CorrelationTable> {
    let since = lake.now() - Duration::days(i64::from(days));
    let window = |source: Source, category: &str| {
        LakeQuery::new()
            .user(user_id)
            .source(source)
            .category(category)
            .since(since)
            .order(FetchOrder::Ascending)
    };

    let categorical = lake
        .scan(&window(spec.categorical_source, &spec.categorical_category))
        .await?;
    let continuous = lake
        .scan(&window(spec.continuous_source, &spec.continuous_category))
        .await?;
    debug!(
        user_id,
        days,
        categorical = categorical.len(),
        continuous = continuous.len(),
        "assembling correlation"
    );
    Ok(assemble_correlation(lake.tz(), spec, &categorical, &continuous))
}

/// Pure join. Both slices must be in ascending fetch order.
pub fn assemble_correlation(
    tz: CanonicalTz,
    spec: &CorrelationSpec,
    categorical: &[RawRecord],
    continuous: &[RawRecord],
) -> CorrelationTable {
    let mut scores: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for record in categorical {
        let Some(score) = json_i64(&record.payload, &[spec.score_key.as_str()]) else {
            continue;
        };
        scores.insert(categorical_date(tz, spec, record), score);
    }

    let extractor = extractor_for(spec.continuous_source);
    let mut sums: BTreeMap<(NaiveDate, Metric), (f64, usize)> = BTreeMap::new();
    for record in continuous {
        let date = tz.date_of(&record.fetched_at);
        for (metric, value) in extractor.sensor_sample(&record.payload) {
            let slot = sums.entry((date, metric)).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }
    }

    let rows = scores
        .into_iter()
        .map(|(date, score)| {
            let averages = spec
                .metrics
                .iter()
                .map(|metric| {
                    let avg = sums
                        .get(&(date, *metric))
                        .map(|(sum, count)| round1(sum / *count as f64));
                    (*metric, avg)
                })
                .collect();
            CorrelationRow { date, score, averages }
        })
        .collect();

    CorrelationTable {
        columns: spec.columns(),
        rows,
    }
}

fn categorical_date(tz: CanonicalTz, spec: &CorrelationSpec, record: &RawRecord) -> NaiveDate {
    record
        .payload
        .get(&spec.date_key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.get(..10))
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .unwrap_or_else(|| tz.date_of(&record.recorded_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, Utc};
    use serde_json::{json, Value as JsonValue};
    use yuru_core::FixedClock;
    use yuru_storage::MemoryLake;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn record(source: Source, category: &str, fetched_at: &str, payload: JsonValue) -> RawRecord {
        let at = DateTime::parse_from_rfc3339(fetched_at).unwrap();
        RawRecord {
            id: 0,
            user_id: "u1".into(),
            source,
            category: category.into(),
            fetched_at: at,
            recorded_at: at,
            payload,
        }
    }

    #[test]
    fn missing_environment_days_stay_null() {
        let sleep = vec![
            record(Source::SleepRing, "sleep", "2026-02-10T09:00:00+09:00", json!({"day": "2026-02-10", "score": 75})),
            record(Source::SleepRing, "sleep", "2026-02-11T09:00:00+09:00", json!({"day": "2026-02-11", "score": 82})),
        ];
        let env = vec![
            record(Source::IndoorSensor, "environment", "2026-02-10T07:00:00+09:00", json!({"temperature": 22.5, "humidity": 48, "CO2": 900})),
            record(Source::IndoorSensor, "environment", "2026-02-10T08:00:00+09:00", json!({"temperature": 23.1, "humidity": 50, "CO2": 950})),
        ];
        let table = assemble_correlation(CanonicalTz::default(), &CorrelationSpec::default(), &sleep, &env);

        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].date, day("2026-02-10"));
        assert_eq!(table.rows[0].average(Metric::Co2), Some(925.0));
        assert_eq!(table.rows[0].average(Metric::Temp), Some(22.8));
        assert_eq!(table.rows[1].date, day("2026-02-11"));
        assert_eq!(table.rows[1].score, 82);
        assert_eq!(table.rows[1].average(Metric::Co2), None);
        assert_eq!(table.rows[1].averages.get(&Metric::Temp), Some(&None));
    }

    #[test]
    fn later_score_for_same_day_wins_and_scoreless_records_are_ignored() {
        let sleep = vec![
            record(Source::SleepRing, "sleep", "2026-02-11T07:00:00+09:00", json!({"day": "2026-02-11", "score": 70})),
            record(Source::SleepRing, "sleep", "2026-02-11T09:00:00+09:00", json!({"day": "2026-02-11", "score": 82})),
            record(Source::SleepRing, "sleep", "2026-02-12T09:00:00+09:00", json!({"day": "2026-02-12"})),
        ];
        let table = assemble_correlation(CanonicalTz::default(), &CorrelationSpec::default(), &sleep, &[]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].score, 82);
    }

    #[test]
    fn date_falls_back_to_recorded_timestamp() {
        let sleep = vec![record(
            Source::SleepRing,
            "sleep",
            "2026-02-11T23:30:00+00:00",
            json!({"score": 60}),
        )];
        let table = assemble_correlation(CanonicalTz::default(), &CorrelationSpec::default(), &sleep, &[]);
        assert_eq!(table.rows[0].date, day("2026-02-12"));
    }

    #[test]
    fn empty_input_keeps_columns() {
        let table = assemble_correlation(CanonicalTz::default(), &CorrelationSpec::default(), &[], &[]);
        assert!(table.is_empty());
        assert_eq!(
            table.columns,
            vec!["date", "sleep_score", "co2_avg", "temp_avg", "humidity_avg"]
        );
    }

    #[tokio::test]
    async fn sleep_only_lake_correlates_with_null_environment() {
        let now = DateTime::parse_from_rfc3339("2026-02-11T22:00:00Z").unwrap().with_timezone(&Utc);
        let lake = RawDataLake::new(Arc::new(MemoryLake::new()), CanonicalTz::default())
            .with_clock(Arc::new(FixedClock::new(now)));
        lake.ingest("u1", Source::SleepRing, "sleep", json!({"day": "2026-02-11", "score": 82}))
            .await;

        let table = correlate(&lake, "u1", 14).await.unwrap();
        assert_eq!(table.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.date, day("2026-02-11"));
        assert_eq!(row.score, 82);
        for metric in [Metric::Co2, Metric::Temp, Metric::Humidity] {
            assert_eq!(row.average(metric), None);
        }
        assert!(correlate(&lake, "u2", 14).await.unwrap().is_empty());
    }
}
