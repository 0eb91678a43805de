//! Core domain model for the YuruHealth raw data lake.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod time;

pub use time::{resolve_recorded_at, CanonicalTz, Clock, FixedClock, SystemClock};

pub const CRATE_NAME: &str = "yuru-core";

/// Producer of raw payloads. The set is closed; adding a vendor means adding a
/// variant here and an extractor in `yuru-adapters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    #[serde(alias = "oura", alias = "sleep_ring")]
    SleepRing,
    #[serde(alias = "withings")]
    Scale,
    #[serde(alias = "google_fit", alias = "fitness_service")]
    FitnessService,
    #[serde(alias = "openweathermap")]
    Weather,
    #[serde(alias = "switchbot", alias = "indoor_sensor")]
    IndoorSensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DiscreteEvent,
    ContinuousSensor,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source tag `{0}`")]
pub struct UnknownSource(pub String);

impl Source {
    pub const ALL: [Source; 5] = [
        Source::SleepRing,
        Source::Scale,
        Source::FitnessService,
        Source::Weather,
        Source::IndoorSensor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::SleepRing => "sleep-ring",
            Source::Scale => "scale",
            Source::FitnessService => "fitness-service",
            Source::Weather => "weather",
            Source::IndoorSensor => "indoor-sensor",
        }
    }

    /// Every tag a stored row of this source may carry: the canonical tag
    /// first, then the vendor tags older lakes were written with.
    pub fn stored_tags(&self) -> &'static [&'static str] {
        match self {
            Source::SleepRing => &["sleep-ring", "sleep_ring", "oura"],
            Source::Scale => &["scale", "withings"],
            Source::FitnessService => &["fitness-service", "fitness_service", "google_fit", "google-fit"],
            Source::Weather => &["weather", "openweathermap"],
            Source::IndoorSensor => &["indoor-sensor", "indoor_sensor", "switchbot"],
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Source::Weather | Source::IndoorSensor => SourceKind::ContinuousSensor,
            Source::SleepRing | Source::Scale | Source::FitnessService => SourceKind::DiscreteEvent,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::SleepRing => "Sleep ring",
            Source::Scale => "Smart scale",
            Source::FitnessService => "Fitness service",
            Source::Weather => "Weather",
            Source::IndoorSensor => "Indoor sensor",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = UnknownSource;

    /// Accepts the canonical kebab-case tags plus the vendor tags older lakes
    /// were written with.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_lowercase();
        Source::ALL
            .into_iter()
            .find(|source| source.stored_tags().contains(&tag.as_str()))
            .ok_or(UnknownSource(tag))
    }
}

/// The `(user, source, category)` triple the ingestion gate deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub user_id: String,
    pub source: Source,
    pub category: String,
}

impl DedupKey {
    pub fn new(user_id: impl Into<String>, source: Source, category: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            source,
            category: category.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.source, self.category)
    }
}

/// One immutable row of the lake. Timestamps are expressed in the canonical
/// timezone of the store that produced the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub user_id: String,
    pub source: Source,
    pub category: String,
    pub fetched_at: DateTime<FixedOffset>,
    pub recorded_at: DateTime<FixedOffset>,
    pub payload: JsonValue,
}

impl RawRecord {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.user_id.clone(), self.source, self.category.clone())
    }
}

/// Row about to be appended; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRawRecord {
    pub user_id: String,
    pub source: Source,
    pub category: String,
    pub fetched_at: DateTime<FixedOffset>,
    pub recorded_at: DateTime<FixedOffset>,
    pub payload: JsonValue,
}

impl NewRawRecord {
    pub fn into_record(self, id: i64) -> RawRecord {
        RawRecord {
            id,
            user_id: self.user_id,
            source: self.source,
            category: self.category,
            fetched_at: self.fetched_at,
            recorded_at: self.recorded_at,
            payload: self.payload,
        }
    }
}

/// Handoff contract from producers into the ingestion gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Harvest {
    pub user_id: String,
    pub source: Source,
    pub category: String,
    pub payload: JsonValue,
    /// Producer-side guess at when the measurement happened, e.g. a vendor `day`.
    #[serde(default)]
    pub recorded_hint: Option<String>,
}

impl Harvest {
    pub fn new(
        user_id: impl Into<String>,
        source: Source,
        category: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            source,
            category: category.into(),
            payload,
            recorded_hint: None,
        }
    }

    pub fn with_recorded_hint(mut self, hint: impl Into<String>) -> Self {
        self.recorded_hint = Some(hint.into());
        self
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(self.user_id.clone(), self.source, self.category.clone())
    }
}

/// Continuous numeric channels exposed by sensor-like sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temp,
    Humidity,
    Co2,
    Pressure,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Temp, Metric::Humidity, Metric::Co2, Metric::Pressure];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temp => "temp",
            Metric::Humidity => "humidity",
            Metric::Co2 => "co2",
            Metric::Pressure => "pressure",
        }
    }

    pub fn avg_column(&self) -> String {
        format!("{}_avg", self.as_str())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rounds to one decimal place, half away from zero.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Named scalar highlights of a discrete-event source for one day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Badge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_min: Option<i64>,
}

fn overwrite<T: Copy>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl Badge {
    pub fn is_empty(&self) -> bool {
        *self == Badge::default()
    }

    /// Field-wise last-write-wins: every field set on `later` replaces ours.
    pub fn merge_from(&mut self, later: &Badge) {
        overwrite(&mut self.sleep_score, later.sleep_score);
        overwrite(&mut self.activity_score, later.activity_score);
        overwrite(&mut self.readiness_score, later.readiness_score);
        overwrite(&mut self.steps, later.steps);
        overwrite(&mut self.weight_kg, later.weight_kg);
        overwrite(&mut self.sleep_min, later.sleep_min);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlySample {
    pub hour: u32,
    pub values: BTreeMap<Metric, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub stats: BTreeMap<Metric, MetricStats>,
}

impl SeriesSummary {
    /// avg/min/max per metric over the samples that carry it, rounded to one decimal.
    pub fn from_samples(samples: &[HourlySample]) -> Self {
        let mut stats = BTreeMap::new();
        for metric in Metric::ALL {
            let values: Vec<f64> = samples
                .iter()
                .filter_map(|s| s.values.get(&metric).copied())
                .collect();
            if values.is_empty() {
                continue;
            }
            let sum: f64 = values.iter().sum();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            stats.insert(
                metric,
                MetricStats {
                    avg: round1(sum / values.len() as f64),
                    min: round1(min),
                    max: round1(max),
                },
            );
        }
        Self { stats }
    }

    pub fn get(&self, metric: Metric) -> Option<&MetricStats> {
        self.stats.get(&metric)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArrivalDetail {
    Empty,
    Badge {
        badge: Badge,
    },
    Series {
        timeseries: Vec<HourlySample>,
        summary: SeriesSummary,
    },
}

/// Presence and summary for one `(source, date)` cell of the arrival grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalCell {
    pub source: Source,
    pub date: NaiveDate,
    pub has_data: bool,
    pub record_count: usize,
    pub detail: ArrivalDetail,
}

impl ArrivalCell {
    pub fn empty(source: Source, date: NaiveDate) -> Self {
        Self {
            source,
            date,
            has_data: false,
            record_count: 0,
            detail: ArrivalDetail::Empty,
        }
    }

    pub fn badge(&self) -> Option<&Badge> {
        match &self.detail {
            ArrivalDetail::Badge { badge } => Some(badge),
            _ => None,
        }
    }

    pub fn summary(&self) -> Option<&SeriesSummary> {
        match &self.detail {
            ArrivalDetail::Series { summary, .. } => Some(summary),
            _ => None,
        }
    }

    pub fn timeseries(&self) -> &[HourlySample] {
        match &self.detail {
            ArrivalDetail::Series { timeseries, .. } => timeseries,
            _ => &[],
        }
    }
}

/// One calendar date of the categorical-vs-continuous join. Averages that
/// have no matching continuous data stay `None`, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRow {
    pub date: NaiveDate,
    pub score: i64,
    pub averages: BTreeMap<Metric, Option<f64>>,
}

impl CorrelationRow {
    pub fn average(&self, metric: Metric) -> Option<f64> {
        self.averages.get(&metric).copied().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationTable {
    pub columns: Vec<String>,
    pub rows: Vec<CorrelationRow>,
}

impl CorrelationTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
