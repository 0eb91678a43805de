//! Arrival Aggregator: which sources reported on which canonical dates.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;
use yuru_adapters::{extractor_for, PayloadExtractor};
use yuru_core::{
    ArrivalCell, ArrivalDetail, Badge, CanonicalTz, HourlySample, RawRecord, SeriesSummary,
    Source, SourceKind,
};
use yuru_storage::{FetchOrder, LakeQuery, RawDataLake, StoreResult};

/// Fixed-size calendar grid: one cell per `(source, date)`, filled or empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrivalGrid {
    pub dates: Vec<NaiveDate>,
    pub sources: Vec<Source>,
    pub cells: Vec<ArrivalCell>,
}

impl ArrivalGrid {
    pub fn cell(&self, source: Source, date: NaiveDate) -> Option<&ArrivalCell> {
        self.cells
            .iter()
            .find(|cell| cell.source == source && cell.date == date)
    }

    /// Cells of one source, ascending by date.
    pub fn row(&self, source: Source) -> Vec<&ArrivalCell> {
        self.cells.iter().filter(|cell| cell.source == source).collect()
    }

    pub fn filled(&self) -> usize {
        self.cells.iter().filter(|cell| cell.has_data).count()
    }
}

/// Presence grid over the trailing `window_days` canonical dates for `user_id`.
pub async fn arrivals(lake: &RawDataLake, user_id: &str, window_days: u32) -> StoreResult<ArrivalGrid> {
    let tz = lake.tz();
    let dates = tz.trailing_dates(&lake.now(), window_days.max(1));
    let since = match dates.first() {
        Some(first) => tz.start_of_day(*first).with_timezone(&Utc),
        None => lake.now(),
    };
    let records = lake
        .scan(
            &LakeQuery::new()
                .user(user_id)
                .since(since)
                .order(FetchOrder::Ascending),
        )
        .await?;
    debug!(user_id, window_days, records = records.len(), "building arrival grid");
    Ok(build_arrival_grid(tz, &dates, &records))
}

/// Pure grid assembly. `records` must be in ascending fetch order; later
/// records overwrite earlier badge fields, except scale weight, which comes
/// from the latest measurement.
pub fn build_arrival_grid(tz: CanonicalTz, dates: &[NaiveDate], records: &[RawRecord]) -> ArrivalGrid {
    let mut groups: BTreeMap<(Source, NaiveDate), Vec<&RawRecord>> = BTreeMap::new();
    for record in records {
        let date = tz.date_of(&record.fetched_at);
        groups.entry((record.source, date)).or_default().push(record);
    }

    let mut cells = Vec::with_capacity(Source::ALL.len() * dates.len());
    for source in Source::ALL {
        for date in dates {
            let cell = match groups.get(&(source, *date)) {
                Some(group) => fill_cell(tz, source, *date, group),
                None => ArrivalCell::empty(source, *date),
            };
            cells.push(cell);
        }
    }

    ArrivalGrid {
        dates: dates.to_vec(),
        sources: Source::ALL.to_vec(),
        cells,
    }
}

fn fill_cell(tz: CanonicalTz, source: Source, date: NaiveDate, group: &[&RawRecord]) -> ArrivalCell {
    let extractor = extractor_for(source);
    let detail = match extractor.kind() {
        SourceKind::ContinuousSensor => {
            let timeseries: Vec<HourlySample> = group
                .iter()
                .filter_map(|record| {
                    let values = extractor.sensor_sample(&record.payload);
                    (!values.is_empty()).then(|| HourlySample {
                        hour: tz.hour_of(&record.fetched_at),
                        values,
                    })
                })
                .collect();
            let summary = SeriesSummary::from_samples(&timeseries);
            ArrivalDetail::Series { timeseries, summary }
        }
        SourceKind::DiscreteEvent => {
            let mut badge = Badge::default();
            for record in group {
                badge.merge_from(&extractor.badge(&record.category, &record.payload));
            }
            if source == Source::Scale {
                badge.weight_kg = latest_measured_weight(extractor, group);
            }
            ArrivalDetail::Badge { badge }
        }
    };

    ArrivalCell {
        source,
        date,
        has_data: true,
        record_count: group.len(),
        detail,
    }
}

/// Weight of the group's most recent measurement. Equal measurement times
/// fall back to fetch order.
fn latest_measured_weight(extractor: &dyn PayloadExtractor, group: &[&RawRecord]) -> Option<f64> {
    group
        .iter()
        .filter_map(|record| {
            extractor
                .badge(&record.category, &record.payload)
                .weight_kg
                .map(|weight| (record.recorded_at, weight))
        })
        .max_by_key(|(recorded_at, _)| *recorded_at)
        .map(|(_, weight)| weight)
}
