//! Canonical timezone, clock, and the `recorded_at` normalizer.
//!
//! Every date grouping in the lake goes through [`CanonicalTz`]. Instants are
//! carried as offset-aware values end to end; naive date-times only exist
//! transiently while parsing vendor strings and are pinned to the canonical
//! offset immediately.

use std::sync::Mutex;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone,
    Timelike, Utc,
};
use serde_json::Value as JsonValue;

/// Numeric epoch keys, scanned in order.
pub const EPOCH_KEYS: [&str; 5] = ["dt", "timestamp", "ts", "t", "time"];
/// Date string keys, scanned after the epoch keys.
pub const DATE_KEYS: [&str; 3] = ["recorded_at", "date", "day"];

/// Epoch values at or below this are not treated as timestamps (pre-2001).
pub const MIN_PLAUSIBLE_EPOCH: f64 = 1_000_000_000.0;
const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalTz {
    offset: FixedOffset,
}

impl Default for CanonicalTz {
    fn default() -> Self {
        Self::utc_plus_9()
    }
}

impl CanonicalTz {
    pub const DEFAULT_OFFSET_HOURS: i32 = 9;

    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc_plus_9() -> Self {
        match FixedOffset::east_opt(Self::DEFAULT_OFFSET_HOURS * 3600) {
            Some(offset) => Self { offset },
            None => Self::utc(),
        }
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }

    /// `None` when the offset is outside ±23 hours.
    pub fn from_offset_hours(hours: i32) -> Option<Self> {
        FixedOffset::east_opt(hours.checked_mul(3600)?).map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn localize<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> DateTime<FixedOffset> {
        instant.with_timezone(&self.offset)
    }

    pub fn date_of<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> NaiveDate {
        self.localize(instant).date_naive()
    }

    pub fn hour_of<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> u32 {
        self.localize(instant).hour()
    }

    /// Pins a wall-clock reading in this timezone to an instant.
    pub fn pin_local(&self, local: NaiveDateTime) -> DateTime<FixedOffset> {
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        self.offset.from_utc_datetime(&utc)
    }

    pub fn start_of_day(&self, date: NaiveDate) -> DateTime<FixedOffset> {
        self.pin_local(date.and_time(NaiveTime::MIN))
    }

    /// Half-open `[start, end)` bounds of a canonical calendar date.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
        let start = self.start_of_day(date);
        (start, start + Duration::days(1))
    }

    pub fn today(&self, now: &DateTime<Utc>) -> NaiveDate {
        self.date_of(now)
    }

    /// The last `days` calendar dates ending with today, ascending.
    pub fn trailing_dates(&self, now: &DateTime<Utc>, days: u32) -> Vec<NaiveDate> {
        let today = self.today(now);
        (0..i64::from(days))
            .rev()
            .map(|back| today - Duration::days(back))
            .collect()
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves the measurement time of a payload, falling back to `fallback`.
/// Total: always yields a canonical-timezone instant.
pub fn resolve_recorded_at(
    payload: &JsonValue,
    fallback: DateTime<Utc>,
    tz: CanonicalTz,
) -> DateTime<FixedOffset> {
    embedded_timestamp(payload, tz).unwrap_or_else(|| tz.localize(&fallback))
}

/// Like [`resolve_recorded_at`] but tries a producer hint before the fallback.
pub fn resolve_recorded_at_with_hint(
    payload: &JsonValue,
    hint: Option<&str>,
    fallback: DateTime<Utc>,
    tz: CanonicalTz,
) -> DateTime<FixedOffset> {
    embedded_timestamp(payload, tz)
        .or_else(|| hint.and_then(|h| parse_date_string(h, tz)))
        .unwrap_or_else(|| tz.localize(&fallback))
}

pub fn embedded_timestamp(payload: &JsonValue, tz: CanonicalTz) -> Option<DateTime<FixedOffset>> {
    let object = payload.as_object()?;

    for key in EPOCH_KEYS {
        let Some(secs) = object.get(key).and_then(plausible_epoch) else {
            continue;
        };
        if let Some(instant) = from_epoch_seconds(secs, tz) {
            return Some(instant);
        }
    }

    for key in DATE_KEYS {
        let Some(raw) = object.get(key).and_then(JsonValue::as_str) else {
            continue;
        };
        if let Some(instant) = parse_date_string(raw, tz) {
            return Some(instant);
        }
    }

    None
}

fn plausible_epoch(value: &JsonValue) -> Option<f64> {
    let secs = value.as_f64()?;
    (secs > MIN_PLAUSIBLE_EPOCH).then_some(secs)
}

fn from_epoch_seconds(secs: f64, tz: CanonicalTz) -> Option<DateTime<FixedOffset>> {
    if !secs.is_finite() || secs > i64::MAX as f64 {
        return None;
    }
    let whole = secs.trunc();
    let nanos = ((secs - whole) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;
    let instant = DateTime::<Utc>::from_timestamp(whole as i64, nanos)?;
    if instant.year() > MAX_YEAR {
        return None;
    }
    Some(tz.localize(&instant))
}

/// Full ISO-8601 first, then the first ten characters as a bare date at
/// canonical midnight. Strings shorter than ten characters never parse.
pub fn parse_date_string(raw: &str, tz: CanonicalTz) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.chars().count() < 10 {
        return None;
    }

    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Some(tz.localize(&instant));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M:%S%.f%z"] {
        if let Ok(instant) = DateTime::parse_from_str(raw, pattern) {
            return Some(tz.localize(&instant));
        }
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(local) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(tz.pin_local(local));
        }
    }

    let head = raw.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .ok()
        .map(|date| tz.start_of_day(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn jst() -> CanonicalTz {
        CanonicalTz::default()
    }

    #[test]
    fn late_utc_evening_buckets_into_next_canonical_date() {
        let fetched = utc("2026-02-11T23:30:00+00:00");
        assert_eq!(
            jst().date_of(&fetched),
            NaiveDate::from_ymd_opt(2026, 2, 12).unwrap()
        );
        assert_eq!(
            CanonicalTz::utc().date_of(&fetched),
            NaiveDate::from_ymd_opt(2026, 2, 11).unwrap()
        );
        assert_eq!(jst().hour_of(&fetched), 8);
    }

    #[test]
    fn epoch_keys_take_priority_over_date_strings() {
        let payload = json!({"day": "2020-01-01", "dt": 1_770_852_600});
        let resolved = resolve_recorded_at(&payload, utc("2026-03-01T00:00:00Z"), jst());
        assert_eq!(resolved, utc("2026-02-11T23:30:00Z"));
        assert_eq!(resolved.offset().local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn small_numbers_are_not_epochs() {
        let payload = json!({"t": 42, "time": "not-a-number"});
        let fallback = utc("2026-02-11T00:00:00Z");
        assert_eq!(resolve_recorded_at(&payload, fallback, jst()), fallback);
    }

    #[test]
    fn millisecond_epochs_are_rejected_and_scan_continues() {
        let payload = json!({"t": 1_770_852_600_000_i64, "day": "2026-02-11"});
        let resolved = resolve_recorded_at(&payload, utc("2026-03-01T00:00:00Z"), jst());
        assert_eq!(resolved.date_naive(), NaiveDate::from_ymd_opt(2026, 2, 11).unwrap());
    }

    #[test]
    fn iso_strings_with_z_are_converted_to_canonical_offset() {
        let payload = json!({"recorded_at": "2026-02-11T23:30:00Z"});
        let resolved = resolve_recorded_at(&payload, utc("2026-03-01T00:00:00Z"), jst());
        assert_eq!(resolved.to_rfc3339(), "2026-02-12T08:30:00+09:00");
    }

    #[test]
    fn bare_dates_anchor_to_canonical_midnight() {
        let payload = json!({"day": "2026-02-11"});
        let resolved = resolve_recorded_at(&payload, utc("2026-03-01T00:00:00Z"), jst());
        assert_eq!(resolved.to_rfc3339(), "2026-02-11T00:00:00+09:00");
    }

    #[test]
    fn naive_datetimes_are_read_as_canonical_wall_clock() {
        let payload = json!({"date": "2026-02-11 07:15:00"});
        let resolved = resolve_recorded_at(&payload, utc("2026-03-01T00:00:00Z"), jst());
        assert_eq!(resolved.to_rfc3339(), "2026-02-11T07:15:00+09:00");
    }

    #[test]
    fn garbage_and_empty_payloads_fall_back_to_wall_clock() {
        let fallback = utc("2026-02-11T23:30:00Z");
        for payload in [json!({}), json!({"day": "yesterday"}), json!([1, 2]), json!("x")] {
            let resolved = resolve_recorded_at(&payload, fallback, jst());
            assert_eq!(resolved, fallback);
            assert_eq!(resolved.offset().local_minus_utc(), 9 * 3600);
            assert!(DateTime::parse_from_rfc3339(&resolved.to_rfc3339()).is_ok());
        }
    }

    #[test]
    fn hint_is_used_only_when_payload_has_no_time() {
        let fallback = utc("2026-03-01T00:00:00Z");
        let resolved =
            resolve_recorded_at_with_hint(&json!({"score": 1}), Some("2026-02-10"), fallback, jst());
        assert_eq!(resolved.to_rfc3339(), "2026-02-10T00:00:00+09:00");

        let resolved = resolve_recorded_at_with_hint(
            &json!({"day": "2026-02-11"}),
            Some("2026-02-10"),
            fallback,
            jst(),
        );
        assert_eq!(resolved.to_rfc3339(), "2026-02-11T00:00:00+09:00");
    }

    #[test]
    fn trailing_dates_end_today_in_canonical_time() {
        let now = utc("2026-02-11T23:30:00Z");
        let dates = jst().trailing_dates(&now, 3);
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
                NaiveDate::from_ymd_opt(2026, 2, 11).unwrap(),
                NaiveDate::from_ymd_opt(2026, 2, 12).unwrap(),
            ]
        );
        assert!(jst().trailing_dates(&now, 0).is_empty());
    }

    #[test]
    fn day_bounds_are_half_open_canonical_midnights() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 12).unwrap();
        let (start, end) = jst().day_bounds(date);
        assert_eq!(start, utc("2026-02-11T15:00:00Z"));
        assert_eq!(end, utc("2026-02-12T15:00:00Z"));
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(utc("2026-02-11T22:00:00Z"));
        clock.advance(Duration::hours(1));
        assert_eq!(clock.now(), utc("2026-02-11T23:00:00Z"));
        assert!(CanonicalTz::from_offset_hours(30).is_none());
        assert_eq!(
            CanonicalTz::from_offset_hours(9).unwrap(),
            CanonicalTz::default()
        );
    }
}
