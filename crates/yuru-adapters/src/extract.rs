//! One extractor per [`Source`]. Aggregators never inspect payload shapes
//! directly; they ask the extractor registered for the record's source.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use yuru_core::{round1, Badge, Metric, Source, SourceKind};

use crate::{json_f64, json_i64};

pub trait PayloadExtractor: Send + Sync {
    fn source(&self) -> Source;

    fn kind(&self) -> SourceKind {
        self.source().kind()
    }

    /// Scalar highlights of one discrete-event payload. Unrecognized shapes
    /// yield an empty badge.
    fn badge(&self, _category: &str, _payload: &JsonValue) -> Badge {
        Badge::default()
    }

    /// Numeric channels of one continuous-sensor payload.
    fn sensor_sample(&self, _payload: &JsonValue) -> BTreeMap<Metric, f64> {
        BTreeMap::new()
    }

    fn metrics(&self) -> &'static [Metric] {
        &[]
    }
}

struct SleepRingExtractor;
struct ScaleExtractor;
struct FitnessServiceExtractor;
struct IndoorSensorExtractor;
struct WeatherExtractor;

static SLEEP_RING: SleepRingExtractor = SleepRingExtractor;
static SCALE: ScaleExtractor = ScaleExtractor;
static FITNESS_SERVICE: FitnessServiceExtractor = FitnessServiceExtractor;
static INDOOR_SENSOR: IndoorSensorExtractor = IndoorSensorExtractor;
static WEATHER: WeatherExtractor = WeatherExtractor;

pub fn extractor_for(source: Source) -> &'static dyn PayloadExtractor {
    match source {
        Source::SleepRing => &SLEEP_RING,
        Source::Scale => &SCALE,
        Source::FitnessService => &FITNESS_SERVICE,
        Source::IndoorSensor => &INDOOR_SENSOR,
        Source::Weather => &WEATHER,
    }
}

impl PayloadExtractor for SleepRingExtractor {
    fn source(&self) -> Source {
        Source::SleepRing
    }

    fn badge(&self, category: &str, payload: &JsonValue) -> Badge {
        let mut badge = Badge::default();
        let score = json_i64(payload, &["score"]);
        match category {
            "sleep" => badge.sleep_score = score,
            "activity" => badge.activity_score = score,
            "readiness" => badge.readiness_score = score,
            _ => {}
        }
        badge.steps = json_i64(payload, &["steps"]);
        badge
    }
}

impl ScaleExtractor {
    fn weights(payload: &JsonValue) -> Vec<f64> {
        let mut weights = Vec::new();
        if let Some(weight) = json_f64(payload, &["weight"]) {
            weights.push(weight);
        }
        let measures = payload
            .get("measures")
            .and_then(JsonValue::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for measure in measures {
            if json_i64(measure, &["type"]) != Some(1) {
                continue;
            }
            let value = json_f64(measure, &["value"]).unwrap_or(0.0);
            let unit = json_i64(measure, &["unit"]).unwrap_or(0);
            let kg = value * 10f64.powi(unit as i32);
            if kg > 0.0 {
                weights.push(round1(kg));
            }
        }
        weights
    }
}

impl PayloadExtractor for ScaleExtractor {
    fn source(&self) -> Source {
        Source::Scale
    }

    fn badge(&self, _category: &str, payload: &JsonValue) -> Badge {
        Badge {
            weight_kg: Self::weights(payload).last().copied().map(round1),
            ..Badge::default()
        }
    }
}

impl PayloadExtractor for FitnessServiceExtractor {
    fn source(&self) -> Source {
        Source::FitnessService
    }

    fn badge(&self, category: &str, payload: &JsonValue) -> Badge {
        let data_type = payload
            .get("data_type")
            .and_then(JsonValue::as_str)
            .unwrap_or(category)
            .to_ascii_lowercase();
        let mut badge = Badge::default();
        let Some(value) = json_f64(payload, &["value"]) else {
            return badge;
        };
        if data_type.contains("step") {
            badge.steps = Some(value as i64);
        } else if data_type.contains("weight") {
            badge.weight_kg = Some(round1(value));
        } else if data_type.contains("sleep") {
            badge.sleep_min = Some(value as i64);
        }
        badge
    }
}

/// Reads a channel from the payload root, then from a vendor `body` envelope.
fn root_or_body(payload: &JsonValue, key: &str) -> Option<f64> {
    json_f64(payload, &[key]).or_else(|| json_f64(payload, &["body", key]))
}

impl PayloadExtractor for IndoorSensorExtractor {
    fn source(&self) -> Source {
        Source::IndoorSensor
    }

    fn sensor_sample(&self, payload: &JsonValue) -> BTreeMap<Metric, f64> {
        [
            (Metric::Temp, "temperature"),
            (Metric::Humidity, "humidity"),
            (Metric::Co2, "CO2"),
        ]
        .into_iter()
        .filter_map(|(metric, key)| root_or_body(payload, key).map(|v| (metric, v)))
        .collect()
    }

    fn metrics(&self) -> &'static [Metric] {
        &[Metric::Temp, Metric::Humidity, Metric::Co2]
    }
}

impl PayloadExtractor for WeatherExtractor {
    fn source(&self) -> Source {
        Source::Weather
    }

    fn sensor_sample(&self, payload: &JsonValue) -> BTreeMap<Metric, f64> {
        [
            (Metric::Temp, "temp"),
            (Metric::Humidity, "humidity"),
            (Metric::Pressure, "pressure"),
        ]
        .into_iter()
        .filter_map(|(metric, key)| json_f64(payload, &["main", key]).map(|v| (metric, v)))
        .collect()
    }

    fn metrics(&self) -> &'static [Metric] {
        &[Metric::Temp, Metric::Humidity, Metric::Pressure]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_source_has_an_extractor_of_its_kind() {
        for source in Source::ALL {
            let extractor = extractor_for(source);
            assert_eq!(extractor.source(), source);
            assert_eq!(extractor.kind(), source.kind());
            let has_metrics = !extractor.metrics().is_empty();
            assert_eq!(has_metrics, source.kind() == SourceKind::ContinuousSensor);
        }
    }

    #[test]
    fn sleep_ring_score_is_keyed_by_category() {
        let ring = extractor_for(Source::SleepRing);
        let sleep = ring.badge("sleep", &json!({"day": "2026-02-11", "score": 82}));
        assert_eq!(sleep.sleep_score, Some(82));
        assert_eq!(sleep.activity_score, None);

        let activity = ring.badge("activity", &json!({"score": 75, "steps": 8123}));
        assert_eq!(activity.activity_score, Some(75));
        assert_eq!(activity.steps, Some(8123));

        assert!(ring.badge("heartrate", &json!({"bpm": 60})).is_empty());
    }

    #[test]
    fn scale_prefers_last_valid_weight_measure() {
        let scale = extractor_for(Source::Scale);
        let payload = json!({
            "date": 1_770_800_000,
            "measures": [
                {"type": 1, "value": 70512, "unit": -3},
                {"type": 6, "value": 215, "unit": -1},
                {"type": 1, "value": 0, "unit": -3},
                {"type": 1, "value": 70987, "unit": -3}
            ]
        });
        assert_eq!(scale.badge("measure", &payload).weight_kg, Some(71.0));
        assert_eq!(scale.badge("measure", &json!({"weight": 68.24})).weight_kg, Some(68.2));
        assert!(scale.badge("measure", &json!({"measures": "n/a"})).is_empty());
    }

    #[test]
    fn fitness_service_maps_data_type_or_category() {
        let fit = extractor_for(Source::FitnessService);
        let steps = fit.badge("steps", &json!({"date": "2026-02-11", "data_type": "steps", "value": 9321}));
        assert_eq!(steps.steps, Some(9321));
        let weight = fit.badge("weight", &json!({"value": 70.26}));
        assert_eq!(weight.weight_kg, Some(70.3));
        let sleep = fit.badge("misc", &json!({"data_type": "sleep", "value": 412}));
        assert_eq!(sleep.sleep_min, Some(412));
        assert!(fit.badge("steps", &json!({"data_type": "steps"})).is_empty());
    }

    #[test]
    fn sensors_read_their_channels() {
        let indoor = extractor_for(Source::IndoorSensor)
            .sensor_sample(&json!({"temperature": 22.5, "humidity": 48, "CO2": 900}));
        assert_eq!(indoor.get(&Metric::Temp), Some(&22.5));
        assert_eq!(indoor.get(&Metric::Humidity), Some(&48.0));
        assert_eq!(indoor.get(&Metric::Co2), Some(&900.0));

        let wrapped = extractor_for(Source::IndoorSensor)
            .sensor_sample(&json!({"statusCode": 100, "body": {"temperature": 21.0}}));
        assert_eq!(wrapped.get(&Metric::Temp), Some(&21.0));

        let weather = extractor_for(Source::Weather)
            .sensor_sample(&json!({"main": {"temp": 4.2, "pressure": 1013}, "cod": 200}));
        assert_eq!(weather.len(), 2);
        assert_eq!(weather.get(&Metric::Pressure), Some(&1013.0));
        assert!(extractor_for(Source::Weather).sensor_sample(&json!([])).is_empty());
    }
}
