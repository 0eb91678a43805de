//! Splits a raw vendor response into the per-item payloads the lake stores.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use yuru_core::{Harvest, Source};

use crate::{json_at, json_i64, AdapterError, ProducerContext};

/// Unwraps `raw` according to the envelope conventions of `source`. Vendor
/// error envelopes become [`AdapterError::Vendor`].
pub fn unwrap_vendor_response(
    ctx: &ProducerContext,
    source: Source,
    category: &str,
    raw: &JsonValue,
) -> Result<Vec<Harvest>, AdapterError> {
    let harvest = |payload: JsonValue| Harvest::new(ctx.user_id.clone(), source, category, payload);

    match source {
        Source::SleepRing => Ok(items(raw, &["data"])
            .iter()
            .map(|item| {
                let base = harvest(item.clone());
                match item.get("day").and_then(JsonValue::as_str) {
                    Some(day) => base.with_recorded_hint(day),
                    None => base,
                }
            })
            .collect()),
        Source::Scale => {
            let status = json_i64(raw, &["status"]);
            if status != Some(0) {
                return Err(vendor_error(source, raw, "status"));
            }
            Ok(items(raw, &["body", "measuregrps"])
                .iter()
                .map(|group| {
                    let base = harvest(group.clone());
                    match json_i64(group, &["date"]).and_then(epoch_hint) {
                        Some(hint) => base.with_recorded_hint(hint),
                        None => base,
                    }
                })
                .collect())
        }
        Source::FitnessService => Ok(flatten_fitness(ctx, category, raw)
            .into_iter()
            .map(harvest)
            .collect()),
        Source::IndoorSensor => {
            if json_i64(raw, &["statusCode"]) != Some(100) {
                return Err(vendor_error(source, raw, "statusCode"));
            }
            match raw.get("body") {
                Some(body) if body.is_object() => Ok(vec![harvest(body.clone())]),
                _ => Ok(Vec::new()),
            }
        }
        Source::Weather => {
            if let Some(code) = json_i64(raw, &["cod"]) {
                if code != 200 {
                    return Err(vendor_error(source, raw, "cod"));
                }
            }
            Ok(vec![harvest(raw.clone())])
        }
    }
}

fn items<'a>(raw: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(raw, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn vendor_error(source: Source, raw: &JsonValue, code_key: &str) -> AdapterError {
    let code = raw.get(code_key).map(ToString::to_string).unwrap_or_else(|| "missing".into());
    let detail = raw
        .get("message")
        .or_else(|| raw.get("error"))
        .and_then(JsonValue::as_str)
        .unwrap_or("");
    AdapterError::Vendor {
        source_tag: source,
        message: format!("{code_key}={code} {detail}").trim_end().to_string(),
    }
}

fn epoch_hint(secs: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(secs, 0).map(|at| at.to_rfc3339())
}

fn millis_value(value: Option<&JsonValue>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Step buckets, weight points, and sleep sessions become daily
/// `{date, data_type, value}` payloads.
fn flatten_fitness(ctx: &ProducerContext, category: &str, raw: &JsonValue) -> Vec<JsonValue> {
    let mut out = Vec::new();

    for bucket in items(raw, &["bucket"]) {
        let Some(start) = millis_value(bucket.get("startTimeMillis")).and_then(millis_to_utc) else {
            continue;
        };
        let mut steps = 0i64;
        for dataset in items(bucket, &["dataset"]) {
            for point in items(dataset, &["point"]) {
                for value in items(point, &["value"]) {
                    steps += json_i64(value, &["intVal"]).unwrap_or(0);
                }
            }
        }
        out.push(json!({
            "date": ctx.tz.date_of(&start).format("%Y-%m-%d").to_string(),
            "data_type": "steps",
            "value": steps,
        }));
    }

    for point in items(raw, &["point"]) {
        let nanos = millis_value(point.get("startTimeNanos")).unwrap_or(0);
        let Some(at) = millis_to_utc(nanos / 1_000_000) else {
            continue;
        };
        let weight = items(point, &["value"])
            .iter()
            .filter_map(|v| v.get("fpVal").and_then(JsonValue::as_f64))
            .last();
        if let Some(weight) = weight {
            out.push(json!({
                "date": ctx.tz.localize(&at).to_rfc3339(),
                "data_type": "weight",
                "value": (weight * 100.0).round() / 100.0,
            }));
        }
    }

    for session in items(raw, &["session"]) {
        let start = millis_value(session.get("startTimeMillis")).and_then(millis_to_utc);
        let end = millis_value(session.get("endTimeMillis")).and_then(millis_to_utc);
        let (Some(start), Some(end)) = (start, end) else {
            continue;
        };
        out.push(json!({
            "date": ctx.tz.date_of(&start).format("%Y-%m-%d").to_string(),
            "data_type": "sleep",
            "value": (end - start).num_minutes(),
        }));
    }

    if out.is_empty() && raw.get("data_type").is_some() {
        out.push(raw.clone());
    }
    tracing::debug!(category, payloads = out.len(), "flattened fitness response");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use yuru_core::CanonicalTz;

    fn ctx() -> ProducerContext {
        let now = DateTime::parse_from_rfc3339("2026-02-12T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ProducerContext::new("u1", CanonicalTz::default(), now)
    }

    #[test]
    fn sleep_ring_items_carry_their_day_as_hint() {
        let raw = json!({"data": [
            {"day": "2026-02-10", "score": 80},
            {"day": "2026-02-11", "score": 82}
        ], "next_token": null});
        let harvests = unwrap_vendor_response(&ctx(), Source::SleepRing, "sleep", &raw).unwrap();
        assert_eq!(harvests.len(), 2);
        assert_eq!(harvests[1].recorded_hint.as_deref(), Some("2026-02-11"));
        assert_eq!(harvests[1].category, "sleep");
        assert_eq!(harvests[1].payload["score"], 82);
        assert!(unwrap_vendor_response(&ctx(), Source::SleepRing, "sleep", &json!({}))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn scale_requires_success_status() {
        let ok = json!({"status": 0, "body": {"measuregrps": [
            {"date": 1_770_800_000, "measures": [{"type": 1, "value": 70512, "unit": -3}]}
        ]}});
        let harvests = unwrap_vendor_response(&ctx(), Source::Scale, "measure", &ok).unwrap();
        assert_eq!(harvests.len(), 1);
        assert!(harvests[0].recorded_hint.is_some());

        let denied = json!({"status": 401, "error": "invalid_token"});
        let err = unwrap_vendor_response(&ctx(), Source::Scale, "measure", &denied).unwrap_err();
        assert!(matches!(err, AdapterError::Vendor { source_tag: Source::Scale, .. }));
        assert!(err.to_string().contains("status=401 invalid_token"));
    }

    #[test]
    fn fitness_responses_flatten_into_daily_payloads() {
        let steps = json!({"bucket": [{
            "startTimeMillis": "1770735600000",
            "dataset": [{"point": [{"value": [{"intVal": 4000}]}, {"value": [{"intVal": 1321}]}]}]
        }]});
        let harvests = unwrap_vendor_response(&ctx(), Source::FitnessService, "steps", &steps).unwrap();
        assert_eq!(harvests.len(), 1);
        assert_eq!(
            harvests[0].payload,
            json!({"date": "2026-02-11", "data_type": "steps", "value": 5321})
        );

        let sleep = json!({"session": [{"startTimeMillis": "1770760800000", "endTimeMillis": "1770786000000"}]});
        let harvests = unwrap_vendor_response(&ctx(), Source::FitnessService, "sleep", &sleep).unwrap();
        assert_eq!(harvests[0].payload["value"], 420);
        assert_eq!(harvests[0].payload["data_type"], "sleep");
    }

    #[test]
    fn indoor_sensor_yields_body_only_on_success() {
        let ok = json!({"statusCode": 100, "body": {"temperature": 22.5, "CO2": 900}, "message": "success"});
        let harvests = unwrap_vendor_response(&ctx(), Source::IndoorSensor, "environment", &ok).unwrap();
        assert_eq!(harvests[0].payload, json!({"temperature": 22.5, "CO2": 900}));

        let err = unwrap_vendor_response(
            &ctx(),
            Source::IndoorSensor,
            "environment",
            &json!({"statusCode": 190, "message": "device offline"}),
        )
        .unwrap_err();
        assert!(err.to_string().contains("device offline"));
    }

    #[test]
    fn weather_rejects_error_codes() {
        let ok = json!({"main": {"temp": 4.2}, "cod": 200});
        assert_eq!(
            unwrap_vendor_response(&ctx(), Source::Weather, "current", &ok).unwrap().len(),
            1
        );
        let bad = json!({"cod": "401", "message": "Invalid API key"});
        assert!(unwrap_vendor_response(&ctx(), Source::Weather, "current", &bad).is_err());
    }
}
