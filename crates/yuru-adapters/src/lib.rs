//! Source-facing side of the lake: per-source payload extractors, vendor
//! response unwrapping, and the producers the orchestrator drives.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use yuru_core::{CanonicalTz, Source};
use yuru_storage::FetchError;

pub mod extract;
pub mod producer;
pub mod vendor;

pub use extract::{extractor_for, PayloadExtractor};
pub use producer::{
    CredentialProvider, EnvCredentials, FixtureCapture, FixtureProducer, HttpJsonProducer,
    SourceProducer, StaticCredentials,
};
pub use vendor::unwrap_vendor_response;

pub const CRATE_NAME: &str = "yuru-adapters";

/// Per-run inputs shared by every producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerContext {
    pub run_id: Uuid,
    pub user_id: String,
    pub tz: CanonicalTz,
    pub now: DateTime<Utc>,
    pub lookback_days: u32,
}

impl ProducerContext {
    pub fn new(user_id: impl Into<String>, tz: CanonicalTz, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            user_id: user_id.into(),
            tz,
            now,
            lookback_days: 7,
        }
    }

    pub fn with_lookback_days(mut self, days: u32) -> Self {
        self.lookback_days = days;
        self
    }

    /// Inclusive `(start, end)` canonical dates of the vendor polling window.
    pub fn window(&self) -> (NaiveDate, NaiveDate) {
        let end = self.tz.today(&self.now);
        let start = end - chrono::Duration::days(i64::from(self.lookback_days));
        (start, end)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("{source_tag} is unavailable: {reason}")]
    Unavailable { source_tag: Source, reason: String },
    #[error("{source_tag} rejected the request: {message}")]
    Vendor { source_tag: Source, message: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AdapterError::Unavailable { .. })
    }
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

pub fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64().filter(|v| v.is_finite())
}

/// Integers, floats rounded to the nearest integer, and numeric strings.
pub fn json_i64(value: &JsonValue, path: &[&str]) -> Option<i64> {
    let found = json_at(value, path)?;
    if let Some(int) = found.as_i64() {
        return Some(int);
    }
    if let Some(float) = found.as_f64().filter(|v| v.is_finite()) {
        return Some(float.round() as i64);
    }
    found.as_str()?.trim().parse().ok()
}
