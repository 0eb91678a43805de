//! Append-only raw data lake: payload fingerprinting, the ingestion gate, and
//! the storage backends behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use yuru_core::{DedupKey, NewRawRecord, RawRecord, Source};

pub mod fingerprint;
pub mod http;
pub mod lake;
pub mod memory;
pub mod postgres;
pub mod rest;

pub use fingerprint::{canonical_json, fingerprint, sha256_hex, strip_volatile, VOLATILE_KEYS};
pub use http::{BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};
pub use lake::{IngestOutcome, RawDataLake, DEFAULT_ROUND_TRIP_TIMEOUT};
pub use memory::MemoryLake;
pub use postgres::PgLake;
pub use rest::{RestLake, RestLakeConfig};

pub const CRATE_NAME: &str = "yuru-storage";

/// Upper bound on rows returned by one range scan.
pub const DEFAULT_SCAN_LIMIT: usize = 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Http(#[from] FetchError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage round trip timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed row: {0}")]
    MalformedRow(String),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchOrder {
    Ascending,
    #[default]
    Descending,
}

/// Filter for a single scan of the lake. Fetched-at bounds are half-open.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LakeQuery {
    pub user_id: Option<String>,
    pub source: Option<Source>,
    pub category: Option<String>,
    pub fetched_from: Option<DateTime<Utc>>,
    pub fetched_until: Option<DateTime<Utc>>,
    pub order: FetchOrder,
    pub limit: Option<usize>,
}

impl LakeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(key: &DedupKey) -> Self {
        Self::new()
            .user(key.user_id.clone())
            .source(key.source)
            .category(key.category.clone())
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.fetched_from = Some(from);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.fetched_until = Some(until);
        self
    }

    pub fn order(mut self, order: FetchOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_SCAN_LIMIT).min(DEFAULT_SCAN_LIMIT)
    }

    pub fn matches(&self, record: &RawRecord) -> bool {
        if let Some(user_id) = &self.user_id {
            if &record.user_id != user_id {
                return false;
            }
        }
        if let Some(source) = self.source {
            if record.source != source {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &record.category != category {
                return false;
            }
        }
        if let Some(from) = self.fetched_from {
            if record.fetched_at < from {
                return false;
            }
        }
        if let Some(until) = self.fetched_until {
            if record.fetched_at >= until {
                return false;
            }
        }
        true
    }
}

/// Storage seam of the lake. Backends only ever append; there is no update or
/// delete operation.
#[async_trait]
pub trait LakeStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Most recent record for the key by `fetched_at`.
    async fn latest_for_key(&self, key: &DedupKey) -> StoreResult<Option<RawRecord>> {
        let query = LakeQuery::for_key(key).order(FetchOrder::Descending).limit(1);
        Ok(self.scan(&query).await?.into_iter().next())
    }

    async fn append(&self, record: NewRawRecord) -> StoreResult<RawRecord>;

    async fn scan(&self, query: &LakeQuery) -> StoreResult<Vec<RawRecord>>;
}
