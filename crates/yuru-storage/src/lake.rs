//! The ingestion gate and the read entry points over a [`LakeStore`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, info_span, warn, Instrument};
use yuru_core::time::resolve_recorded_at_with_hint;
use yuru_core::{CanonicalTz, Clock, DedupKey, Harvest, NewRawRecord, RawRecord, Source, SystemClock};

use crate::fingerprint::fingerprint;
use crate::{FetchOrder, LakeQuery, LakeStore, StoreError, StoreResult};

pub const DEFAULT_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum IngestOutcome {
    Inserted(RawRecord),
    /// Fingerprint matched the latest stored record for the key.
    Skipped,
    Failed(StoreError),
}

impl IngestOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, IngestOutcome::Inserted(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, IngestOutcome::Skipped)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, IngestOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Inserted(_) => "inserted",
            IngestOutcome::Skipped => "skipped",
            IngestOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Clone)]
pub struct RawDataLake {
    store: Arc<dyn LakeStore>,
    clock: Arc<dyn Clock>,
    tz: CanonicalTz,
    round_trip_timeout: Duration,
}

impl std::fmt::Debug for RawDataLake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawDataLake")
            .field("backend", &self.store.backend_name())
            .field("tz", &self.tz)
            .field("round_trip_timeout", &self.round_trip_timeout)
            .finish()
    }
}

impl RawDataLake {
    pub fn new(store: Arc<dyn LakeStore>, tz: CanonicalTz) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            tz,
            round_trip_timeout: DEFAULT_ROUND_TRIP_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = timeout;
        self
    }

    pub fn tz(&self) -> CanonicalTz {
        self.tz
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    async fn bounded<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.round_trip_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.round_trip_timeout)),
        }
    }

    /// Appends `payload` unless it fingerprints the same as the latest record
    /// for its key. Never fails: storage errors come back as
    /// [`IngestOutcome::Failed`].
    pub async fn ingest(
        &self,
        user_id: &str,
        source: Source,
        category: &str,
        payload: JsonValue,
    ) -> IngestOutcome {
        self.ingest_harvest(Harvest::new(user_id, source, category, payload))
            .await
    }

    pub async fn ingest_harvest(&self, harvest: Harvest) -> IngestOutcome {
        let span = info_span!(
            "ingest",
            user_id = %harvest.user_id,
            source = %harvest.source,
            category = %harvest.category
        );
        async move {
            match self.try_ingest(harvest).await {
                Ok(Some(record)) => {
                    info!(id = record.id, recorded_at = %record.recorded_at, "inserted raw record");
                    IngestOutcome::Inserted(record)
                }
                Ok(None) => {
                    debug!("payload unchanged since last fetch, skipped");
                    IngestOutcome::Skipped
                }
                Err(err) => {
                    warn!(error = %err, "ingestion abandoned for this record");
                    IngestOutcome::Failed(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// `Ok(None)` means skipped as a duplicate of the latest stored record.
    pub async fn try_ingest(&self, harvest: Harvest) -> StoreResult<Option<RawRecord>> {
        let key = harvest.dedup_key();
        let new_fp = fingerprint(&harvest.payload);

        let latest = self.bounded(self.store.latest_for_key(&key)).await?;
        if let Some(latest) = latest {
            if fingerprint(&latest.payload) == new_fp {
                return Ok(None);
            }
        }

        let now = self.clock.now();
        let recorded_at = resolve_recorded_at_with_hint(
            &harvest.payload,
            harvest.recorded_hint.as_deref(),
            now,
            self.tz,
        );
        let record = NewRawRecord {
            user_id: harvest.user_id,
            source: harvest.source,
            category: harvest.category,
            fetched_at: self.tz.localize(&now),
            recorded_at,
            payload: harvest.payload,
        };
        let stored = self.bounded(self.store.append(record)).await?;
        Ok(Some(stored))
    }

    pub async fn latest_for_key(&self, key: &DedupKey) -> StoreResult<Option<RawRecord>> {
        self.bounded(self.store.latest_for_key(key)).await
    }

    /// Single bounded range scan. Rows come back in the canonical timezone.
    ///
    /// The row cap always keeps the newest rows: the backend is asked for a
    /// newest-first page and ascending scans reverse it here.
    pub async fn scan(&self, query: &LakeQuery) -> StoreResult<Vec<RawRecord>> {
        let newest_first = query.clone().order(FetchOrder::Descending);
        let mut rows = self.bounded(self.store.scan(&newest_first)).await?;
        if query.limit.is_none() && rows.len() >= newest_first.effective_limit() {
            warn!(
                rows = rows.len(),
                "scan hit the row cap, older records in the window were dropped"
            );
        }
        if query.order == FetchOrder::Ascending {
            rows.reverse();
        }
        Ok(rows.into_iter().map(|row| self.localize_record(row)).collect())
    }

    /// Most recent records across every user and source, newest first.
    pub async fn recent_raw(&self, limit: usize) -> StoreResult<Vec<RawRecord>> {
        self.scan(&LakeQuery::new().order(FetchOrder::Descending).limit(limit))
            .await
    }

    /// Records fetched on one canonical calendar date, grouped by source in
    /// fetch order.
    pub async fn raw_by_date(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> StoreResult<BTreeMap<Source, Vec<RawRecord>>> {
        let (start, end) = self.tz.day_bounds(date);
        let query = LakeQuery::new()
            .user(user_id)
            .since(start.with_timezone(&Utc))
            .until(end.with_timezone(&Utc))
            .order(FetchOrder::Ascending);
        let mut grouped: BTreeMap<Source, Vec<RawRecord>> = BTreeMap::new();
        for record in self.scan(&query).await? {
            grouped.entry(record.source).or_default().push(record);
        }
        Ok(grouped)
    }

    fn localize_record(&self, mut record: RawRecord) -> RawRecord {
        record.fetched_at = self.tz.localize(&record.fetched_at);
        record.recorded_at = self.tz.localize(&record.recorded_at);
        record
    }
}
