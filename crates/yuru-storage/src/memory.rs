use async_trait::async_trait;
use tokio::sync::Mutex;
use yuru_core::{NewRawRecord, RawRecord};

use crate::{FetchOrder, LakeQuery, LakeStore, StoreResult};

/// In-process lake used by tests, fixture runs, and the `memory` backend.
#[derive(Debug, Default)]
pub struct MemoryLake {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: Vec<RawRecord>,
}

impl MemoryLake {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every row in insertion order.
    pub async fn snapshot(&self) -> Vec<RawRecord> {
        self.state.lock().await.rows.clone()
    }
}

#[async_trait]
impl LakeStore for MemoryLake {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, record: NewRawRecord) -> StoreResult<RawRecord> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let stored = record.into_record(state.next_id);
        state.rows.push(stored.clone());
        Ok(stored)
    }

    async fn scan(&self, query: &LakeQuery) -> StoreResult<Vec<RawRecord>> {
        let state = self.state.lock().await;
        let mut rows: Vec<RawRecord> = state
            .rows
            .iter()
            .filter(|row| query.matches(row))
            .cloned()
            .collect();
        // id breaks ties between rows fetched in the same instant
        rows.sort_by(|a, b| a.fetched_at.cmp(&b.fetched_at).then(a.id.cmp(&b.id)));
        if query.order == FetchOrder::Descending {
            rows.reverse();
        }
        rows.truncate(query.effective_limit());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use yuru_core::{CanonicalTz, DedupKey, Source};

    fn new_row(minutes: i64, payload: serde_json::Value) -> NewRawRecord {
        let tz = CanonicalTz::default();
        let at = tz.localize(&(Utc.with_ymd_and_hms(2026, 2, 11, 0, 0, 0).unwrap() + Duration::minutes(minutes)));
        NewRawRecord {
            user_id: "u1".into(),
            source: Source::IndoorSensor,
            category: "environment".into(),
            fetched_at: at,
            recorded_at: at,
            payload,
        }
    }

    #[tokio::test]
    async fn latest_for_key_returns_most_recent_fetch() {
        let lake = MemoryLake::new();
        lake.append(new_row(10, json!({"v": 2}))).await.unwrap();
        lake.append(new_row(0, json!({"v": 1}))).await.unwrap();

        let key = DedupKey::new("u1", Source::IndoorSensor, "environment");
        let latest = lake.latest_for_key(&key).await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"v": 2}));
        assert_eq!(latest.id, 1);

        let other = DedupKey::new("u2", Source::IndoorSensor, "environment");
        assert!(lake.latest_for_key(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_orders_and_limits() {
        let lake = MemoryLake::new();
        for minute in [5, 1, 3] {
            lake.append(new_row(minute, json!({"m": minute}))).await.unwrap();
        }
        let asc = lake
            .scan(&LakeQuery::new().order(FetchOrder::Ascending))
            .await
            .unwrap();
        let minutes: Vec<i64> = asc.iter().map(|r| r.payload["m"].as_i64().unwrap()).collect();
        assert_eq!(minutes, vec![1, 3, 5]);

        let newest = lake.scan(&LakeQuery::new().limit(2)).await.unwrap();
        let minutes: Vec<i64> = newest.iter().map(|r| r.payload["m"].as_i64().unwrap()).collect();
        assert_eq!(minutes, vec![5, 3]);
        assert_eq!(lake.len().await, 3);
    }
}
