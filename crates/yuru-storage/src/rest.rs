//! Lake backend speaking the PostgREST table protocol.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use yuru_core::{NewRawRecord, RawRecord, Source};

use crate::http::{HttpClientConfig, HttpFetcher};
use crate::{FetchOrder, LakeQuery, LakeStore, StoreError, StoreResult};

const TABLE_PATH: &str = "rest/v1/raw_data_lake";

#[derive(Debug, Clone)]
pub struct RestLakeConfig {
    pub base_url: String,
    pub api_key: String,
    pub http: HttpClientConfig,
}

#[derive(Debug)]
pub struct RestLake {
    http: HttpFetcher,
    table_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct InsertRow<'a> {
    user_id: &'a str,
    source: &'a str,
    category: &'a str,
    fetched_at: String,
    recorded_at: String,
    payload: &'a JsonValue,
}

#[derive(Debug, Deserialize)]
struct RestRow {
    id: i64,
    user_id: String,
    source: String,
    category: String,
    fetched_at: DateTime<FixedOffset>,
    recorded_at: DateTime<FixedOffset>,
    payload: JsonValue,
}

impl TryFrom<RestRow> for RawRecord {
    type Error = StoreError;

    fn try_from(row: RestRow) -> Result<Self, Self::Error> {
        let source = Source::from_str(&row.source)
            .map_err(|err| StoreError::MalformedRow(err.to_string()))?;
        Ok(RawRecord {
            id: row.id,
            user_id: row.user_id,
            source,
            category: row.category,
            fetched_at: row.fetched_at,
            recorded_at: row.recorded_at,
            payload: row.payload,
        })
    }
}

fn timestamp_param(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// PostgREST query string for a scan, in a fixed order.
fn scan_params(query: &LakeQuery) -> Vec<(&'static str, String)> {
    let mut params = vec![("select", "*".to_string())];
    if let Some(user_id) = &query.user_id {
        params.push(("user_id", format!("eq.{user_id}")));
    }
    if let Some(source) = query.source {
        params.push(("source", format!("in.({})", source.stored_tags().join(","))));
    }
    if let Some(category) = &query.category {
        params.push(("category", format!("eq.{category}")));
    }
    if let Some(from) = &query.fetched_from {
        params.push(("fetched_at", format!("gte.{}", timestamp_param(from))));
    }
    if let Some(until) = &query.fetched_until {
        params.push(("fetched_at", format!("lt.{}", timestamp_param(until))));
    }
    let order = match query.order {
        FetchOrder::Ascending => "fetched_at.asc,id.asc",
        FetchOrder::Descending => "fetched_at.desc,id.desc",
    };
    params.push(("order", order.to_string()));
    params.push(("limit", query.effective_limit().to_string()));
    params
}

impl RestLake {
    pub fn new(config: RestLakeConfig) -> anyhow::Result<Self> {
        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            http: HttpFetcher::new(config.http)?,
            table_url: format!("{base}/{TABLE_PATH}"),
            api_key: config.api_key,
        })
    }

    fn headers(&self) -> StoreResult<HeaderMap> {
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| StoreError::Unavailable("api key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| StoreError::Unavailable("api key is not a valid header value".into()))?;
        let mut headers = HeaderMap::new();
        headers.insert("apikey", key);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        Ok(headers)
    }
}

#[async_trait]
impl LakeStore for RestLake {
    fn backend_name(&self) -> &'static str {
        "rest"
    }

    async fn append(&self, record: NewRawRecord) -> StoreResult<RawRecord> {
        let headers = self.headers()?;
        let body = InsertRow {
            user_id: &record.user_id,
            source: record.source.as_str(),
            category: &record.category,
            fetched_at: record.fetched_at.to_rfc3339(),
            recorded_at: record.recorded_at.to_rfc3339(),
            payload: &record.payload,
        };
        let response = self
            .http
            .send("lake_insert", |client| {
                client
                    .post(&self.table_url)
                    .headers(headers.clone())
                    .header(CONTENT_TYPE, "application/json")
                    .header("Prefer", "return=representation")
                    .json(&body)
            })
            .await?;

        let mut rows: Vec<RestRow> = serde_json::from_slice(&response.body)?;
        match rows.pop() {
            Some(row) => RawRecord::try_from(row),
            None => Err(StoreError::MalformedRow(
                "insert returned no representation".into(),
            )),
        }
    }

    async fn scan(&self, query: &LakeQuery) -> StoreResult<Vec<RawRecord>> {
        let headers = self.headers()?;
        let params = scan_params(query);
        let response = self
            .http
            .send("lake_scan", |client| {
                client
                    .get(&self.table_url)
                    .headers(headers.clone())
                    .query(&params)
            })
            .await?;

        let rows: Vec<RestRow> = serde_json::from_slice(&response.body)?;
        rows.into_iter().map(RawRecord::try_from).collect()
    }
}
