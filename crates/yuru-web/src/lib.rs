//! Axum JSON read API over the raw data lake.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use yuru_core::{CorrelationTable, Metric};
use yuru_storage::{RawDataLake, StoreError};
use yuru_sync::{arrivals, correlate, daily_digest, open_lake, SyncConfig};

pub const CRATE_NAME: &str = "yuru-web";

const DEFAULT_RECENT_LIMIT: usize = 50;
const DEFAULT_ARRIVAL_DAYS: u32 = 7;
const DEFAULT_CORRELATION_DAYS: u32 = 14;

#[derive(Clone)]
pub struct AppState {
    pub lake: RawDataLake,
    pub user_id: String,
}

impl AppState {
    pub fn new(lake: RawDataLake, user_id: impl Into<String>) -> Self {
        Self {
            lake,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RecentQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WindowQuery {
    days: Option<u32>,
    user_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/raw/recent", get(recent_handler))
        .route("/api/raw/by-date/{date}", get(by_date_handler))
        .route("/api/raw/by-date/{date}/digest", get(digest_handler))
        .route("/api/arrivals", get(arrivals_handler))
        .route("/api/correlation", get(correlation_handler))
        .route("/api/correlation/chart", get(correlation_chart_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, backend = state.lake.backend_name(), "serving read api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let lake = open_lake(&config).await?;
    serve(AppState::new(lake, config.user_id.clone()), config.web_port).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "backend": state.lake.backend_name(),
        "tz": state.lake.tz().offset().to_string(),
    }))
    .into_response()
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT).max(1);
    match state.lake.recent_raw(limit).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => store_error(err),
    }
}

async fn by_date_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let Some(date) = parse_date(&date) else {
        return bad_date(&date);
    };
    let user_id = query.user_id.as_deref().unwrap_or(&state.user_id);
    match state.lake.raw_by_date(user_id, date).await {
        Ok(grouped) => Json(grouped).into_response(),
        Err(err) => store_error(err),
    }
}

async fn digest_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(date): AxumPath<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let Some(date) = parse_date(&date) else {
        return bad_date(&date);
    };
    let user_id = query.user_id.as_deref().unwrap_or(&state.user_id);
    match daily_digest(&state.lake, user_id, date).await {
        Ok(markdown) => (
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            markdown,
        )
            .into_response(),
        Err(err) => store_error(err),
    }
}

async fn arrivals_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_ARRIVAL_DAYS);
    let user_id = query.user_id.as_deref().unwrap_or(&state.user_id);
    match arrivals(&state.lake, user_id, days).await {
        Ok(grid) => Json(grid).into_response(),
        Err(err) => store_error(err),
    }
}

async fn correlation_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_CORRELATION_DAYS);
    let user_id = query.user_id.as_deref().unwrap_or(&state.user_id);
    match correlate(&state.lake, user_id, days).await {
        Ok(table) => Json(table).into_response(),
        Err(err) => store_error(err),
    }
}

async fn correlation_chart_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WindowQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_CORRELATION_DAYS);
    let user_id = query.user_id.as_deref().unwrap_or(&state.user_id);
    match correlate(&state.lake, user_id, days).await {
        Ok(table) => Json(correlation_chart(&table)).into_response(),
        Err(err) => store_error(err),
    }
}

/// Plotly figure: score bars with CO2 on a secondary axis.
fn correlation_chart(table: &CorrelationTable) -> serde_json::Value {
    let dates: Vec<String> = table
        .rows
        .iter()
        .map(|row| row.date.format("%Y-%m-%d").to_string())
        .collect();
    let scores: Vec<i64> = table.rows.iter().map(|row| row.score).collect();
    let co2: Vec<Option<f64>> = table.rows.iter().map(|row| row.average(Metric::Co2)).collect();
    let score_name = table.columns.get(1).cloned().unwrap_or_else(|| "score".into());

    json!({
        "data": [
            {
                "type": "bar",
                "name": score_name,
                "x": dates,
                "y": scores,
                "marker": {"color": "#6366f1"}
            },
            {
                "type": "scatter",
                "mode": "lines+markers",
                "name": Metric::Co2.avg_column(),
                "x": dates,
                "y": co2,
                "yaxis": "y2",
                "connectgaps": false,
                "line": {"color": "#f97316"}
            }
        ],
        "layout": {
            "title": "Sleep score vs indoor CO2",
            "yaxis": {"title": score_name},
            "yaxis2": {"title": "CO2 (ppm)", "overlaying": "y", "side": "right"},
            "paper_bgcolor": "#ffffff",
            "plot_bgcolor": "#f8fafc"
        }
    })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn bad_date(raw: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("expected a YYYY-MM-DD date, got `{raw}`")})),
    )
        .into_response()
}

fn store_error(err: StoreError) -> Response {
    warn!(error = %err, "lake read failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use yuru_core::{CanonicalTz, FixedClock, NewRawRecord, RawRecord, Source};
    use yuru_storage::{LakeQuery, LakeStore, MemoryLake, StoreResult};

    async fn seeded_state() -> AppState {
        let now = DateTime::parse_from_rfc3339("2026-02-10T22:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let lake = RawDataLake::new(Arc::new(MemoryLake::new()), CanonicalTz::default())
            .with_clock(Arc::new(FixedClock::new(now)));
        lake.ingest("u1", Source::SleepRing, "sleep", json!({"day": "2026-02-11", "score": 82}))
            .await;
        lake.ingest(
            "u1",
            Source::IndoorSensor,
            "environment",
            json!({"temperature": 22.5, "humidity": 48, "CO2": 900}),
        )
        .await;
        AppState::new(lake, "u1")
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = get(app, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_backend() {
        let (status, body) = get_json(app(seeded_state().await), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");
    }

    #[tokio::test]
    async fn recent_is_newest_first_and_limited() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/api/raw/recent").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(body[0]["source"], "indoor-sensor");

        let (_, body) = get_json(app, "/api/raw/recent?limit=1").await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn by_date_groups_by_source_and_rejects_bad_dates() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/api/raw/by-date/2026-02-11").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sleep-ring"][0]["payload"]["score"], 82);
        assert_eq!(body["indoor-sensor"].as_array().unwrap().len(), 1);

        let (status, _) = get_json(app, "/api/raw/by-date/11-02-2026").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn digest_is_markdown() {
        let (status, body) = get(app(seeded_state().await), "/api/raw/by-date/2026-02-11/digest").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("# Raw data for 2026-02-11"));
    }

    #[tokio::test]
    async fn arrivals_grid_covers_window() {
        let (status, body) = get_json(app(seeded_state().await), "/api/arrivals?days=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["dates"].as_array().unwrap().len(), 3);
        assert_eq!(body["cells"].as_array().unwrap().len(), 3 * Source::ALL.len());
    }

    #[tokio::test]
    async fn correlation_and_chart_share_rows() {
        let app = app(seeded_state().await);
        let (status, table) = get_json(app.clone(), "/api/correlation").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(table["columns"][1], "sleep_score");
        assert_eq!(table["rows"][0]["score"], 82);
        assert_eq!(table["rows"][0]["averages"]["co2"], 900.0);

        let (status, chart) = get_json(app, "/api/correlation/chart").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(chart["data"][0]["y"][0], 82);
        assert_eq!(chart["data"][1]["yaxis"], "y2");
    }

    struct DownStore;

    #[async_trait]
    impl LakeStore for DownStore {
        fn backend_name(&self) -> &'static str {
            "down"
        }

        async fn append(&self, _record: NewRawRecord) -> StoreResult<RawRecord> {
            Err(StoreError::Unavailable("maintenance".into()))
        }

        async fn scan(&self, _query: &LakeQuery) -> StoreResult<Vec<RawRecord>> {
            Err(StoreError::Unavailable("maintenance".into()))
        }
    }

    #[tokio::test]
    async fn storage_outage_is_service_unavailable() {
        let lake = RawDataLake::new(Arc::new(DownStore), CanonicalTz::default());
        let (status, body) = get_json(app(AppState::new(lake, "u1")), "/api/arrivals").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("maintenance"));
    }
}
