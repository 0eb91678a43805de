use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::info;
use yuru_core::{NewRawRecord, RawRecord, Source};

use crate::{FetchOrder, LakeQuery, LakeStore, StoreError, StoreResult};

const SELECT_COLUMNS: &str =
    "SELECT id, user_id, source, category, fetched_at, recorded_at, payload FROM raw_data_lake";

#[derive(Debug, Clone)]
pub struct PgLake {
    pool: PgPool,
}

impl PgLake {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("raw_data_lake migrations applied");
        Ok(())
    }
}

fn decode_row(row: &PgRow) -> StoreResult<RawRecord> {
    let source_tag: String = row.try_get("source")?;
    let source = Source::from_str(&source_tag)
        .map_err(|err| StoreError::MalformedRow(err.to_string()))?;
    let fetched_at: DateTime<Utc> = row.try_get("fetched_at")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;
    let payload: JsonValue = row.try_get("payload")?;

    Ok(RawRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        source,
        category: row.try_get("category")?,
        fetched_at: fetched_at.fixed_offset(),
        recorded_at: recorded_at.fixed_offset(),
        payload,
    })
}

fn clause(builder: &mut QueryBuilder<'_, Postgres>, first: &mut bool) {
    builder.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &LakeQuery) {
    let mut first = true;

    if let Some(user_id) = &query.user_id {
        clause(builder, &mut first);
        builder.push("user_id = ").push_bind(user_id.clone());
    }
    if let Some(source) = query.source {
        clause(builder, &mut first);
        builder
            .push("source = ANY(")
            .push_bind(source.stored_tags().to_vec())
            .push(")");
    }
    if let Some(category) = &query.category {
        clause(builder, &mut first);
        builder.push("category = ").push_bind(category.clone());
    }
    if let Some(from) = query.fetched_from {
        clause(builder, &mut first);
        builder.push("fetched_at >= ").push_bind(from);
    }
    if let Some(until) = query.fetched_until {
        clause(builder, &mut first);
        builder.push("fetched_at < ").push_bind(until);
    }
}

#[async_trait]
impl LakeStore for PgLake {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn append(&self, record: NewRawRecord) -> StoreResult<RawRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO raw_data_lake (user_id, source, category, fetched_at, recorded_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&record.user_id)
        .bind(record.source.as_str())
        .bind(&record.category)
        .bind(record.fetched_at.with_timezone(&Utc))
        .bind(record.recorded_at.with_timezone(&Utc))
        .bind(&record.payload)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        Ok(record.into_record(id))
    }

    async fn scan(&self, query: &LakeQuery) -> StoreResult<Vec<RawRecord>> {
        let mut builder = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        push_filters(&mut builder, query);
        builder.push(match query.order {
            FetchOrder::Ascending => " ORDER BY fetched_at ASC, id ASC",
            FetchOrder::Descending => " ORDER BY fetched_at DESC, id DESC",
        });
        builder
            .push(" LIMIT ")
            .push_bind(query.effective_limit() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}
