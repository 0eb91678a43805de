//! Parquet snapshot of the lake for offline analysis.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Duration, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use yuru_core::{CorrelationTable, Metric, RawRecord};
use yuru_storage::{canonical_json, fingerprint, FetchOrder, LakeQuery, RawDataLake};

use crate::correlation::correlate;

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub user_id: String,
    pub window_days: u32,
    pub exported_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `raw_records.parquet`, `correlation.parquet` and `manifest.json`
/// into `out_dir`.
pub async fn export_snapshot(
    lake: &RawDataLake,
    user_id: &str,
    days: u32,
    out_dir: &Path,
) -> Result<ExportManifest> {
    let exported_at = lake.now();
    let records = lake
        .scan(
            &LakeQuery::new()
                .user(user_id)
                .since(exported_at - Duration::days(i64::from(days)))
                .order(FetchOrder::Ascending),
        )
        .await
        .context("scanning lake for export")?;
    let table = correlate(lake, user_id, days)
        .await
        .context("assembling correlation for export")?;

    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let raw_path = out_dir.join("raw_records.parquet");
    let correlation_path = out_dir.join("correlation.parquet");
    write_raw_records_parquet(&raw_path, &records)?;
    write_correlation_parquet(&correlation_path, &table)?;

    let manifest = ExportManifest {
        schema_version: 1,
        user_id: user_id.to_string(),
        window_days: days,
        exported_at,
        files: vec![
            manifest_entry("raw_records", out_dir, &raw_path, records.len())?,
            manifest_entry("correlation", out_dir, &correlation_path, table.len())?,
        ],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(
        user_id,
        records = records.len(),
        correlation_rows = table.len(),
        dir = %out_dir.display(),
        "exported parquet snapshot"
    );
    Ok(manifest)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_raw_records_parquet(path: &Path, records: &[RawRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("user_id", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("fetched_at", DataType::Utf8, false),
        ArrowField::new("recorded_at", DataType::Utf8, false),
        ArrowField::new("payload", DataType::Utf8, false),
        ArrowField::new("fingerprint", DataType::Utf8, false),
    ]));

    let ids = Int64Array::from(records.iter().map(|r| r.id).collect::<Vec<_>>());
    let users = StringArray::from(records.iter().map(|r| r.user_id.as_str()).collect::<Vec<_>>());
    let sources = StringArray::from(records.iter().map(|r| r.source.as_str()).collect::<Vec<_>>());
    let categories = StringArray::from(records.iter().map(|r| r.category.as_str()).collect::<Vec<_>>());
    let fetched = StringArray::from(
        records
            .iter()
            .map(|r| r.fetched_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let recorded = StringArray::from(
        records
            .iter()
            .map(|r| r.recorded_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let payloads = StringArray::from(
        records
            .iter()
            .map(|r| canonical_json(&r.payload))
            .collect::<Vec<_>>(),
    );
    let fingerprints = StringArray::from(
        records
            .iter()
            .map(|r| fingerprint(&r.payload))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(users),
            Arc::new(sources),
            Arc::new(categories),
            Arc::new(fetched),
            Arc::new(recorded),
            Arc::new(payloads),
            Arc::new(fingerprints),
        ],
    )
    .context("building raw records batch")?;
    write_parquet(path, batch)
}

fn write_correlation_parquet(path: &Path, table: &CorrelationTable) -> Result<()> {
    let metrics: Vec<Metric> = table
        .columns
        .iter()
        .filter_map(|column| Metric::ALL.into_iter().find(|m| m.avg_column() == *column))
        .collect();
    let score_column = table.columns.get(1).map(String::as_str).unwrap_or("score");

    let mut fields = vec![
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new(score_column, DataType::Int64, false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            table
                .rows
                .iter()
                .map(|row| row.date.format("%Y-%m-%d").to_string())
                .collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            table.rows.iter().map(|row| row.score).collect::<Vec<_>>(),
        )),
    ];
    for metric in metrics {
        fields.push(ArrowField::new(metric.avg_column(), DataType::Float64, true));
        columns.push(Arc::new(Float64Array::from(
            table
                .rows
                .iter()
                .map(|row| row.average(metric))
                .collect::<Vec<_>>(),
        )));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building correlation batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use yuru_core::{CanonicalTz, FixedClock, Source};
    use yuru_storage::MemoryLake;

    #[tokio::test]
    async fn snapshot_writes_both_tables_and_a_manifest() {
        let now = DateTime::parse_from_rfc3339("2026-02-11T22:00:00Z").unwrap().with_timezone(&Utc);
        let lake = RawDataLake::new(Arc::new(MemoryLake::new()), CanonicalTz::default())
            .with_clock(Arc::new(FixedClock::new(now)));
        lake.ingest("u1", Source::SleepRing, "sleep", json!({"day": "2026-02-12", "score": 82}))
            .await;
        lake.ingest("u1", Source::IndoorSensor, "environment", json!({"temperature": 22.5, "CO2": 900}))
            .await;

        let dir = tempdir().unwrap();
        let manifest = export_snapshot(&lake, "u1", 7, dir.path()).await.unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "raw_records.parquet");
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[1].rows, 1);
        for file in &manifest.files {
            assert_eq!(file.sha256.len(), 64);
            assert!(file.bytes > 0);
            assert!(dir.path().join(&file.path).exists());
        }

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("manifest.json")).unwrap()).unwrap();
        assert_eq!(written["user_id"], "u1");
        assert_eq!(written["files"][1]["name"], "correlation");
    }

    #[tokio::test]
    async fn empty_lake_exports_empty_tables() {
        let lake = RawDataLake::new(Arc::new(MemoryLake::new()), CanonicalTz::default());
        let dir = tempdir().unwrap();
        let manifest = export_snapshot(&lake, "u1", 7, dir.path()).await.unwrap();
        assert!(manifest.files.iter().all(|f| f.rows == 0));
        assert!(dir.path().join("correlation.parquet").exists());
    }
}
