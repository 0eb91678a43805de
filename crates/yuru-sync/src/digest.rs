use std::collections::BTreeMap;

use chrono::NaiveDate;
use yuru_core::{RawRecord, Source};
use yuru_storage::{RawDataLake, StoreResult};

/// Markdown view of one day of raw records, grouped per source, for the
/// narrative generator.
pub fn render_digest(date: NaiveDate, grouped: &BTreeMap<Source, Vec<RawRecord>>) -> String {
    let mut out = format!("# Raw data for {}\n", date.format("%Y-%m-%d"));
    if grouped.values().all(Vec::is_empty) {
        out.push_str("\nNo records were fetched on this date.\n");
        return out;
    }

    for (source, records) in grouped {
        if records.is_empty() {
            continue;
        }
        out.push_str(&format!(
            "\n## {} ({} record{})\n",
            source.display_name(),
            records.len(),
            if records.len() == 1 { "" } else { "s" }
        ));
        for record in records {
            let payload = serde_json::to_string_pretty(&record.payload)
                .unwrap_or_else(|_| record.payload.to_string());
            out.push_str(&format!(
                "\n### {} @ {}\n\n```json\n{}\n```\n",
                record.category,
                record.fetched_at.format("%H:%M"),
                payload
            ));
        }
    }
    out
}

pub async fn daily_digest(lake: &RawDataLake, user_id: &str, date: NaiveDate) -> StoreResult<String> {
    let grouped = lake.raw_by_date(user_id, date).await?;
    Ok(render_digest(date, &grouped))
}
