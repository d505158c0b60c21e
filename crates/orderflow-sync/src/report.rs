//! Per-run report bundle: markdown summary, JSON delta, Parquet snapshot and its manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::types::Date32Type;
use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use orderflow_core::CleanedRecord;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::RunSummary;

pub const SUMMARY_FILE: &str = "run_summary.md";
pub const DELTA_FILE: &str = "cleaned_delta.json";
pub const SNAPSHOT_FILE: &str = "online_order.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub reports_dir: PathBuf,
    pub manifest: PathBuf,
}

pub async fn write_reports(
    reports_root: &Path,
    summary: &RunSummary,
    records: &[CleanedRecord],
) -> Result<ReportPaths> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(SUMMARY_FILE), summary_markdown(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    let delta_json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "records": records,
    }))
    .context("serializing cleaned delta")?;
    fs::write(reports_dir.join(DELTA_FILE), delta_json)
        .await
        .with_context(|| format!("writing {DELTA_FILE}"))?;

    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let snapshot_path = snapshot_dir.join(SNAPSHOT_FILE);
    write_cleaned_parquet(&snapshot_path, records)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("online_order", &reports_dir, &snapshot_path, records.len())?],
    };
    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(ReportPaths {
        reports_dir,
        manifest: manifest_path,
    })
}

fn summary_markdown(summary: &RunSummary) -> String {
    let mut lines = vec![
        "# Online Order Sync".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Source: {}", summary.source),
        format!("- Dry run: {}", summary.dry_run),
        String::new(),
        "## Stages".to_string(),
        format!("- extracted rows: {}", summary.extracted_rows),
        format!(
            "- staged: {} new of {} incoming ({} already staged)",
            summary.staged.appended, summary.staged.incoming, summary.staged.already_staged
        ),
        format!(
            "- transformed: {} out of {} ({} duplicates, {} dropped for missing Cost/Sales, {} unparsable dates)",
            summary.transform.output_rows,
            summary.transform.input_rows,
            summary.transform.duplicates_removed,
            summary.transform.dropped_missing_measures,
            summary.transform.unparsable_dates
        ),
        format!(
            "- upserted: {} inserted, {} skipped on conflict",
            summary.upsert.inserted, summary.upsert.skipped
        ),
    ];
    if summary.transform.skipped_missing_order_date {
        lines.push("- transform skipped: staged batch had no Order_Date column".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}

fn write_cleaned_parquet(path: &Path, records: &[CleanedRecord]) -> Result<()> {
    let text_field = |name: &str| ArrowField::new(name, DataType::Utf8, false);
    let schema = Arc::new(Schema::new(vec![
        text_field("order_number"),
        text_field("state_code"),
        text_field("customer_name"),
        ArrowField::new("order_date", DataType::Date32, true),
        text_field("status"),
        text_field("product"),
        text_field("category"),
        text_field("brand"),
        ArrowField::new("cost", DataType::Float64, true),
        ArrowField::new("sales", DataType::Float64, true),
        ArrowField::new("quantity", DataType::Float64, false),
        ArrowField::new("total_cost", DataType::Float64, false),
        ArrowField::new("total_sales", DataType::Float64, false),
        text_field("assigned_supervisor"),
    ]));

    let text = |get: fn(&CleanedRecord) -> &str| -> ArrayRef {
        Arc::new(StringArray::from(records.iter().map(get).collect::<Vec<_>>()))
    };
    let number = |get: fn(&CleanedRecord) -> Option<f64>| -> ArrayRef {
        Arc::new(Float64Array::from(records.iter().map(get).collect::<Vec<_>>()))
    };
    let dates = Date32Array::from(
        records
            .iter()
            .map(|r| r.order_date.map(Date32Type::from_naive_date))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            text(|r| r.order_number.as_str()),
            text(|r| r.state_code.as_str()),
            text(|r| r.customer_name.as_str()),
            Arc::new(dates),
            text(|r| r.status.as_str()),
            text(|r| r.product.as_str()),
            text(|r| r.category.as_str()),
            text(|r| r.brand.as_str()),
            number(|r| r.cost),
            number(|r| r.sales),
            number(|r| Some(r.quantity)),
            number(|r| Some(r.total_cost)),
            number(|r| Some(r.total_sales)),
            text(|r| r.assigned_supervisor.as_str()),
        ],
    )
    .context("building online_order record batch")?;

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

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown digest of the `runs` most recent report directories, newest first.
pub fn report_recent_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let mut lines = vec!["# Online Order Sync Reports".to_string(), String::new()];
    if !reports_root.is_dir() {
        lines.push(format!("No runs recorded under `{}`.", reports_root.display()));
        return Ok(lines.join("\n"));
    }

    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(DELTA_FILE).is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let delta_path = dir.path().join(DELTA_FILE);
        let delta: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;

        let summary = delta.get("summary");
        let count = |section: &str, key: &str| {
            summary
                .and_then(|s| s.get(section))
                .and_then(|s| s.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let finished = summary
            .and_then(|s| s.get("finished_at"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- finished: {finished}"));
        lines.push(format!("- staged: {}", count("staged", "appended")));
        lines.push(format!("- cleaned: {}", count("transform", "output_rows")));
        lines.push(format!("- inserted: {}", count("upsert", "inserted")));
        lines.push(format!("- skipped on conflict: {}", count("upsert", "skipped")));
        let manifest_path = dir.path().join("snapshots").join(MANIFEST_FILE);
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StageCounts, UpsertReport};
    use crate::cleaner::TransformStats;
    use arrow_array::Array;
    use chrono::{NaiveDate, Utc};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn record(order_number: &str, date: Option<NaiveDate>) -> CleanedRecord {
        CleanedRecord {
            order_number: order_number.to_string(),
            state_code: "TX".to_string(),
            customer_name: "Unknown".to_string(),
            order_date: date,
            status: "Shipped".to_string(),
            product: "Lamp".to_string(),
            category: "Home".to_string(),
            brand: "Glow".to_string(),
            cost: Some(3.5),
            sales: None,
            quantity: 2.0,
            total_cost: 7.0,
            total_sales: 0.0,
            assigned_supervisor: "Unknown".to_string(),
        }
    }

    fn summary(records: usize) -> RunSummary {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            source: "fixture".to_string(),
            dry_run: true,
            extracted_rows: records,
            staged: StageCounts {
                incoming: records,
                already_staged: 0,
                appended: records as u64,
            },
            transform: TransformStats {
                input_rows: records,
                output_rows: records,
                ..TransformStats::default()
            },
            upsert: UpsertReport {
                attempted: records,
                inserted: records as u64,
                skipped: 0,
            },
            reports_dir: None,
        }
    }

    #[tokio::test]
    async fn writes_summary_delta_snapshot_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let records = vec![
            record("1001", NaiveDate::from_ymd_opt(2024, 1, 31)),
            record("1002", None),
        ];
        let summary = summary(records.len());

        let paths = write_reports(dir.path(), &summary, &records).await.expect("reports");

        assert!(paths.reports_dir.join(SUMMARY_FILE).is_file());
        let delta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(paths.reports_dir.join(DELTA_FILE)).expect("delta"),
        )
        .expect("json");
        assert_eq!(delta["records"][0]["Order_Number"], "1001");
        assert_eq!(delta["records"][0]["Order_Date"], "2024-01-31");
        assert!(delta["records"][1]["Order_Date"].is_null());

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&paths.manifest).expect("manifest")).expect("json");
        let entry = &manifest.files[0];
        assert_eq!(entry.rows, 2);
        let snapshot = std::fs::read(paths.reports_dir.join(&entry.path)).expect("snapshot");
        assert_eq!(entry.sha256, hex::encode(Sha256::digest(&snapshot)));

        let file = File::open(paths.reports_dir.join(&entry.path)).expect("open parquet");
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader")
            .build()
            .expect("build");
        let batches: Vec<RecordBatch> = reader.map(|b| b.expect("batch")).collect();
        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        assert_eq!(rows, 2);

        let dates = batches[0]
            .column_by_name("order_date")
            .expect("order_date column")
            .as_any()
            .downcast_ref::<Date32Array>()
            .expect("date32");
        // 2024-01-31 is 19753 days after 1970-01-01
        assert_eq!(dates.value(0), 19_753);
        assert!(dates.is_null(1));
    }

    #[tokio::test]
    async fn recent_runs_digest_lists_written_runs() {
        let dir = tempdir().expect("tempdir");
        let summary = summary(1);
        write_reports(dir.path(), &summary, &[record("7", None)])
            .await
            .expect("reports");

        let text = report_recent_runs(dir.path(), 5).expect("digest");
        assert!(text.contains(&summary.run_id.to_string()));
        assert!(text.contains("- inserted: 1"));
    }

    #[test]
    fn missing_reports_root_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let text = report_recent_runs(&dir.path().join("nope"), 3).expect("digest");
        assert!(text.contains("No runs recorded"));
    }
}
