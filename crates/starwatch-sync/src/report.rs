//! Run report exports: JSON report, markdown brief, parquet snapshots with a sha256
//! manifest, and the markdown listing of past runs.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use starwatch_core::{ChangeEvent, DeliveryStatus, TrendSummary};
use starwatch_storage::sha256_hex;
use tokio::fs;
use tracing::{info, warn};

use crate::RunReport;

pub const REPORT_FILE: &str = "run_report.json";
pub const BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write every export for `report` under `<reports_root>/<run_id>/` and return that directory.
pub async fn write_run_reports(reports_root: &Path, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    fs::write(run_dir.join(BRIEF_FILE), render_brief(report))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(run_dir.join(REPORT_FILE), json)
        .await
        .with_context(|| format!("writing {REPORT_FILE}"))?;

    let manifest_path = export_parquet_snapshots(&run_dir, report).await?;
    info!(
        run_id = %report.run_id,
        dir = %run_dir.display(),
        manifest = %manifest_path.display(),
        "run reports written"
    );
    Ok(run_dir)
}

async fn export_parquet_snapshots(run_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let changes = report.changes.clone();
    let trends = report.trends.clone();
    let run_dir_owned = run_dir.to_path_buf();
    let parquet_dir = snapshot_dir.clone();
    let files = tokio::task::spawn_blocking(move || -> Result<Vec<ManifestFile>> {
        let changes_path = parquet_dir.join("changes.parquet");
        let trends_path = parquet_dir.join("trends.parquet");
        write_changes_parquet(&changes_path, &changes)?;
        write_trends_parquet(&trends_path, &trends)?;
        Ok(vec![
            manifest_entry("changes", &run_dir_owned, &changes_path)?,
            manifest_entry("trends", &run_dir_owned, &trends_path)?,
        ])
    })
    .await
    .context("parquet export task failed")??;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
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

fn utf8<'a>(values: impl Iterator<Item = &'a str>) -> StringArray {
    StringArray::from(values.map(Some).collect::<Vec<_>>())
}

fn owned_utf8(values: impl Iterator<Item = String>) -> StringArray {
    StringArray::from(values.map(Some).collect::<Vec<_>>())
}

fn write_changes_parquet(path: &Path, changes: &[ChangeEvent]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("event_id", DataType::Utf8, false),
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("entity_label", DataType::Utf8, false),
        ArrowField::new("metric", DataType::Utf8, false),
        ArrowField::new("previous_value", DataType::UInt32, false),
        ArrowField::new("current_value", DataType::UInt32, false),
        ArrowField::new("direction", DataType::Utf8, false),
        ArrowField::new("previous_as_of", DataType::Utf8, false),
        ArrowField::new("current_as_of", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(owned_utf8(changes.iter().map(|c| c.id.to_string()))),
            Arc::new(utf8(changes.iter().map(|c| c.entity_id.as_str()))),
            Arc::new(utf8(changes.iter().map(|c| c.entity_label.as_str()))),
            Arc::new(utf8(changes.iter().map(|c| c.metric.as_str()))),
            Arc::new(UInt32Array::from(
                changes.iter().map(|c| u32::from(c.previous_value)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                changes.iter().map(|c| u32::from(c.current_value)).collect::<Vec<_>>(),
            )),
            Arc::new(owned_utf8(changes.iter().map(|c| format!("{:?}", c.direction).to_ascii_lowercase()))),
            Arc::new(owned_utf8(changes.iter().map(|c| c.previous_as_of.to_string()))),
            Arc::new(owned_utf8(changes.iter().map(|c| c.current_as_of.to_string()))),
        ],
    )
    .context("building changes record batch")?;
    write_parquet(path, batch)
}

fn write_trends_parquet(path: &Path, trends: &[TrendSummary]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("entity_id", DataType::Utf8, false),
        ArrowField::new("metric", DataType::Utf8, false),
        ArrowField::new("window_start", DataType::Utf8, false),
        ArrowField::new("window_end", DataType::Utf8, false),
        ArrowField::new("count", DataType::UInt32, false),
        ArrowField::new("rated_count", DataType::UInt32, false),
        ArrowField::new("min", DataType::UInt32, true),
        ArrowField::new("max", DataType::UInt32, true),
        ArrowField::new("mean", DataType::Float64, true),
        ArrowField::new("current", DataType::Utf8, false),
        ArrowField::new("current_as_of", DataType::Utf8, false),
    ]));

    let as_u32 = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(utf8(trends.iter().map(|t| t.entity_id.as_str()))),
            Arc::new(utf8(trends.iter().map(|t| t.metric.as_str()))),
            Arc::new(owned_utf8(trends.iter().map(|t| t.window.start.to_string()))),
            Arc::new(owned_utf8(trends.iter().map(|t| t.window.end.to_string()))),
            Arc::new(UInt32Array::from(trends.iter().map(|t| as_u32(t.count)).collect::<Vec<_>>())),
            Arc::new(UInt32Array::from(
                trends.iter().map(|t| as_u32(t.rated_count)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                trends.iter().map(|t| t.min.map(u32::from)).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                trends.iter().map(|t| t.max.map(u32::from)).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(trends.iter().map(|t| t.mean).collect::<Vec<_>>())),
            Arc::new(owned_utf8(trends.iter().map(|t| t.current.to_string()))),
            Arc::new(owned_utf8(trends.iter().map(|t| t.current_as_of.to_string()))),
        ],
    )
    .context("building trends record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

fn format_mean(mean: Option<f64>) -> String {
    mean.map(|m| format!("{m:.2}")).unwrap_or_else(|| "-".to_string())
}

fn format_star(value: Option<u8>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Markdown table with one row per entity/metric summary.
pub fn render_trend_table(trends: &[TrendSummary]) -> String {
    let mut out = String::from(
        "| Entity | Metric | Points | Rated | Min | Max | Mean | Current |\n|---|---|---|---|---|---|---|---|\n",
    );
    for trend in trends {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} | {} |\n",
            trend.entity_id,
            trend.metric.label(),
            trend.count,
            trend.rated_count,
            format_star(trend.min),
            format_star(trend.max),
            format_mean(trend.mean),
            trend.current,
        ));
    }
    out
}

/// Console/markdown rendering of a finished run.
pub fn render_brief(report: &RunReport) -> String {
    let counts = &report.counts;
    let mut out = format!(
        "# CMS Star Rating Run\n\n\
         - Run ID: `{}`\n\
         - Started: {}\n\
         - Finished: {}\n\
         - Source: {} ({})\n\
         - Snapshot as of: {}\n\
         - Entities processed: {}\n\
         - History: {} inserted, {} overwritten, {} unchanged\n\
         - Rejected rows: {}\n\
         - Changes detected: {}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.source_id,
        report.snapshot_uri,
        report.as_of,
        counts.entities_processed,
        counts.merge.inserted,
        counts.merge.overwritten,
        counts.merge.unchanged,
        counts.rejected_rows,
        counts.changes_detected,
    );

    out.push_str("\n## Changes\n");
    if report.changes.is_empty() {
        out.push_str("No rating changes.\n");
    }
    for change in &report.changes {
        out.push_str(&format!("- {}: {}\n", change.entity_label, change.summary()));
    }

    if !report.trends.is_empty() {
        out.push_str("\n## Trends\n\n");
        out.push_str(&render_trend_table(&report.trends));
    }

    if !report.notifications.is_empty() {
        out.push_str("\n## Notifications\n");
        for outcome in &report.notifications {
            let detail = match &outcome.status {
                DeliveryStatus::Delivered => String::new(),
                DeliveryStatus::Failed(reason) | DeliveryStatus::Skipped(reason) => {
                    format!(" ({reason})")
                }
            };
            out.push_str(&format!(
                "- {}: {} after {} attempt(s){}\n",
                outcome.channel,
                outcome.status.label(),
                outcome.attempts,
                detail
            ));
        }
    }

    if !report.rejected.is_empty() {
        out.push_str("\n## Rejected Rows\n");
        for row in &report.rejected {
            out.push_str(&format!(
                "- row {} ({}): {}\n",
                row.row_number,
                row.raw_entity_id.as_deref().unwrap_or("no id"),
                row.reason
            ));
        }
    }

    if !report.warnings.is_empty() {
        out.push_str("\n## Warnings\n");
        for warning in &report.warnings {
            out.push_str(&format!("- {warning}\n"));
        }
    }
    out
}

/// Markdown summary of the `count` most recent runs found under `reports_root`.
pub fn report_runs_markdown(reports_root: &Path, count: usize) -> Result<String> {
    let mut reports = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
        {
            let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
            let report_path = entry.path().join(REPORT_FILE);
            if !report_path.is_file() {
                continue;
            }
            let parsed = std::fs::read_to_string(&report_path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<RunReport>(&text).map_err(Into::into));
            match parsed {
                Ok(report) => reports.push((entry.path(), report)),
                Err(err) => warn!(path = %report_path.display(), error = %err, "skipping unreadable run report"),
            }
        }
    }
    reports.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# CMS Star Rating Runs".to_string(), String::new()];
    if reports.is_empty() {
        lines.push("No runs recorded.".to_string());
    }
    for (dir, report) in reports.into_iter().take(count.max(1)) {
        let delivered = report
            .notifications
            .iter()
            .filter(|n| n.status == DeliveryStatus::Delivered)
            .count();
        let failed = report
            .notifications
            .iter()
            .filter(|n| matches!(n.status, DeliveryStatus::Failed(_)))
            .count();
        lines.push(format!("## Run `{}`", report.run_id));
        lines.push(format!("- started: {}", report.started_at));
        lines.push(format!("- snapshot as of: {}", report.as_of));
        lines.push(format!("- entities: {}", report.counts.entities_processed));
        lines.push(format!("- changes: {}", report.counts.changes_detected));
        lines.push(format!("- rejected rows: {}", report.counts.rejected_rows));
        lines.push(format!("- notifications: {delivered} delivered, {failed} failed"));
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
