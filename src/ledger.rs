//! Per-run audit artifacts.
//!
//! Each run gets its own `run_<YYYYmmdd_HHMMSS>` directory holding the
//! failed-queries table, the matched and rejected records, the filter
//! script handed to the anonymizer and a JSON summary.

use crate::filter::FilterScript;
use crate::planner::{InputRow, QueryMode};
use crate::reconcile::{AcceptedRecord, FailedRow, RejectedCandidate};
use crate::run::RunReport;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const FAILED_QUERIES_FILE: &str = "failed_queries.csv";
pub const MATCHED_RESULTS_FILE: &str = "matched_results.json";
pub const REJECTED_CANDIDATES_FILE: &str = "rejected_candidates.json";
pub const FILTER_SCRIPT_FILE: &str = "filter.script";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: QueryMode,
    pub input_rows: usize,
    pub queried_rows: usize,
    pub fallback_queries: usize,
    pub accepted_rows: usize,
    pub accepted_records: usize,
    pub rejected_candidates: usize,
    pub failed_rows: usize,
    pub retrieval_targets: Vec<String>,
    pub filter_is_identity: bool,
}

#[derive(Debug, Clone)]
pub struct RunLedger {
    run_dir: PathBuf,
}

impl RunLedger {
    pub fn create<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        Self::create_at(output_dir, Utc::now())
    }

    /// Creates the run directory for `started_at`, adding a numeric suffix
    /// when a run from the same second already exists.
    pub fn create_at<P: AsRef<Path>>(output_dir: P, started_at: DateTime<Utc>) -> Result<Self> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir).with_context(|| {
            format!("Failed to create output directory: {}", output_dir.display())
        })?;

        let base = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
        let mut run_dir = output_dir.join(&base);
        let mut suffix = 1;
        while run_dir.exists() {
            suffix += 1;
            run_dir = output_dir.join(format!("{base}_{suffix}"));
        }

        fs::create_dir(&run_dir)
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;
        log::info!("Recording run artifacts in {}", run_dir.display());

        Ok(Self { run_dir })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Writes every artifact for a finished run.
    pub fn record(&self, report: &RunReport, rows: &[InputRow]) -> Result<()> {
        self.write_filter_script(&report.script)?;
        self.write_failed_queries(report.plan.mode, rows, &report.result.failed)?;
        self.write_matched_results(&report.result.accepted)?;
        self.write_rejected_candidates(&report.result.rejected)?;
        self.write_summary(&report.summary())?;
        Ok(())
    }

    pub fn write_filter_script(&self, script: &FilterScript) -> Result<PathBuf> {
        self.write_file(FILTER_SCRIPT_FILE, format!("{script}\n"))
    }

    pub fn write_failed_queries(
        &self,
        mode: QueryMode,
        rows: &[InputRow],
        failed: &[FailedRow],
    ) -> Result<PathBuf> {
        let mut out = String::new();
        push_csv_line(&mut out, failed_queries_header(mode));

        for failure in failed {
            let row = rows.get(failure.row_index).cloned().unwrap_or_default();
            let mut fields = vec![failure.row_index.to_string()];
            fields.extend(input_columns(mode, &row));
            fields.push(failure.reason.to_string());
            push_csv_line(&mut out, &fields);
        }

        if !failed.is_empty() {
            log::warn!("{} rows failed, see {}", failed.len(), FAILED_QUERIES_FILE);
        }
        self.write_file(FAILED_QUERIES_FILE, out)
    }

    pub fn write_matched_results(&self, accepted: &[AcceptedRecord]) -> Result<PathBuf> {
        self.write_json(MATCHED_RESULTS_FILE, &accepted)
    }

    pub fn write_rejected_candidates(&self, rejected: &[RejectedCandidate]) -> Result<PathBuf> {
        self.write_json(REJECTED_CANDIDATES_FILE, &rejected)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        self.write_json(SUMMARY_FILE, summary)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let json = serde_json::to_string_pretty(value)
            .with_context(|| format!("Failed to serialize {name}"))?;
        self.write_file(name, json)
    }

    fn write_file(&self, name: &str, content: String) -> Result<PathBuf> {
        let path = self.run_dir.join(name);
        fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        log::debug!("Wrote {}", path.display());
        Ok(path)
    }
}

fn failed_queries_header(mode: QueryMode) -> &'static [&'static str] {
    match mode {
        QueryMode::AccessionNumber => &["Row Index", "Accession Number", "MRN", "Date", "Failure Reason"],
        QueryMode::MrnDate => &["Row Index", "MRN", "Date", "Failure Reason"],
        QueryMode::DateRange => &["Row Index", "Start Date", "End Date", "Failure Reason"],
    }
}

fn input_columns(mode: QueryMode, row: &InputRow) -> Vec<String> {
    let text = |v: &Option<String>| v.clone().unwrap_or_default();
    match mode {
        QueryMode::AccessionNumber => vec![
            text(&row.accession_number),
            text(&row.patient_id),
            text(&row.study_date),
        ],
        QueryMode::MrnDate => vec![text(&row.patient_id), text(&row.study_date)],
        QueryMode::DateRange => vec![text(&row.start_date), text(&row.end_date)],
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn push_csv_line<S: AsRef<str>>(out: &mut String, fields: &[S]) {
    let line: Vec<String> = fields.iter().map(|f| csv_field(f.as_ref())).collect();
    out.push_str(&line.join(","));
    out.push('\n');
}
