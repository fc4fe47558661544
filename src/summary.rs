use std::fmt::Write;
use std::path::Path;

use chrono::NaiveDate;

use crate::models::{ChurnReportCsvRow, ChurnRiskReport};

/// Outcome of a (possibly multi-date) report invocation.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub report: String,
    pub academy_id: Option<i64>,
    pub dry_run: bool,
    pub dates: Vec<NaiveDate>,
    pub generated: usize,
    pub errors: Vec<String>,
}

impl RunSummary {
    pub fn new(report: &str, academy_id: Option<i64>, dry_run: bool) -> Self {
        Self {
            report: report.to_string(),
            academy_id,
            dry_run,
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, date: NaiveDate, rows: usize) {
        self.dates.push(date);
        self.generated += rows;
    }

    pub fn record_failure(&mut self, date: NaiveDate, error: &dyn std::fmt::Display) {
        self.dates.push(date);
        self.errors.push(format!("{date}: {error}"));
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub fn build_summary(summary: &RunSummary) -> String {
    let mut output = String::new();
    let scope = summary
        .academy_id
        .map(|id| format!("academy {id}"))
        .unwrap_or_else(|| "all academies".to_string());
    let verb = if summary.dry_run {
        "would generate"
    } else {
        "generated"
    };

    let _ = writeln!(output, "# {} report summary", summary.report);
    let _ = writeln!(
        output,
        "Scope: {scope}{}",
        if summary.dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(output, "Dates processed: {}", summary.dates.len());
    if let (Some(first), Some(last)) = (summary.dates.iter().min(), summary.dates.iter().max()) {
        if first == last {
            let _ = writeln!(output, "Date: {first}");
        } else {
            let _ = writeln!(output, "Range: {first} to {last}");
        }
    }
    let _ = writeln!(output, "Total {verb}: {}", summary.generated);

    let _ = writeln!(output);
    if summary.errors.is_empty() {
        let _ = writeln!(output, "No errors.");
    } else {
        let _ = writeln!(output, "Errors ({}):", summary.errors.len());
        for error in &summary.errors {
            let _ = writeln!(output, "- {error}");
        }
    }

    output
}

/// Writes would-be report rows to a CSV file and returns how many were
/// written.
pub fn write_preview_csv(path: &Path, reports: &[ChurnRiskReport]) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    for report in reports {
        writer.serialize(ChurnReportCsvRow::from(report))?;
    }
    writer.flush()?;
    Ok(reports.len())
}
