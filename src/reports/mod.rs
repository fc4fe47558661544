//! Scheduled analytics reports: fetch, process, then save.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, info};

use crate::error::ReportError;
use crate::models::ChurnRiskReport;
use crate::warehouse::Warehouse;

pub mod churn;
pub mod store;

pub use churn::ChurnReport;
pub use store::{ReportStore, SubscriptionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStage {
    Created,
    Fetching,
    Processing,
    Saving,
    Done,
    Error,
}

impl fmt::Display for ReportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportStage::Created => "created",
            ReportStage::Fetching => "fetching",
            ReportStage::Processing => "processing",
            ReportStage::Saving => "saving",
            ReportStage::Done => "done",
            ReportStage::Error => "error",
        };
        f.write_str(name)
    }
}

/// Date and scope of a single report run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportContext {
    pub report_date: NaiveDate,
    pub academy_id: Option<i64>,
    pub generated_at: DateTime<Utc>,
}

impl ReportContext {
    pub fn new(report_date: NaiveDate, academy_id: Option<i64>) -> Self {
        Self {
            report_date,
            academy_id,
            generated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Report: Send + Sync {
    type Data: Send;
    type Output: Send + Sync;

    fn name(&self) -> &'static str;
    fn context(&self) -> &ReportContext;

    async fn fetch_data(&self) -> anyhow::Result<Self::Data>;

    /// Pure transformation of fetched data. Must not do I/O.
    fn process_data(&self, data: Self::Data) -> anyhow::Result<Self::Output>;

    /// Persists the output and returns the number of report rows written.
    async fn save_reports(&self, output: &Self::Output) -> anyhow::Result<usize>;

    fn data_len(data: &Self::Data) -> usize;
    fn output_len(output: &Self::Output) -> usize;
}

#[derive(Debug)]
pub struct Generated<O> {
    /// Rows written, or rows that would have been written on a dry run.
    pub rows: usize,
    pub output: O,
}

struct StageTracker {
    report: &'static str,
    date: NaiveDate,
    academy_id: Option<i64>,
    stage: ReportStage,
}

impl StageTracker {
    fn advance(&mut self, next: ReportStage) {
        debug!(report = self.report, date = %self.date, from = %self.stage, to = %next, "report stage");
        self.stage = next;
    }

    fn fail(&mut self, source: anyhow::Error) -> ReportError {
        let failed_in = self.stage;
        error!(
            report = self.report,
            date = %self.date,
            academy_id = ?self.academy_id,
            stage = %failed_in,
            error = ?source,
            "report failed"
        );
        self.stage = ReportStage::Error;
        ReportError::new(failed_in, source)
    }
}

/// Runs one report through its stages. A failure while fetching or
/// processing returns before anything is saved.
pub async fn generate<R: Report>(
    report: &R,
    dry_run: bool,
) -> Result<Generated<R::Output>, ReportError> {
    let ctx = report.context();
    let mut tracker = StageTracker {
        report: report.name(),
        date: ctx.report_date,
        academy_id: ctx.academy_id,
        stage: ReportStage::Created,
    };

    info!(
        report = report.name(),
        date = %ctx.report_date,
        academy_id = ?ctx.academy_id,
        dry_run,
        "generating report"
    );

    tracker.advance(ReportStage::Fetching);
    let data = report.fetch_data().await.map_err(|e| tracker.fail(e))?;
    info!(report = report.name(), fetched = R::data_len(&data), "fetched data");

    tracker.advance(ReportStage::Processing);
    let output = report.process_data(data).map_err(|e| tracker.fail(e))?;
    let processed = R::output_len(&output);
    info!(report = report.name(), processed, "processed data");

    if dry_run {
        info!(report = report.name(), would_save = processed, "dry run, nothing saved");
        tracker.advance(ReportStage::Done);
        return Ok(Generated {
            rows: processed,
            output,
        });
    }

    tracker.advance(ReportStage::Saving);
    let saved = report.save_reports(&output).await.map_err(|e| tracker.fail(e))?;
    info!(report = report.name(), saved, "saved reports");

    tracker.advance(ReportStage::Done);
    Ok(Generated {
        rows: saved,
        output,
    })
}

/// Collaborators every report is built from.
#[derive(Clone)]
pub struct ReportDeps {
    pub warehouse: Arc<dyn Warehouse>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub store: Arc<dyn ReportStore>,
    pub activity_table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportKind {
    Churn,
}

#[derive(Debug, Default)]
pub struct RunResult {
    pub rows: usize,
    /// Rows computed on a dry run, for previewing.
    pub preview: Vec<ChurnRiskReport>,
}

impl ReportKind {
    pub fn name(self) -> &'static str {
        match self {
            ReportKind::Churn => "churn",
        }
    }

    pub async fn run(
        self,
        deps: &ReportDeps,
        ctx: ReportContext,
        dry_run: bool,
    ) -> Result<RunResult, ReportError> {
        match self {
            ReportKind::Churn => {
                let report = ChurnReport::new(ctx, deps);
                let generated = generate(&report, dry_run).await?;
                Ok(RunResult {
                    rows: generated.rows,
                    preview: if dry_run {
                        generated.output.reports
                    } else {
                        Vec::new()
                    },
                })
            }
        }
    }
}

pub fn yesterday(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive() - Duration::days(1)
}

/// `days_back` consecutive dates ending yesterday, most recent first.
pub fn backfill_dates(now: DateTime<Utc>, days_back: u32) -> Vec<NaiveDate> {
    let end = yesterday(now);
    (0..i64::from(days_back))
        .map(|offset| end - Duration::days(offset))
        .collect()
}
