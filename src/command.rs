use chrono::{DateTime, NaiveDate, Utc};
use tracing::{error, info};

use crate::models::ChurnRiskReport;
use crate::reports::{backfill_dates, yesterday, ReportContext, ReportDeps, ReportKind};
use crate::summary::RunSummary;

/// Dates to run for. `--days-back` wins over `--date`, which wins over the
/// default of yesterday.
pub fn select_dates(
    now: DateTime<Utc>,
    date: Option<NaiveDate>,
    days_back: Option<u32>,
) -> Vec<NaiveDate> {
    match (days_back, date) {
        (Some(days_back), _) => backfill_dates(now, days_back),
        (None, Some(date)) => vec![date],
        (None, None) => vec![yesterday(now)],
    }
}

/// Runs `kind` once per date, one date at a time. A failed date is logged
/// and recorded, and the remaining dates still run.
pub async fn run_dates(
    kind: ReportKind,
    deps: &ReportDeps,
    dates: &[NaiveDate],
    academy_id: Option<i64>,
    dry_run: bool,
) -> (RunSummary, Vec<ChurnRiskReport>) {
    let mut summary = RunSummary::new(kind.name(), academy_id, dry_run);
    let mut preview = Vec::new();

    for date in dates {
        let ctx = ReportContext::new(*date, academy_id);
        match kind.run(deps, ctx, dry_run).await {
            Ok(result) => {
                info!(report = kind.name(), date = %date, rows = result.rows, "report date finished");
                summary.record_success(*date, result.rows);
                preview.extend(result.preview);
            }
            Err(e) => {
                error!(report = kind.name(), date = %date, error = ?e, "report date failed");
                summary.record_failure(*date, &e);
            }
        }
    }

    (summary, preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubscriptionRecord, SubscriptionStatus};
    use crate::reports::store::memory::{MemoryStore, StaticSubscriptions};
    use crate::warehouse::testing::RecordingWarehouse;
    use crate::warehouse::ParamValue;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn frozen_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0).single().expect("now")
    }

    fn deps(warehouse: Arc<RecordingWarehouse>, store: Arc<MemoryStore>) -> ReportDeps {
        ReportDeps {
            warehouse,
            subscriptions: Arc::new(StaticSubscriptions {
                records: vec![(
                    SubscriptionRecord {
                        user_id: 1,
                        status: SubscriptionStatus::Active,
                        next_payment_at: None,
                    },
                    None,
                )],
            }),
            store,
            activity_table: "activity".to_string(),
        }
    }

    #[test]
    fn days_back_overrides_explicit_date() {
        let explicit = NaiveDate::from_ymd_opt(2025, 1, 1).expect("date");
        let dates = select_dates(frozen_now(), Some(explicit), Some(2));
        assert_eq!(dates.len(), 2);
        assert!(!dates.contains(&explicit));
    }

    #[test]
    fn explicit_date_overrides_default() {
        let explicit = NaiveDate::from_ymd_opt(2025, 1, 1).expect("date");
        assert_eq!(select_dates(frozen_now(), Some(explicit), None), vec![explicit]);
    }

    #[test]
    fn default_is_yesterday() {
        assert_eq!(
            select_dates(frozen_now(), None, None),
            vec![NaiveDate::from_ymd_opt(2026, 3, 9).expect("date")]
        );
    }

    #[tokio::test]
    async fn backfill_generates_each_date_exactly_once() {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(vec![json!({"user_id": 1})]));
        let store = Arc::new(MemoryStore::default());
        let dates = select_dates(frozen_now(), None, Some(5));

        let (summary, _) = run_dates(
            ReportKind::Churn,
            &deps(warehouse.clone(), store.clone()),
            &dates,
            None,
            false,
        )
        .await;

        assert_eq!(summary.dates.len(), 5);
        assert_eq!(summary.generated, 5);
        assert!(summary.errors.is_empty());

        let queried: BTreeSet<NaiveDate> = warehouse
            .calls()
            .iter()
            .filter_map(|(_, params)| {
                params.iter().find_map(|p| match (&p.name[..], &p.value) {
                    ("report_date", ParamValue::Date(d)) => Some(*d),
                    _ => None,
                })
            })
            .collect();
        let expected: BTreeSet<NaiveDate> = (5..=9)
            .map(|day| NaiveDate::from_ymd_opt(2026, 3, day).expect("date"))
            .collect();
        assert_eq!(warehouse.calls().len(), 5);
        assert_eq!(queried, expected);
        assert_eq!(store.reports().len(), 5);
    }

    #[tokio::test]
    async fn academy_without_users_is_an_empty_success() {
        let warehouse = Arc::new(RecordingWarehouse::failing("Access Denied"));
        let store = Arc::new(MemoryStore::default());
        let dates = select_dates(frozen_now(), None, Some(3));

        let (summary, _) = run_dates(
            ReportKind::Churn,
            &deps(warehouse.clone(), store),
            &dates,
            Some(2),
            false,
        )
        .await;

        assert_eq!(warehouse.calls().len(), 0);
        assert_eq!(summary.dates.len(), 3);
        assert_eq!(summary.generated, 0);
        assert!(summary.errors.is_empty());
    }

    #[tokio::test]
    async fn warehouse_errors_land_in_the_summary() {
        let warehouse = Arc::new(RecordingWarehouse::failing("Access Denied"));
        let dates = select_dates(frozen_now(), None, Some(3));

        let (summary, _) = run_dates(
            ReportKind::Churn,
            &deps(warehouse.clone(), Arc::new(MemoryStore::default())),
            &dates,
            None,
            false,
        )
        .await;

        assert_eq!(warehouse.calls().len(), 3);
        assert_eq!(summary.errors.len(), 3);
        assert!(summary.errors[0].contains("fetching"));
    }

    #[tokio::test]
    async fn summary_keeps_the_warehouse_message() {
        let warehouse = Arc::new(RecordingWarehouse::failing("Access Denied: Table activity"));
        let dates = select_dates(frozen_now(), None, None);

        let (summary, _) = run_dates(
            ReportKind::Churn,
            &deps(warehouse, Arc::new(MemoryStore::default())),
            &dates,
            None,
            false,
        )
        .await;

        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("fetching"));
        assert!(summary.errors[0].contains("Access Denied: Table activity"));
        assert!(crate::summary::build_summary(&summary).contains("Access Denied: Table activity"));
    }

    #[tokio::test]
    async fn dry_run_returns_preview_without_saving() {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(vec![json!({"user_id": 1})]));
        let store = Arc::new(MemoryStore::default());
        let dates = select_dates(frozen_now(), None, None);

        let (summary, preview) = run_dates(
            ReportKind::Churn,
            &deps(warehouse, store.clone()),
            &dates,
            None,
            true,
        )
        .await;

        assert_eq!(summary.generated, 1);
        assert_eq!(preview.len(), 1);
        assert!(store.reports().is_empty());
    }
}
