//! Daily churn-risk report.
//!
//! Scores every user with a tracked subscription from one batched warehouse
//! query, then upserts one `ChurnRiskReport` per user and date and appends
//! alerts for HIGH/CRITICAL users.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime};
use serde_json::json;
use tracing::info;

use super::{Report, ReportContext, ReportDeps, ReportStore, SubscriptionSource};
use crate::models::{
    ActivityMetrics, ChurnAlert, ChurnRiskReport, RiskLevel, SubscriptionRecord,
    SubscriptionStatus,
};
use crate::risk::{self, ChurnSignals, ScoreBreakdown};
use crate::warehouse::{QueryParam, Row, Warehouse};

const WINDOW_DAYS: i64 = 7;
/// How far back to look for a user's last event and academy.
pub const LOOKBACK_DAYS: i64 = 90;

#[derive(Debug, Default)]
pub struct ChurnData {
    pub user_ids: Vec<i64>,
    pub subscriptions: HashMap<i64, SubscriptionRecord>,
    pub metrics: HashMap<i64, ActivityMetrics>,
}

#[derive(Debug, Default)]
pub struct ChurnOutput {
    pub reports: Vec<ChurnRiskReport>,
    pub alerts: Vec<ChurnAlert>,
}

pub struct ChurnReport {
    ctx: ReportContext,
    warehouse: Arc<dyn Warehouse>,
    subscriptions: Arc<dyn SubscriptionSource>,
    store: Arc<dyn ReportStore>,
    activity_table: String,
}

impl ChurnReport {
    pub fn new(ctx: ReportContext, deps: &ReportDeps) -> Self {
        Self {
            ctx,
            warehouse: Arc::clone(&deps.warehouse),
            subscriptions: Arc::clone(&deps.subscriptions),
            store: Arc::clone(&deps.store),
            activity_table: deps.activity_table.clone(),
        }
    }

    /// Activity metrics for all `user_ids` in a single warehouse query.
    pub async fn fetch_activity_metrics_batch(
        &self,
        user_ids: &[i64],
    ) -> anyhow::Result<HashMap<i64, ActivityMetrics>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = activity_metrics_sql(
            self.warehouse.project_id(),
            self.warehouse.dataset(),
            &self.activity_table,
        );
        let params = window_params(self.ctx.report_date, user_ids);
        let rows = self
            .warehouse
            .query(&sql, &params)
            .await
            .context("fetching activity metrics")?;

        Ok(rows
            .iter()
            .filter_map(metrics_from_row)
            .map(|m| (m.user_id, m))
            .collect())
    }
}

#[async_trait]
impl Report for ChurnReport {
    type Data = ChurnData;
    type Output = ChurnOutput;

    fn name(&self) -> &'static str {
        "churn"
    }

    fn context(&self) -> &ReportContext {
        &self.ctx
    }

    async fn fetch_data(&self) -> anyhow::Result<ChurnData> {
        let records = self
            .subscriptions
            .active_subscriptions(self.ctx.academy_id)
            .await
            .context("loading tracked subscriptions")?;

        let subscriptions: HashMap<i64, SubscriptionRecord> =
            records.into_iter().map(|r| (r.user_id, r)).collect();
        let mut user_ids: Vec<i64> = subscriptions.keys().copied().collect();
        user_ids.sort_unstable();

        if user_ids.is_empty() {
            info!(academy_id = ?self.ctx.academy_id, "no users with tracked subscriptions");
            return Ok(ChurnData::default());
        }

        let metrics = self.fetch_activity_metrics_batch(&user_ids).await?;
        Ok(ChurnData {
            user_ids,
            subscriptions,
            metrics,
        })
    }

    fn process_data(&self, data: ChurnData) -> anyhow::Result<ChurnOutput> {
        let mut output = ChurnOutput::default();

        for user_id in &data.user_ids {
            let Some(subscription) = data.subscriptions.get(user_id) else {
                continue;
            };
            let metrics = data
                .metrics
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| inactive_metrics(*user_id));

            let has_payment_issues = subscription.status == SubscriptionStatus::PaymentIssue;
            let days_until_renewal = subscription
                .next_payment_at
                .map(|at| (at.date_naive() - self.ctx.report_date).num_days());

            let signals = ChurnSignals {
                days_since_last_activity: metrics.days_since_last_activity,
                login_trend: metrics.login_trend,
                assignment_trend: metrics.assignment_trend,
                engagement_trend: metrics.engagement_trend,
                avg_frustration_score: metrics.avg_frustration_score,
                has_payment_issues,
                subscription_status: subscription.status,
                days_until_renewal,
            };
            let breakdown = ScoreBreakdown::from_signals(&signals);
            let score = breakdown.weighted_total();
            let risk_level = RiskLevel::from_score(score);

            let details = json!({
                "metrics": metrics,
                "subscription_status": subscription.status,
                "has_payment_issues": has_payment_issues,
                "days_until_renewal": days_until_renewal,
                "components": breakdown,
            });

            output.alerts.extend(risk::generate_churn_alerts(
                *user_id,
                metrics.academy_id,
                &signals,
                risk_level,
                self.ctx.generated_at,
                &details,
            ));

            output.reports.push(ChurnRiskReport {
                user_id: *user_id,
                academy_id: metrics.academy_id,
                report_date: self.ctx.report_date,
                churn_risk_score: score,
                risk_level,
                days_since_last_activity: metrics.days_since_last_activity,
                login_count_7d: metrics.login_count_7d,
                login_trend: metrics.login_trend,
                assignments_completed_7d: metrics.assignments_completed_7d,
                assignment_trend: metrics.assignment_trend,
                avg_frustration_score: metrics.avg_frustration_score,
                avg_engagement_score: metrics.avg_engagement_score,
                subscription_status: subscription.status,
                days_until_renewal,
                has_payment_issues,
                details,
            });
        }

        Ok(output)
    }

    async fn save_reports(&self, output: &ChurnOutput) -> anyhow::Result<usize> {
        let saved = self
            .store
            .upsert_risk_reports(&output.reports)
            .await
            .context("upserting churn risk reports")?;
        let inserted = self
            .store
            .insert_alerts(&output.alerts)
            .await
            .context("inserting churn alerts")?;

        info!(
            generated = output.alerts.len(),
            inserted,
            skipped = output.alerts.len().saturating_sub(inserted),
            "churn alerts recorded"
        );
        Ok(saved)
    }

    fn data_len(data: &ChurnData) -> usize {
        data.user_ids.len()
    }

    fn output_len(output: &ChurnOutput) -> usize {
        output.reports.len()
    }
}

fn activity_metrics_sql(project: &str, dataset: &str, table: &str) -> String {
    let source = format!("`{project}.{dataset}.{table}`");
    format!(
        r#"
        WITH last_7 AS (
            SELECT
                user_id,
                COUNTIF(kind = 'login') AS logins,
                COUNTIF(kind = 'assignment_status_updated' AND meta.task_status = 'DONE') AS assignments,
                COUNT(*) AS events,
                AVG(meta.frustration_score) AS avg_frustration,
                AVG(meta.engagement_score) AS avg_engagement
            FROM {source}
            WHERE user_id IN UNNEST(@user_ids)
                AND timestamp >= @last_start AND timestamp < @window_end
            GROUP BY user_id
        ),
        prev_7 AS (
            SELECT
                user_id,
                COUNTIF(kind = 'login') AS logins,
                COUNTIF(kind = 'assignment_status_updated' AND meta.task_status = 'DONE') AS assignments,
                COUNT(*) AS events
            FROM {source}
            WHERE user_id IN UNNEST(@user_ids)
                AND timestamp >= @prev_start AND timestamp < @last_start
            GROUP BY user_id
        ),
        latest AS (
            SELECT
                user_id,
                MAX(timestamp) AS last_activity,
                ARRAY_AGG(meta.academy IGNORE NULLS ORDER BY timestamp DESC LIMIT 1)[SAFE_OFFSET(0)] AS academy_id
            FROM {source}
            WHERE user_id IN UNNEST(@user_ids)
                AND timestamp >= @lookback_start AND timestamp < @window_end
            GROUP BY user_id
        )
        SELECT
            user_id,
            IFNULL(l.logins, 0) AS login_count_7d,
            IFNULL(p.logins, 0) AS login_count_prev_7d,
            IFNULL(l.assignments, 0) AS assignments_completed_7d,
            IFNULL(p.assignments, 0) AS assignments_completed_prev_7d,
            IFNULL(l.events, 0) AS events_7d,
            IFNULL(p.events, 0) AS events_prev_7d,
            l.avg_frustration AS avg_frustration_score,
            l.avg_engagement AS avg_engagement_score,
            DATE_DIFF(@report_date, DATE(lt.last_activity), DAY) AS days_since_last_activity,
            lt.academy_id AS academy_id
        FROM UNNEST(@user_ids) AS user_id
        LEFT JOIN last_7 AS l USING (user_id)
        LEFT JOIN prev_7 AS p USING (user_id)
        LEFT JOIN latest AS lt USING (user_id)
        "#
    )
}

/// Window bounds for report date D: last 7 days is `[D-6, D+1)`, previous
/// 7 days is `[D-13, D-6)`.
fn window_params(report_date: NaiveDate, user_ids: &[i64]) -> Vec<QueryParam> {
    let window_end = (report_date + Duration::days(1))
        .and_time(NaiveTime::MIN)
        .and_utc();
    let last_start = window_end - Duration::days(WINDOW_DAYS);
    let prev_start = last_start - Duration::days(WINDOW_DAYS);
    let lookback_start = window_end - Duration::days(LOOKBACK_DAYS);

    vec![
        QueryParam::new("user_ids", user_ids.to_vec()),
        QueryParam::new("report_date", report_date),
        QueryParam::new("window_end", window_end),
        QueryParam::new("last_start", last_start),
        QueryParam::new("prev_start", prev_start),
        QueryParam::new("lookback_start", lookback_start),
    ]
}

fn metrics_from_row(row: &Row) -> Option<ActivityMetrics> {
    let user_id = row.get_i64("user_id")?;
    let count = |column: &str| row.get_i64(column).unwrap_or(0);

    let login_count_7d = count("login_count_7d");
    let login_count_prev_7d = count("login_count_prev_7d");
    let assignments_completed_7d = count("assignments_completed_7d");
    let assignments_completed_prev_7d = count("assignments_completed_prev_7d");
    let events_7d = count("events_7d");
    let events_prev_7d = count("events_prev_7d");

    Some(ActivityMetrics {
        user_id,
        login_count_7d,
        login_count_prev_7d,
        assignments_completed_7d,
        assignments_completed_prev_7d,
        events_7d,
        events_prev_7d,
        days_since_last_activity: row
            .get_i64("days_since_last_activity")
            .map(|days| days.max(0))
            .unwrap_or(LOOKBACK_DAYS),
        login_trend: risk::trend(login_count_7d, login_count_prev_7d),
        assignment_trend: risk::trend(assignments_completed_7d, assignments_completed_prev_7d),
        engagement_trend: risk::trend(events_7d, events_prev_7d),
        avg_frustration_score: row.get_f64("avg_frustration_score").unwrap_or(0.0),
        avg_engagement_score: row.get_f64("avg_engagement_score"),
        academy_id: row.get_i64("academy_id"),
    })
}

fn inactive_metrics(user_id: i64) -> ActivityMetrics {
    ActivityMetrics {
        user_id,
        login_count_7d: 0,
        login_count_prev_7d: 0,
        assignments_completed_7d: 0,
        assignments_completed_prev_7d: 0,
        events_7d: 0,
        events_prev_7d: 0,
        days_since_last_activity: LOOKBACK_DAYS,
        login_trend: 0.0,
        assignment_trend: 0.0,
        engagement_trend: 0.0,
        avg_frustration_score: 0.0,
        avg_engagement_score: None,
        academy_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertType;
    use crate::reports::generate;
    use crate::reports::store::memory::{MemoryStore, StaticSubscriptions};
    use crate::warehouse::testing::RecordingWarehouse;
    use crate::warehouse::ParamValue;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn report_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("date")
    }

    fn subscription(user_id: i64, status: SubscriptionStatus) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id,
            status,
            next_payment_at: None,
        }
    }

    struct Fixture {
        warehouse: Arc<RecordingWarehouse>,
        store: Arc<MemoryStore>,
        deps: ReportDeps,
    }

    fn fixture(
        subscriptions: Vec<(SubscriptionRecord, Option<i64>)>,
        rows: Vec<Value>,
        store: Arc<MemoryStore>,
    ) -> Fixture {
        let warehouse = Arc::new(RecordingWarehouse::with_rows(rows));
        let deps = ReportDeps {
            warehouse: warehouse.clone(),
            subscriptions: Arc::new(StaticSubscriptions {
                records: subscriptions,
            }),
            store: store.clone(),
            activity_table: "activity".to_string(),
        };
        Fixture {
            warehouse,
            store,
            deps,
        }
    }

    fn churn(fixture: &Fixture, academy_id: Option<i64>) -> ChurnReport {
        ChurnReport::new(ReportContext::new(report_date(), academy_id), &fixture.deps)
    }

    fn troubled_row(user_id: i64) -> Value {
        json!({
            "user_id": user_id,
            "login_count_7d": 4,
            "login_count_prev_7d": 10,
            "assignments_completed_7d": 0,
            "assignments_completed_prev_7d": 2,
            "events_7d": 8,
            "events_prev_7d": 20,
            "days_since_last_activity": 10,
            "avg_frustration_score": 80.0,
            "avg_engagement_score": null,
            "academy_id": 3
        })
    }

    #[tokio::test]
    async fn no_qualifying_users_is_a_zero_work_run() {
        let fx = fixture(vec![], vec![], Arc::new(MemoryStore::default()));
        let report = churn(&fx, None);

        let data = report.fetch_data().await.expect("fetch");
        assert!(data.user_ids.is_empty());
        assert!(fx.warehouse.calls().is_empty());

        let output = report.process_data(data).expect("process");
        assert!(output.reports.is_empty());
        assert_eq!(report.save_reports(&output).await.expect("save"), 0);
    }

    #[tokio::test]
    async fn metrics_for_all_users_come_from_one_query() {
        let fx = fixture(
            vec![
                (subscription(3, SubscriptionStatus::Active), None),
                (subscription(1, SubscriptionStatus::FreeTrial), None),
                (subscription(2, SubscriptionStatus::PaymentIssue), None),
            ],
            vec![troubled_row(1), troubled_row(2), troubled_row(3)],
            Arc::new(MemoryStore::default()),
        );

        let data = churn(&fx, None).fetch_data().await.expect("fetch");
        assert_eq!(data.user_ids, vec![1, 2, 3]);
        assert_eq!(data.metrics.len(), 3);

        let calls = fx.warehouse.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("`PROJECT.DATASET.activity`"));
        assert!(calls[0].0.contains("UNNEST(@user_ids)"));
        assert_eq!(calls[0].1[0].value, ParamValue::Int64Array(vec![1, 2, 3]));
    }

    #[test]
    fn windows_split_fourteen_days_at_the_report_date() {
        let params = window_params(report_date(), &[1]);
        let at = |name: &str| {
            params
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.value.clone())
                .expect("param")
        };
        let midnight = |day: u32| {
            ParamValue::Timestamp(Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).single().expect("ts"))
        };
        assert_eq!(at("window_end"), midnight(11));
        assert_eq!(at("last_start"), midnight(4));
        assert_eq!(at("prev_start"), ParamValue::Timestamp(
            Utc.with_ymd_and_hms(2026, 2, 25, 0, 0, 0).single().expect("ts"),
        ));
        assert_eq!(at("report_date"), ParamValue::Date(report_date()));
    }

    #[test]
    fn trend_for_newly_active_user_is_finite() {
        let metrics = metrics_from_row(&Row::from(json!({
            "user_id": 7,
            "login_count_7d": 5,
            "login_count_prev_7d": 0,
            "assignments_completed_7d": 0,
            "assignments_completed_prev_7d": 0
        })))
        .expect("metrics");
        assert_eq!(metrics.login_trend, 500.0);
        assert_eq!(metrics.assignment_trend, 0.0);
        assert!(metrics.engagement_trend.is_finite());
    }

    #[test]
    fn user_without_recent_events_counts_as_inactive_for_the_lookback() {
        let metrics = metrics_from_row(&Row::from(json!({"user_id": 9}))).expect("metrics");
        assert_eq!(metrics.days_since_last_activity, LOOKBACK_DAYS);
        assert_eq!(metrics.academy_id, None);
        assert_eq!(metrics.avg_engagement_score, None);
    }

    #[tokio::test]
    async fn payment_issue_user_is_critical_with_four_alerts() {
        let fx = fixture(
            vec![(subscription(1, SubscriptionStatus::PaymentIssue), Some(3))],
            vec![troubled_row(1)],
            Arc::new(MemoryStore::default()),
        );
        let report = churn(&fx, None);
        let data = report.fetch_data().await.expect("fetch");
        let output = report.process_data(data).expect("process");

        assert_eq!(output.reports.len(), 1);
        let row = &output.reports[0];
        assert_eq!(row.risk_level, RiskLevel::Critical);
        assert!(row.has_payment_issues);
        assert_eq!(row.academy_id, Some(3));
        assert_eq!(row.login_trend, -60.0);

        let types: Vec<AlertType> = output.alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![
                AlertType::Inactivity,
                AlertType::PaymentRisk,
                AlertType::EngagementDrop,
                AlertType::HighFrustration,
            ]
        );
        assert!(!types.contains(&AlertType::TrialExpiring));
        assert_eq!(output.alerts[0].metrics_snapshot, row.details);
    }

    #[tokio::test]
    async fn renewal_days_are_counted_from_the_report_date() {
        let mut record = subscription(1, SubscriptionStatus::FreeTrial);
        record.next_payment_at = Utc.with_ymd_and_hms(2026, 3, 12, 18, 0, 0).single();
        let fx = fixture(
            vec![(record, None)],
            vec![troubled_row(1)],
            Arc::new(MemoryStore::default()),
        );
        let report = churn(&fx, None);
        let output = report
            .process_data(report.fetch_data().await.expect("fetch"))
            .expect("process");

        assert_eq!(output.reports[0].days_until_renewal, Some(2));
        assert!(output
            .alerts
            .iter()
            .any(|a| a.alert_type == AlertType::TrialExpiring));
    }

    #[tokio::test]
    async fn academy_scope_narrows_the_subscriptions() {
        let fx = fixture(
            vec![
                (subscription(1, SubscriptionStatus::Active), Some(3)),
                (subscription(2, SubscriptionStatus::Active), Some(4)),
            ],
            vec![troubled_row(1)],
            Arc::new(MemoryStore::default()),
        );
        let data = churn(&fx, Some(3)).fetch_data().await.expect("fetch");
        assert_eq!(data.user_ids, vec![1]);
    }

    #[tokio::test]
    async fn rerunning_a_date_overwrites_instead_of_duplicating() {
        let store = Arc::new(MemoryStore::default());
        let subs = || {
            vec![
                (subscription(1, SubscriptionStatus::PaymentIssue), None),
                (subscription(2, SubscriptionStatus::Active), None),
            ]
        };

        let first = fixture(subs(), vec![troubled_row(1), troubled_row(2)], store.clone());
        let saved = generate(&churn(&first, None), false).await.expect("first run");
        assert_eq!(saved.rows, 2);

        let calm = json!({"user_id": 1, "days_since_last_activity": 0, "login_count_7d": 3, "login_count_prev_7d": 3});
        let second = fixture(subs(), vec![calm, troubled_row(2)], store.clone());
        let saved = generate(&churn(&second, None), false).await.expect("second run");
        assert_eq!(saved.rows, 2);

        let reports = store.reports();
        assert_eq!(reports.len(), 2);
        let user_1 = reports.iter().find(|r| r.user_id == 1).expect("user 1");
        assert_eq!(user_1.days_since_last_activity, 0);
        assert_eq!(user_1.login_count_7d, 3);
    }

    #[tokio::test]
    async fn duplicate_alerts_are_skipped_silently() {
        let store = Arc::new(MemoryStore::default());
        let fx = fixture(
            vec![(subscription(1, SubscriptionStatus::PaymentIssue), None)],
            vec![troubled_row(1)],
            store.clone(),
        );
        let report = churn(&fx, None);
        let output = report
            .process_data(report.fetch_data().await.expect("fetch"))
            .expect("process");

        report.save_reports(&output).await.expect("first save");
        let saved = report.save_reports(&output).await.expect("second save");

        assert_eq!(saved, 1);
        assert_eq!(fx.store.alerts().len(), output.alerts.len());
    }

    #[tokio::test]
    async fn warehouse_failure_aborts_before_saving() {
        let store = Arc::new(MemoryStore::default());
        let deps = ReportDeps {
            warehouse: Arc::new(RecordingWarehouse::failing("Access Denied")),
            subscriptions: Arc::new(StaticSubscriptions {
                records: vec![(subscription(1, SubscriptionStatus::Active), None)],
            }),
            store: store.clone(),
            activity_table: "activity".to_string(),
        };
        let report = ChurnReport::new(ReportContext::new(report_date(), None), &deps);

        let err = generate(&report, false).await.unwrap_err();
        assert_eq!(err.stage, crate::reports::ReportStage::Fetching);
        assert!(store.reports().is_empty());
    }
}
