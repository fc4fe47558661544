use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::models::{
    AlertListing, ChurnAlert, ChurnRiskReport, RiskListing, Severity, SubscriptionRecord,
    SubscriptionStatus,
};
use crate::reports::{ReportStore, SubscriptionSource};

// Keeps each statement well under the Postgres bind-parameter limit.
const WRITE_CHUNK: usize = 1000;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres-backed subscription source and report store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionSource for PgStore {
    async fn active_subscriptions(
        &self,
        academy_id: Option<i64>,
    ) -> anyhow::Result<Vec<SubscriptionRecord>> {
        let statuses: Vec<&str> = SubscriptionStatus::TRACKED
            .iter()
            .map(|s| s.as_str())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (s.user_id)
                s.user_id::BIGINT AS user_id,
                s.status,
                s.next_payment_at
            FROM payments_subscription s
            LEFT JOIN payments_cohortset cs ON cs.id = s.selected_cohort_set_id
            WHERE s.status = ANY($1)
              AND ($2::BIGINT IS NULL OR cs.academy_id = $2)
            ORDER BY s.user_id, s.next_payment_at DESC NULLS LAST
            "#,
        )
        .bind(&statuses)
        .bind(academy_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            records.push(SubscriptionRecord {
                user_id: row.get("user_id"),
                status: status.parse().map_err(anyhow::Error::msg)?,
                next_payment_at: row.get("next_payment_at"),
            });
        }

        Ok(records)
    }
}

#[async_trait]
impl ReportStore for PgStore {
    async fn upsert_risk_reports(&self, reports: &[ChurnRiskReport]) -> anyhow::Result<usize> {
        if reports.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for chunk in reports.chunks(WRITE_CHUNK) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO monitoring_churnriskreport \
                 (id, user_id, academy_id, report_date, churn_risk_score, risk_level, \
                 days_since_last_activity, login_count_7d, login_trend, assignments_completed_7d, \
                 assignment_trend, avg_frustration_score, avg_engagement_score, \
                 subscription_status, days_until_renewal, has_payment_issues, details) ",
            );
            query.push_values(chunk, |mut row, report| {
                row.push_bind(Uuid::new_v4())
                    .push_bind(report.user_id)
                    .push_bind(report.academy_id)
                    .push_bind(report.report_date)
                    .push_bind(report.churn_risk_score)
                    .push_bind(report.risk_level.as_str())
                    .push_bind(report.days_since_last_activity)
                    .push_bind(report.login_count_7d)
                    .push_bind(report.login_trend)
                    .push_bind(report.assignments_completed_7d)
                    .push_bind(report.assignment_trend)
                    .push_bind(report.avg_frustration_score)
                    .push_bind(report.avg_engagement_score)
                    .push_bind(report.subscription_status.as_str())
                    .push_bind(report.days_until_renewal)
                    .push_bind(report.has_payment_issues)
                    .push_bind(Json(&report.details));
            });
            query.push(
                " ON CONFLICT (user_id, report_date) DO UPDATE SET \
                 academy_id = EXCLUDED.academy_id, \
                 churn_risk_score = EXCLUDED.churn_risk_score, \
                 risk_level = EXCLUDED.risk_level, \
                 days_since_last_activity = EXCLUDED.days_since_last_activity, \
                 login_count_7d = EXCLUDED.login_count_7d, \
                 login_trend = EXCLUDED.login_trend, \
                 assignments_completed_7d = EXCLUDED.assignments_completed_7d, \
                 assignment_trend = EXCLUDED.assignment_trend, \
                 avg_frustration_score = EXCLUDED.avg_frustration_score, \
                 avg_engagement_score = EXCLUDED.avg_engagement_score, \
                 subscription_status = EXCLUDED.subscription_status, \
                 days_until_renewal = EXCLUDED.days_until_renewal, \
                 has_payment_issues = EXCLUDED.has_payment_issues, \
                 details = EXCLUDED.details, \
                 updated_at = NOW()",
            );
            query
                .build()
                .execute(&mut *tx)
                .await
                .context("bulk upsert of churn risk reports failed")?;
        }
        tx.commit().await?;

        Ok(reports.len())
    }

    async fn insert_alerts(&self, alerts: &[ChurnAlert]) -> anyhow::Result<usize> {
        if alerts.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0usize;
        let mut tx = self.pool.begin().await?;
        for chunk in alerts.chunks(WRITE_CHUNK) {
            let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO monitoring_churnalert \
                 (id, user_id, academy_id, alert_type, severity, triggered_at, \
                 resolved_at, action_taken, metrics_snapshot) ",
            );
            query.push_values(chunk, |mut row, alert| {
                row.push_bind(Uuid::new_v4())
                    .push_bind(alert.user_id)
                    .push_bind(alert.academy_id)
                    .push_bind(alert.alert_type.as_str())
                    .push_bind(alert.severity.as_str())
                    .push_bind(alert.triggered_at)
                    .push_bind(alert.resolved_at)
                    .push_bind(alert.action_taken.as_deref())
                    .push_bind(Json(&alert.metrics_snapshot));
            });
            query.push(" ON CONFLICT (user_id, alert_type, triggered_at) DO NOTHING");

            let result = query
                .build()
                .execute(&mut *tx)
                .await
                .context("bulk insert of churn alerts failed")?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;

        Ok(inserted)
    }
}

pub async fn top_reports(
    pool: &PgPool,
    report_date: NaiveDate,
    academy_id: Option<i64>,
    limit: i64,
) -> anyhow::Result<Vec<RiskListing>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id, academy_id, churn_risk_score, risk_level, days_since_last_activity
        FROM monitoring_churnriskreport
        WHERE report_date = $1
          AND ($2::BIGINT IS NULL OR academy_id = $2)
        ORDER BY churn_risk_score DESC
        LIMIT $3
        "#,
    )
    .bind(report_date)
    .bind(academy_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| RiskListing {
            user_id: row.get("user_id"),
            academy_id: row.get("academy_id"),
            churn_risk_score: row.get("churn_risk_score"),
            risk_level: row.get("risk_level"),
            days_since_last_activity: row.get("days_since_last_activity"),
        })
        .collect())
}

pub async fn academy_alerts(
    pool: &PgPool,
    academy_id: i64,
    severity: Option<Severity>,
    limit: i64,
) -> anyhow::Result<Vec<AlertListing>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id, academy_id, alert_type, severity, triggered_at, resolved_at
        FROM monitoring_churnalert
        WHERE academy_id = $1
          AND ($2::TEXT IS NULL OR severity = $2)
        ORDER BY triggered_at DESC
        LIMIT $3
        "#,
    )
    .bind(academy_id)
    .bind(severity.map(Severity::as_str))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(alert_listing).collect())
}

pub async fn user_alerts(
    pool: &PgPool,
    user_id: i64,
    limit: i64,
) -> anyhow::Result<Vec<AlertListing>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id, academy_id, alert_type, severity, triggered_at, resolved_at
        FROM monitoring_churnalert
        WHERE user_id = $1
        ORDER BY triggered_at DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(alert_listing).collect())
}

fn alert_listing(row: &sqlx::postgres::PgRow) -> AlertListing {
    AlertListing {
        user_id: row.get("user_id"),
        academy_id: row.get("academy_id"),
        alert_type: row.get("alert_type"),
        severity: row.get("severity"),
        triggered_at: row.get("triggered_at"),
        resolved_at: row.get("resolved_at"),
    }
}
