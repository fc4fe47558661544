use async_trait::async_trait;

use crate::models::{ChurnAlert, ChurnRiskReport, SubscriptionRecord};

/// Users whose subscription makes them eligible for churn scoring.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    /// One record per user with a tracked status, narrowed to the academy's
    /// cohort sets when `academy_id` is given.
    async fn active_subscriptions(
        &self,
        academy_id: Option<i64>,
    ) -> anyhow::Result<Vec<SubscriptionRecord>>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Inserts or overwrites one row per `(user_id, report_date)`.
    async fn upsert_risk_reports(&self, reports: &[ChurnRiskReport]) -> anyhow::Result<usize>;

    /// Appends alerts, silently skipping ones that collide with an existing
    /// `(user_id, alert_type, triggered_at)`. Returns how many were inserted.
    async fn insert_alerts(&self, alerts: &[ChurnAlert]) -> anyhow::Result<usize>;
}
