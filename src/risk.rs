use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{AlertType, ChurnAlert, RiskLevel, Severity, SubscriptionStatus};

pub const INACTIVITY_WEIGHT: f64 = 0.25;
pub const ENGAGEMENT_DECAY_WEIGHT: f64 = 0.20;
pub const FRUSTRATION_WEIGHT: f64 = 0.15;
pub const LOGIN_DECAY_WEIGHT: f64 = 0.15;
pub const ASSIGNMENT_STALL_WEIGHT: f64 = 0.15;
pub const PAYMENT_ISSUES_WEIGHT: f64 = 0.10;

const INACTIVITY_SATURATION_DAYS: f64 = 14.0;

pub const INACTIVITY_ALERT_DAYS: i64 = 7;
pub const ENGAGEMENT_DROP_ALERT_TREND: f64 = -50.0;
pub const HIGH_FRUSTRATION_ALERT_SCORE: f64 = 70.0;
pub const TRIAL_EXPIRING_ALERT_DAYS: i64 = 3;

/// Inputs to the churn score for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnSignals {
    pub days_since_last_activity: i64,
    pub login_trend: f64,
    pub assignment_trend: f64,
    pub engagement_trend: f64,
    pub avg_frustration_score: f64,
    pub has_payment_issues: bool,
    pub subscription_status: SubscriptionStatus,
    pub days_until_renewal: Option<i64>,
}

/// The six sub-scores, each already clamped to `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub inactivity: f64,
    pub engagement_decay: f64,
    pub frustration: f64,
    pub login_decay: f64,
    pub assignment_stall: f64,
    pub payment_issues: f64,
}

impl ScoreBreakdown {
    pub fn from_signals(signals: &ChurnSignals) -> Self {
        Self {
            inactivity: clamp_score(
                signals.days_since_last_activity as f64 / INACTIVITY_SATURATION_DAYS * 100.0,
            ),
            engagement_decay: clamp_score(-signals.engagement_trend),
            frustration: clamp_score(signals.avg_frustration_score),
            login_decay: clamp_score(-signals.login_trend * 2.0),
            assignment_stall: clamp_score(-signals.assignment_trend * 10.0),
            payment_issues: if signals.has_payment_issues { 100.0 } else { 0.0 },
        }
    }

    pub fn weighted_total(&self) -> f64 {
        clamp_score(
            self.inactivity * INACTIVITY_WEIGHT
                + self.engagement_decay * ENGAGEMENT_DECAY_WEIGHT
                + self.frustration * FRUSTRATION_WEIGHT
                + self.login_decay * LOGIN_DECAY_WEIGHT
                + self.assignment_stall * ASSIGNMENT_STALL_WEIGHT
                + self.payment_issues * PAYMENT_ISSUES_WEIGHT,
        )
    }
}

/// Percent change between two windows. The previous count is floored at one
/// so a user with no prior activity gets a finite trend.
pub fn trend(current: i64, previous: i64) -> f64 {
    (current - previous) as f64 / previous.max(1) as f64 * 100.0
}

fn clamp_score(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

/// Alerts for one user. Only HIGH and CRITICAL users ever get alerts.
pub fn generate_churn_alerts(
    user_id: i64,
    academy_id: Option<i64>,
    signals: &ChurnSignals,
    risk_level: RiskLevel,
    triggered_at: DateTime<Utc>,
    snapshot: &Value,
) -> Vec<ChurnAlert> {
    if !matches!(risk_level, RiskLevel::High | RiskLevel::Critical) {
        return Vec::new();
    }

    let overall = Severity::from(risk_level);
    let mut triggered: Vec<(AlertType, Severity)> = Vec::new();

    if signals.days_since_last_activity >= INACTIVITY_ALERT_DAYS {
        triggered.push((AlertType::Inactivity, overall));
    }
    if signals.has_payment_issues {
        triggered.push((AlertType::PaymentRisk, Severity::Critical));
    }
    if signals.login_trend <= ENGAGEMENT_DROP_ALERT_TREND {
        triggered.push((AlertType::EngagementDrop, overall));
    }
    if signals.avg_frustration_score >= HIGH_FRUSTRATION_ALERT_SCORE {
        triggered.push((AlertType::HighFrustration, overall));
    }
    if signals.subscription_status == SubscriptionStatus::FreeTrial
        && signals
            .days_until_renewal
            .is_some_and(|days| days <= TRIAL_EXPIRING_ALERT_DAYS)
    {
        triggered.push((AlertType::TrialExpiring, Severity::High));
    }

    triggered
        .into_iter()
        .map(|(alert_type, severity)| ChurnAlert {
            user_id,
            academy_id,
            alert_type,
            severity,
            triggered_at,
            resolved_at: None,
            action_taken: None,
            metrics_snapshot: snapshot.clone(),
        })
        .collect()
}
