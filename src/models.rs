use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            RiskLevel::Critical
        } else if score >= 50.0 {
            RiskLevel::High
        } else if score >= 25.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl From<RiskLevel> for Severity {
    fn from(level: RiskLevel) -> Self {
        match level {
            RiskLevel::Low => Severity::Low,
            RiskLevel::Medium => Severity::Medium,
            RiskLevel::High => Severity::High,
            RiskLevel::Critical => Severity::Critical,
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Inactivity,
    EngagementDrop,
    HighFrustration,
    PaymentRisk,
    TrialExpiring,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Inactivity => "INACTIVITY",
            AlertType::EngagementDrop => "ENGAGEMENT_DROP",
            AlertType::HighFrustration => "HIGH_FRUSTRATION",
            AlertType::PaymentRisk => "PAYMENT_RISK",
            AlertType::TrialExpiring => "TRIAL_EXPIRING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    FreeTrial,
    PaymentIssue,
}

impl SubscriptionStatus {
    /// Statuses that qualify a user for churn scoring.
    pub const TRACKED: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::FreeTrial,
        SubscriptionStatus::PaymentIssue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::FreeTrial => "FREE_TRIAL",
            SubscriptionStatus::PaymentIssue => "PAYMENT_ISSUE",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "FREE_TRIAL" => Ok(SubscriptionStatus::FreeTrial),
            "PAYMENT_ISSUE" => Ok(SubscriptionStatus::PaymentIssue),
            other => Err(format!("untracked subscription status {other}")),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub user_id: i64,
    pub status: SubscriptionStatus,
    pub next_payment_at: Option<DateTime<Utc>>,
}

/// Per-user activity pulled from the warehouse for one report date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityMetrics {
    pub user_id: i64,
    pub login_count_7d: i64,
    pub login_count_prev_7d: i64,
    pub assignments_completed_7d: i64,
    pub assignments_completed_prev_7d: i64,
    pub events_7d: i64,
    pub events_prev_7d: i64,
    pub days_since_last_activity: i64,
    pub login_trend: f64,
    pub assignment_trend: f64,
    pub engagement_trend: f64,
    pub avg_frustration_score: f64,
    pub avg_engagement_score: Option<f64>,
    pub academy_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnRiskReport {
    pub user_id: i64,
    pub academy_id: Option<i64>,
    pub report_date: NaiveDate,
    pub churn_risk_score: f64,
    pub risk_level: RiskLevel,
    pub days_since_last_activity: i64,
    pub login_count_7d: i64,
    pub login_trend: f64,
    pub assignments_completed_7d: i64,
    pub assignment_trend: f64,
    pub avg_frustration_score: f64,
    pub avg_engagement_score: Option<f64>,
    pub subscription_status: SubscriptionStatus,
    pub days_until_renewal: Option<i64>,
    pub has_payment_issues: bool,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChurnAlert {
    pub user_id: i64,
    pub academy_id: Option<i64>,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub action_taken: Option<String>,
    pub metrics_snapshot: Value,
}

/// Flat row used for CSV previews of a dry run.
#[derive(Debug, Serialize)]
pub struct ChurnReportCsvRow<'a> {
    pub user_id: i64,
    pub academy_id: Option<i64>,
    pub report_date: NaiveDate,
    pub churn_risk_score: f64,
    pub risk_level: &'a str,
    pub days_since_last_activity: i64,
    pub login_count_7d: i64,
    pub login_trend: f64,
    pub assignments_completed_7d: i64,
    pub assignment_trend: f64,
    pub avg_frustration_score: f64,
    pub avg_engagement_score: Option<f64>,
    pub subscription_status: &'a str,
    pub days_until_renewal: Option<i64>,
    pub has_payment_issues: bool,
}

impl<'a> From<&'a ChurnRiskReport> for ChurnReportCsvRow<'a> {
    fn from(report: &'a ChurnRiskReport) -> Self {
        Self {
            user_id: report.user_id,
            academy_id: report.academy_id,
            report_date: report.report_date,
            churn_risk_score: report.churn_risk_score,
            risk_level: report.risk_level.as_str(),
            days_since_last_activity: report.days_since_last_activity,
            login_count_7d: report.login_count_7d,
            login_trend: report.login_trend,
            assignments_completed_7d: report.assignments_completed_7d,
            assignment_trend: report.assignment_trend,
            avg_frustration_score: report.avg_frustration_score,
            avg_engagement_score: report.avg_engagement_score,
            subscription_status: report.subscription_status.as_str(),
            days_until_renewal: report.days_until_renewal,
            has_payment_issues: report.has_payment_issues,
        }
    }
}

/// Row returned by the "top risk for a date" listing.
#[derive(Debug, Clone)]
pub struct RiskListing {
    pub user_id: i64,
    pub academy_id: Option<i64>,
    pub churn_risk_score: f64,
    pub risk_level: String,
    pub days_since_last_activity: i64,
}

/// Row returned by the alert listings.
#[derive(Debug, Clone)]
pub struct AlertListing {
    pub user_id: i64,
    pub academy_id: Option<i64>,
    pub alert_type: String,
    pub severity: String,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl fmt::Display for AlertListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} user {} (academy {}) {} [{}]",
            self.triggered_at.format("%Y-%m-%d %H:%M"),
            self.user_id,
            self.academy_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            self.alert_type,
            self.severity
        )?;
        if self.resolved_at.is_some() {
            write!(f, " resolved")?;
        }
        Ok(())
    }
}
