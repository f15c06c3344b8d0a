use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const UNNAMED_USER: &str = "Unnamed user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn parse(value: &str) -> Role {
        match value {
            "admin" => Role::Admin,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub role: Role,
    pub department: Option<String>,
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| UNNAMED_USER.to_string())
    }
}

/// The slice of a submission row the statistics need.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub user_id: Uuid,
    pub ai_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub year_month: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub year_month: String,
    pub ai_score: Option<f64>,
    pub luggage_score: Option<i32>,
    pub toolbox_score: Option<i32>,
    pub luggage_image_url: Option<String>,
    pub toolbox_image_url: Option<String>,
    pub ai_feedback: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub user_id: Uuid,
    pub email: String,
    pub year_month: String,
    pub luggage_image_url: Option<String>,
    pub toolbox_image_url: Option<String>,
    pub luggage_score: i32,
    pub toolbox_score: i32,
    pub luggage_feedback: String,
    pub toolbox_feedback: String,
    pub ai_score: i32,
    pub ai_feedback: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecuritySettings {
    pub allowed_domains: Vec<String>,
    pub registration_code: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub department: Option<String>,
    pub admin_notes: Option<String>,
    pub avg_score_3months: Option<f64>,
    pub last_submission_date: Option<DateTime<Utc>>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsReport {
    pub overall: OverallStats,
    pub monthly_submissions: Vec<MonthlyCount>,
    pub score_distribution: ScoreDistribution,
    pub monthly_avg_scores: Vec<MonthlyAverage>,
    pub top_performers: Vec<TopPerformer>,
    pub low_submission_users: Vec<LowSubmissionUser>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OverallStats {
    pub avg_score_3months: Option<f64>,
    pub total_users: usize,
    pub total_submissions: i64,
    pub active_users_3months: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonthlyCount {
    pub year_month: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonthlyAverage {
    pub year_month: String,
    pub avg_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScoreDistribution {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub needs_improvement: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TopPerformer {
    pub id: Uuid,
    pub display_name: String,
    pub department: Option<String>,
    pub avg_score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LowSubmissionUser {
    pub id: Uuid,
    pub display_name: String,
    pub department: Option<String>,
    pub submission_count_3months: usize,
}
