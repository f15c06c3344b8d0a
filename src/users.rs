use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Role, SubmissionRecord, UserProfile, UserSummary};
use crate::stats::{in_window, valid_score, ScoreTally};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdminError {
    #[error("no account found for {0}")]
    Unauthenticated(String),

    #[error("{0} is not an administrator")]
    Forbidden(String),

    #[error("user {0} not found")]
    UserNotFound(Uuid),

    #[error("administrators cannot delete their own account")]
    SelfDeletion,

    #[error("nothing to update")]
    EmptyUpdate,
}

/// Fails unless `profile` exists and carries the admin role.
pub fn ensure_admin(email: &str, profile: Option<&UserProfile>) -> Result<Uuid, AdminError> {
    match profile {
        None => Err(AdminError::Unauthenticated(email.to_string())),
        Some(profile) if profile.role != Role::Admin => Err(AdminError::Forbidden(email.to_string())),
        Some(profile) => Ok(profile.id),
    }
}

pub fn ensure_not_self(acting_admin: Uuid, target: Uuid) -> Result<(), AdminError> {
    if acting_admin == target {
        return Err(AdminError::SelfDeletion);
    }
    Ok(())
}

/// `None` leaves a field alone, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub department: Option<Option<String>>,
    pub admin_notes: Option<Option<String>>,
}

impl ProfileUpdate {
    pub fn sanitized(self) -> Result<ProfileUpdate, AdminError> {
        let trim = |value: Option<Option<String>>| value.map(|inner| inner.map(|s| s.trim().to_string()));
        let update = ProfileUpdate {
            department: trim(self.department),
            admin_notes: trim(self.admin_notes),
        };

        if update.department.is_none() && update.admin_notes.is_none() {
            return Err(AdminError::EmptyUpdate);
        }
        Ok(update)
    }

    pub fn describe(&self) -> String {
        let mut fields = Vec::new();
        if self.department.is_some() {
            fields.push("department");
        }
        if self.admin_notes.is_some() {
            fields.push("admin_notes");
        }
        format!("updated {}", fields.join(", "))
    }
}

/// Builds the admin directory rows. `recent` are submissions from the
/// three-month window, `latest` maps users to their newest submission.
pub fn summarize_users(
    users: &[UserProfile],
    recent: &[SubmissionRecord],
    latest: &HashMap<Uuid, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Vec<UserSummary> {
    let mut tallies: HashMap<Uuid, ScoreTally> = HashMap::new();

    for submission in recent
        .iter()
        .filter(|submission| in_window(submission.created_at, now))
    {
        if let Some(score) = valid_score(submission.ai_score) {
            tallies.entry(submission.user_id).or_default().add(score);
        }
    }

    let mut rows: Vec<UserSummary> = users
        .iter()
        .map(|user| UserSummary {
            id: user.id,
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            department: user.department.clone(),
            admin_notes: user.admin_notes.clone(),
            avg_score_3months: tallies.get(&user.id).and_then(ScoreTally::average),
            last_submission_date: latest.get(&user.id).copied(),
            role: user.role,
            created_at: user.created_at,
        })
        .collect();

    rows.sort_by_key(|row| row.created_at);
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn profile(role: Role, created_day: u32) -> UserProfile {
        let created = Utc.with_ymd_and_hms(2024, 6, created_day, 0, 0, 0).unwrap();
        UserProfile {
            id: Uuid::new_v4(),
            email: "someone@example.com".to_string(),
            display_name: Some("Someone".to_string()),
            role,
            department: None,
            admin_notes: None,
            created_at: created,
        }
    }

    #[test]
    fn admin_check_distinguishes_missing_and_forbidden() {
        let admin = profile(Role::Admin, 1);
        let worker = profile(Role::User, 2);
        assert_eq!(ensure_admin("a@x.jp", Some(&admin)), Ok(admin.id));
        assert_eq!(
            ensure_admin("w@x.jp", Some(&worker)),
            Err(AdminError::Forbidden("w@x.jp".to_string()))
        );
        assert_eq!(
            ensure_admin("ghost@x.jp", None),
            Err(AdminError::Unauthenticated("ghost@x.jp".to_string()))
        );
    }

    #[test]
    fn refuses_self_deletion() {
        let id = Uuid::new_v4();
        assert_eq!(ensure_not_self(id, id), Err(AdminError::SelfDeletion));
        assert_eq!(ensure_not_self(id, Uuid::new_v4()), Ok(()));
    }

    #[test]
    fn update_trims_and_rejects_empty() {
        let update = ProfileUpdate {
            department: Some(Some("  Logistics ".to_string())),
            admin_notes: Some(None),
        }
        .sanitized()
        .unwrap();
        assert_eq!(update.department, Some(Some("Logistics".to_string())));
        assert_eq!(update.admin_notes, Some(None));
        assert_eq!(update.describe(), "updated department, admin_notes");

        assert_eq!(ProfileUpdate::default().sanitized(), Err(AdminError::EmptyUpdate));
    }

    #[test]
    fn summaries_carry_window_average_and_last_date() {
        let now = Utc.with_ymd_and_hms(2025, 3, 20, 0, 0, 0).unwrap();
        let late = profile(Role::User, 20);
        let early = profile(Role::Admin, 3);
        let last = Utc.with_ymd_and_hms(2025, 3, 2, 0, 0, 0).unwrap();
        let recent = vec![
            SubmissionRecord {
                user_id: late.id,
                ai_score: Some(77.0),
                created_at: last,
                year_month: Some("2025-03".to_string()),
            },
            SubmissionRecord {
                user_id: late.id,
                ai_score: Some(80.0),
                created_at: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
                year_month: Some("2025-01".to_string()),
            },
            SubmissionRecord {
                user_id: late.id,
                ai_score: Some(10.0),
                created_at: Utc.with_ymd_and_hms(2024, 12, 2, 0, 0, 0).unwrap(),
                year_month: Some("2024-12".to_string()),
            },
        ];
        let latest = HashMap::from([(late.id, last)]);

        let rows = summarize_users(&[late.clone(), early.clone()], &recent, &latest, now);

        assert_eq!(rows[0].id, early.id);
        assert_eq!(rows[0].avg_score_3months, None);
        assert_eq!(rows[0].last_submission_date, None);
        assert_eq!(rows[1].avg_score_3months, Some(78.5));
        assert_eq!(rows[1].last_submission_date, Some(last));
    }
}
