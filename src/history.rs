use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::evaluation::{self, Evaluation};
use crate::models::{NewSubmission, UserProfile};
use crate::month::YearMonth;

pub const HISTORY_LIMIT: i64 = 50;

/// Feedback document stored alongside each submission, one entry per photo.
pub fn feedback_document(luggage: &Evaluation, toolbox: &Evaluation) -> Value {
    json!({
        "luggage": {
            "score": luggage.score,
            "comment": luggage.comment,
        },
        "toolbox": {
            "score": toolbox.score,
            "comment": toolbox.comment,
        },
    })
}

/// This month's row for `user`, built from the luggage photo's and the
/// toolbox photo's evaluations.
pub fn new_submission(
    user: &UserProfile,
    luggage: &Evaluation,
    toolbox: &Evaluation,
    luggage_image_url: Option<String>,
    toolbox_image_url: Option<String>,
    now: DateTime<Utc>,
) -> NewSubmission {
    NewSubmission {
        user_id: user.id,
        email: user.email.clone(),
        year_month: YearMonth::of(now).to_string(),
        luggage_image_url,
        toolbox_image_url,
        luggage_score: luggage.score as i32,
        toolbox_score: toolbox.score as i32,
        luggage_feedback: luggage.comment.clone(),
        toolbox_feedback: toolbox.comment.clone(),
        ai_score: evaluation::submission_score(luggage.score, toolbox.score) as i32,
        ai_feedback: feedback_document(luggage, toolbox),
        created_at: now,
    }
}

/// Stored feedback is text; anything that does not decode is dropped.
pub fn decode_feedback(raw: Option<String>) -> Option<Value> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Failed to parse stored ai_feedback: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::parse_evaluation;
    use crate::models::Role;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn kenji() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            email: "kenji.watanabe@fieldcrew.jp".to_string(),
            display_name: Some("Kenji Watanabe".to_string()),
            role: Role::User,
            department: Some("Installation".to_string()),
            admin_notes: None,
            created_at: Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn submission_uses_each_photo_overall_score() {
        let luggage = parse_evaluation(
            r#"{"荷台": {"score": 100, "comment": "bed swept"}, "道具収納": {"score": 81, "comment": "straps coiled"}}"#,
        )
        .unwrap();
        let toolbox = parse_evaluation(
            r#"{"荷台": {"score": 70, "comment": "crate loose"}, "道具収納": {"score": 74, "comment": "bits sorted"}}"#,
        )
        .unwrap();
        assert_eq!(luggage.score, 91);
        assert_eq!(toolbox.score, 72);

        let user = kenji();
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 8, 30, 0).unwrap();
        let row = new_submission(
            &user,
            &luggage,
            &toolbox,
            Some("luggage/kenji.jpg".to_string()),
            None,
            now,
        );

        assert_eq!(row.user_id, user.id);
        assert_eq!(row.year_month, "2026-10");
        assert_eq!(row.luggage_score, 91);
        assert_eq!(row.toolbox_score, 72);
        // (91 + 72) / 2 = 81.5
        assert_eq!(row.ai_score, 82);
        assert_eq!(row.luggage_feedback, luggage.comment);
        assert!(row.toolbox_feedback.contains("bits sorted"));
        assert_eq!(row.ai_feedback["luggage"]["score"], 91);
        assert_eq!(row.ai_feedback["toolbox"]["comment"], toolbox.comment.as_str());
        assert_eq!(row.toolbox_image_url, None);
        assert_eq!(row.created_at, now);
    }

    #[test]
    fn undecodable_feedback_becomes_none() {
        assert_eq!(decode_feedback(None), None);
        assert_eq!(decode_feedback(Some("{broken".to_string())), None);
        assert_eq!(
            decode_feedback(Some(r#"{"luggage": {"score": 70}}"#.to_string())),
            Some(json!({"luggage": {"score": 70}}))
        );
    }
}
