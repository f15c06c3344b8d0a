//! Parsing of the vision model's replies.
//!
//! The model is asked for JSON but tends to wrap it in prose or code fences,
//! so every reply goes through [`extract_json`] before deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const MIN_SCORE: i64 = 20;
pub const MAX_SCORE: i64 = 98;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("empty reply from the model for {0}")]
    EmptyReply(&'static str),

    #[error("no JSON object in the model reply for {0}")]
    NoJson(&'static str),

    #[error("malformed JSON in the model reply for {label}: {source}")]
    Malformed {
        label: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("image was not recognised as cargo area or tool storage: {reason}")]
    Rejected {
        category: Option<String>,
        reason: String,
    },
}

/// Pulls the outermost `{ ... }` span out of a free-form reply.
pub fn extract_json(raw: &str, label: &'static str) -> Result<Value, EvaluationError> {
    if raw.trim().is_empty() {
        return Err(EvaluationError::EmptyReply(label));
    }

    let (Some(open), Some(close)) = (raw.find('{'), raw.rfind('}')) else {
        return Err(EvaluationError::NoJson(label));
    };
    if close < open {
        return Err(EvaluationError::NoJson(label));
    }

    serde_json::from_str(&raw[open..=close])
        .map_err(|source| EvaluationError::Malformed { label, source })
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Verification {
    #[serde(rename = "isValid", default)]
    pub is_valid: Value,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Accepts the image only when the model answered `"isValid": true`.
pub fn check_verification(raw: &str) -> Result<Verification, EvaluationError> {
    let value = extract_json(raw, "verification result")?;
    let verification: Verification = serde_json::from_value(value).map_err(|source| {
        EvaluationError::Malformed {
            label: "verification result",
            source,
        }
    })?;

    if verification.is_valid != Value::Bool(true) {
        warn!(category = ?verification.category, "image failed verification");
        return Err(EvaluationError::Rejected {
            category: verification.category.clone(),
            reason: verification
                .reason
                .clone()
                .unwrap_or_else(|| "the model reply could not be interpreted".to_string()),
        });
    }

    Ok(verification)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawPart {
    #[serde(default)]
    score: Value,
    #[serde(default)]
    comment: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawEvaluation {
    #[serde(rename = "荷台", default)]
    cargo: RawPart,
    #[serde(rename = "道具収納", default)]
    toolbox: RawPart,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartScore {
    pub score: i64,
    pub comment: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evaluation {
    pub score: i64,
    pub comment: String,
    pub cargo: PartScore,
    pub toolbox: PartScore,
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64().filter(|number| number.is_finite())
}

/// Round, then clamp into the scoring range; anything non-numeric is 0.
pub fn clamp_score(value: &Value) -> i64 {
    match numeric(value) {
        Some(number) => (number.round() as i64).clamp(MIN_SCORE, MAX_SCORE),
        None => 0,
    }
}

fn part(raw: &RawPart) -> PartScore {
    PartScore {
        score: clamp_score(&raw.score),
        comment: raw.comment.as_str().unwrap_or_default().to_string(),
    }
}

fn score_label(score: i64) -> String {
    if score == 0 {
        "N/A".to_string()
    } else {
        score.to_string()
    }
}

pub fn parse_evaluation(raw: &str) -> Result<Evaluation, EvaluationError> {
    let value = extract_json(raw, "evaluation result")?;
    let parsed: RawEvaluation =
        serde_json::from_value(value).map_err(|source| EvaluationError::Malformed {
            label: "evaluation result",
            source,
        })?;

    let valid: Vec<f64> = [&parsed.cargo.score, &parsed.toolbox.score]
        .into_iter()
        .filter_map(numeric)
        .collect();

    let mut score = if valid.is_empty() {
        0
    } else {
        (valid.iter().sum::<f64>() / valid.len() as f64).round() as i64
    };
    if score > 0 {
        score = score.clamp(MIN_SCORE, MAX_SCORE);
    }

    let cargo = part(&parsed.cargo);
    let toolbox = part(&parsed.toolbox);
    let comment = format!(
        "[Cargo area]\nScore: {}\n{}\n\n[Tool storage]\nScore: {}\n{}",
        score_label(cargo.score),
        cargo.comment,
        score_label(toolbox.score),
        toolbox.comment
    );

    Ok(Evaluation {
        score,
        comment,
        cargo,
        toolbox,
    })
}

/// Stored submission score: mean of the two part scores, rounded.
pub fn submission_score(luggage: i64, toolbox: i64) -> i64 {
    ((luggage + toolbox) as f64 / 2.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let raw = "Sure! ```json\n{\"isValid\": true, \"category\": \"cargo\"}\n``` hope it helps";
        let value = extract_json(raw, "test").unwrap();
        assert_eq!(value["category"], "cargo");
    }

    #[test]
    fn extract_reports_each_failure() {
        assert!(matches!(extract_json("   ", "x"), Err(EvaluationError::EmptyReply(_))));
        assert!(matches!(extract_json("no braces", "x"), Err(EvaluationError::NoJson(_))));
        assert!(matches!(extract_json("} backwards {", "x"), Err(EvaluationError::NoJson(_))));
        assert!(matches!(
            extract_json("{not json}", "x"),
            Err(EvaluationError::Malformed { .. })
        ));
    }

    #[test]
    fn verification_requires_literal_true() {
        assert!(check_verification(r#"{"isValid": true, "reason": "toolbox"}"#).is_ok());

        let err = check_verification(r#"{"isValid": "true"}"#).unwrap_err();
        assert!(matches!(err, EvaluationError::Rejected { .. }));

        let err = check_verification(r#"{"isValid": false, "category": "food", "reason": "a plate"}"#)
            .unwrap_err();
        match err {
            EvaluationError::Rejected { category, reason } => {
                assert_eq!(category.as_deref(), Some("food"));
                assert_eq!(reason, "a plate");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn clamps_part_scores() {
        assert_eq!(clamp_score(&Value::from(99.6)), 98);
        assert_eq!(clamp_score(&Value::from(5)), 20);
        assert_eq!(clamp_score(&Value::from(74.5)), 75);
        assert_eq!(clamp_score(&Value::from("80")), 0);
        assert_eq!(clamp_score(&Value::Null), 0);
    }

    #[test]
    fn evaluation_averages_raw_scores() {
        let raw = r#"{"荷台": {"score": 81, "comment": "tidy"}, "道具収納": {"score": 100, "comment": "sorted"}}"#;
        let evaluation = parse_evaluation(raw).unwrap();
        assert_eq!(evaluation.cargo.score, 81);
        assert_eq!(evaluation.toolbox.score, 98);
        // mean of the raw scores is 90.5
        assert_eq!(evaluation.score, 91);
        assert!(evaluation.comment.contains("tidy"));
        assert!(evaluation.comment.contains("Score: 98"));
    }

    #[test]
    fn evaluation_with_one_missing_part() {
        let raw = r#"{"荷台": {"score": 64, "comment": "ok"}}"#;
        let evaluation = parse_evaluation(raw).unwrap();
        assert_eq!(evaluation.score, 64);
        assert_eq!(evaluation.toolbox.score, 0);
        assert_eq!(evaluation.toolbox.comment, "");
        assert!(evaluation.comment.contains("Score: N/A"));
    }

    #[test]
    fn evaluation_without_scores_is_zero() {
        let evaluation = parse_evaluation("{}").unwrap();
        assert_eq!(evaluation.score, 0);
    }

    #[test]
    fn submission_score_rounds_half_up() {
        assert_eq!(submission_score(80, 91), 86);
        assert_eq!(submission_score(70, 70), 70);
    }
}
