use std::collections::HashMap;

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::auth::{AttemptState, SettingsUpdate};
use crate::history;
use crate::models::{
    HistoryEntry, NewSubmission, Role, SecuritySettings, SubmissionRecord, UserProfile,
};
use crate::users::ProfileUpdate;

const PROFILE_COLUMNS: &str = "id, email, display_name, role, department, admin_notes, created_at";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn profile_from_row(row: &PgRow) -> UserProfile {
    let role: String = row.get("role");
    UserProfile {
        id: row.get("id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        role: Role::parse(&role),
        department: row.get("department"),
        admin_notes: row.get("admin_notes"),
        created_at: row.get("created_at"),
    }
}

fn submission_from_row(row: &PgRow) -> SubmissionRecord {
    SubmissionRecord {
        user_id: row.get("user_id"),
        ai_score: row.get("ai_score"),
        created_at: row.get("created_at"),
        year_month: row.get("year_month"),
    }
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let profiles = vec![
        (
            Uuid::parse_str("6a1f0f4e-5d0a-4c53-9d38-0c2f6b1e9a10")?,
            "Haruka Sato",
            "haruka.sato@fieldcrew.jp",
            "admin",
            Some("Operations"),
        ),
        (
            Uuid::parse_str("b8e2c7a4-1f36-4e0b-8a51-2d7c9e3f4b21")?,
            "Kenji Watanabe",
            "kenji.watanabe@fieldcrew.jp",
            "user",
            Some("Installation"),
        ),
        (
            Uuid::parse_str("2f9d4c1b-7e58-4a2f-b6c3-5e8a1d0f7c32")?,
            "Mika Tanaka",
            "mika.tanaka@fieldcrew.jp",
            "user",
            None,
        ),
    ];

    for (id, name, email, role, department) in profiles {
        sqlx::query(
            r#"
            INSERT INTO orderlog.user_profiles (id, email, display_name, role, department)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (email) DO UPDATE
            SET display_name = EXCLUDED.display_name, department = EXCLUDED.department
            "#,
        )
        .bind(id)
        .bind(email)
        .bind(name)
        .bind(role)
        .bind(department)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO orderlog.security_settings (id, allowed_domains, registration_code)
        VALUES (1, $1, $2)
        ON CONFLICT (id) DO UPDATE
        SET allowed_domains = EXCLUDED.allowed_domains,
            registration_code = EXCLUDED.registration_code,
            updated_at = now()
        "#,
    )
    .bind(vec!["fieldcrew.jp".to_string()])
    .bind("4821")
    .execute(pool)
    .await?;

    let submissions = vec![
        ("kenji.watanabe@fieldcrew.jp", (2026, 8, 4), 88.0),
        ("kenji.watanabe@fieldcrew.jp", (2026, 9, 2), 91.0),
        ("kenji.watanabe@fieldcrew.jp", (2026, 10, 6), 86.0),
        ("mika.tanaka@fieldcrew.jp", (2026, 6, 12), 64.0),
        ("mika.tanaka@fieldcrew.jp", (2026, 10, 1), 73.0),
        ("haruka.sato@fieldcrew.jp", (2026, 9, 18), 95.0),
    ];

    for (email, (year, month, day), score) in submissions {
        let created_at = Utc
            .with_ymd_and_hms(year, month, day, 9, 0, 0)
            .single()
            .context("invalid date")?;
        let user_id: Uuid = sqlx::query("SELECT id FROM orderlog.user_profiles WHERE email = $1")
            .bind(email)
            .fetch_one(pool)
            .await?
            .get("id");

        sqlx::query(
            r#"
            INSERT INTO orderlog.submissions
            (id, user_id, email, year_month, ai_score, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (user_id, year_month) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(email)
        .bind(format!("{year:04}-{month:02}"))
        .bind(score)
        .bind(created_at)
        .execute(pool)
        .await?;
    }

    Ok(())
}

pub async fn fetch_users(pool: &PgPool) -> anyhow::Result<Vec<UserProfile>> {
    let query = format!(
        "SELECT {PROFILE_COLUMNS} FROM orderlog.user_profiles ORDER BY created_at ASC"
    );
    let rows = sqlx::query(&query).fetch_all(pool).await?;
    Ok(rows.iter().map(profile_from_row).collect())
}

pub async fn find_user_by_email(pool: &PgPool, email: &str) -> anyhow::Result<Option<UserProfile>> {
    let query = format!("SELECT {PROFILE_COLUMNS} FROM orderlog.user_profiles WHERE email = $1");
    let row = sqlx::query(&query).bind(email).fetch_optional(pool).await?;
    Ok(row.as_ref().map(profile_from_row))
}

pub async fn find_user(pool: &PgPool, id: Uuid) -> anyhow::Result<Option<UserProfile>> {
    let query = format!("SELECT {PROFILE_COLUMNS} FROM orderlog.user_profiles WHERE id = $1");
    let row = sqlx::query(&query).bind(id).fetch_optional(pool).await?;
    Ok(row.as_ref().map(profile_from_row))
}

pub async fn count_submissions(pool: &PgPool) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query("SELECT COUNT(*) AS total FROM orderlog.submissions")
        .fetch_one(pool)
        .await?
        .get("total");
    Ok(count)
}

pub async fn fetch_submissions_between(
    pool: &PgPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> anyhow::Result<Vec<SubmissionRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT user_id, ai_score, created_at, year_month
        FROM orderlog.submissions
        WHERE created_at >= $1 AND created_at <= $2
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(submission_from_row).collect())
}

pub async fn fetch_last_submission_dates(
    pool: &PgPool,
) -> anyhow::Result<HashMap<Uuid, DateTime<Utc>>> {
    let rows = sqlx::query(
        "SELECT user_id, MAX(created_at) AS last_at FROM orderlog.submissions GROUP BY user_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let user_id: Uuid = row.get("user_id");
            let last_at: DateTime<Utc> = row.get("last_at");
            (user_id, last_at)
        })
        .collect())
}

pub async fn fetch_history(
    pool: &PgPool,
    user_id: Uuid,
    limit: i64,
) -> anyhow::Result<Vec<HistoryEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, year_month, ai_score, luggage_score, toolbox_score,
               luggage_image_url, toolbox_image_url, ai_feedback, created_at
        FROM orderlog.submissions
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| HistoryEntry {
            id: row.get("id"),
            year_month: row.get("year_month"),
            ai_score: row.get("ai_score"),
            luggage_score: row.get("luggage_score"),
            toolbox_score: row.get("toolbox_score"),
            luggage_image_url: row.get("luggage_image_url"),
            toolbox_image_url: row.get("toolbox_image_url"),
            ai_feedback: history::decode_feedback(row.get("ai_feedback")),
            created_at: row.get("created_at"),
        })
        .collect())
}

/// One submission per user per month; a resubmission replaces the month's row.
pub async fn upsert_submission(pool: &PgPool, submission: &NewSubmission) -> anyhow::Result<Uuid> {
    let id: Uuid = sqlx::query(
        r#"
        INSERT INTO orderlog.submissions
        (id, user_id, email, year_month, luggage_image_url, toolbox_image_url,
         luggage_score, toolbox_score, luggage_feedback, toolbox_feedback,
         ai_score, ai_feedback, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
        ON CONFLICT (user_id, year_month) DO UPDATE
        SET luggage_image_url = EXCLUDED.luggage_image_url,
            toolbox_image_url = EXCLUDED.toolbox_image_url,
            luggage_score = EXCLUDED.luggage_score,
            toolbox_score = EXCLUDED.toolbox_score,
            luggage_feedback = EXCLUDED.luggage_feedback,
            toolbox_feedback = EXCLUDED.toolbox_feedback,
            ai_score = EXCLUDED.ai_score,
            ai_feedback = EXCLUDED.ai_feedback,
            created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(submission.user_id)
    .bind(&submission.email)
    .bind(&submission.year_month)
    .bind(&submission.luggage_image_url)
    .bind(&submission.toolbox_image_url)
    .bind(submission.luggage_score)
    .bind(submission.toolbox_score)
    .bind(&submission.luggage_feedback)
    .bind(&submission.toolbox_feedback)
    .bind(submission.ai_score as f64)
    .bind(submission.ai_feedback.to_string())
    .bind(submission.created_at)
    .fetch_one(pool)
    .await?
    .get("id");

    Ok(id)
}

fn settings_from_row(row: &PgRow) -> SecuritySettings {
    SecuritySettings {
        allowed_domains: row.get("allowed_domains"),
        registration_code: row.get("registration_code"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn fetch_settings(pool: &PgPool) -> anyhow::Result<SecuritySettings> {
    let row = sqlx::query(
        "SELECT allowed_domains, registration_code, updated_at FROM orderlog.security_settings WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(row) => settings_from_row(&row),
        None => {
            warn!("security_settings row missing, treating as empty");
            SecuritySettings {
                allowed_domains: Vec::new(),
                registration_code: String::new(),
                updated_at: Utc::now(),
            }
        }
    })
}

pub async fn update_settings(
    pool: &PgPool,
    update: &SettingsUpdate,
) -> anyhow::Result<SecuritySettings> {
    let row = sqlx::query(
        r#"
        UPDATE orderlog.security_settings
        SET allowed_domains = COALESCE($1::text[], allowed_domains),
            registration_code = COALESCE($2::text, registration_code),
            updated_at = now()
        WHERE id = 1
        RETURNING allowed_domains, registration_code, updated_at
        "#,
    )
    .bind(&update.allowed_domains)
    .bind(&update.registration_code)
    .fetch_optional(pool)
    .await?
    .context("security settings not found, run init-db first")?;

    Ok(settings_from_row(&row))
}

pub async fn update_profile(
    pool: &PgPool,
    id: Uuid,
    update: &ProfileUpdate,
) -> anyhow::Result<Option<UserProfile>> {
    let query = format!(
        r#"
        UPDATE orderlog.user_profiles
        SET department = CASE WHEN $2::bool THEN $3::text ELSE department END,
            admin_notes = CASE WHEN $4::bool THEN $5::text ELSE admin_notes END,
            updated_at = now()
        WHERE id = $1
        RETURNING {PROFILE_COLUMNS}
        "#
    );

    let row = sqlx::query(&query)
        .bind(id)
        .bind(update.department.is_some())
        .bind(update.department.clone().flatten())
        .bind(update.admin_notes.is_some())
        .bind(update.admin_notes.clone().flatten())
        .fetch_optional(pool)
        .await?;

    Ok(row.as_ref().map(profile_from_row))
}

pub async fn delete_profile(pool: &PgPool, id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM orderlog.user_profiles WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn log_admin_action(
    pool: &PgPool,
    admin_email: &str,
    action: &str,
    target_user_email: Option<&str>,
    details: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orderlog.admin_logs (id, admin_email, action, target_user_email, details)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(admin_email)
    .bind(action)
    .bind(target_user_email)
    .bind(details)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn load_attempts(pool: &PgPool, email: &str) -> anyhow::Result<AttemptState> {
    let row = sqlx::query(
        "SELECT attempts, locked_until, last_link_sent_at FROM orderlog.auth_throttle WHERE email = $1",
    )
    .bind(email)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|row| AttemptState {
            attempts: row.get("attempts"),
            locked_until: row.get("locked_until"),
            last_link_sent_at: row.get("last_link_sent_at"),
        })
        .unwrap_or_default())
}

pub async fn save_attempts(pool: &PgPool, email: &str, state: &AttemptState) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO orderlog.auth_throttle (email, attempts, locked_until, last_link_sent_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (email) DO UPDATE
        SET attempts = EXCLUDED.attempts,
            locked_until = EXCLUDED.locked_until,
            last_link_sent_at = EXCLUDED.last_link_sent_at
        "#,
    )
    .bind(email)
    .bind(state.attempts)
    .bind(state.locked_until)
    .bind(state.last_link_sent_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        email: String,
        display_name: Option<String>,
        department: Option<String>,
        year_month: Option<String>,
        ai_score: Option<f64>,
        created_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut written = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let user_id: Uuid = sqlx::query(
            r#"
            INSERT INTO orderlog.user_profiles (id, email, display_name, department)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO UPDATE
            SET display_name = COALESCE(EXCLUDED.display_name, orderlog.user_profiles.display_name),
                department = COALESCE(EXCLUDED.department, orderlog.user_profiles.department)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&row.email)
        .bind(&row.display_name)
        .bind(&row.department)
        .fetch_one(pool)
        .await?
        .get("id");

        let year_month = row
            .year_month
            .unwrap_or_else(|| row.created_at.format("%Y-%m").to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO orderlog.submissions
            (id, user_id, email, year_month, ai_score, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (user_id, year_month) DO UPDATE
            SET ai_score = EXCLUDED.ai_score, created_at = EXCLUDED.created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&row.email)
        .bind(&year_month)
        .bind(row.ai_score)
        .bind(row.created_at)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            written += 1;
        }
    }

    Ok(written)
}
