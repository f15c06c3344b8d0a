use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod auth;
mod config;
mod db;
mod evaluation;
mod history;
mod models;
mod month;
mod report;
mod stats;
mod users;

use auth::AccessError;
use config::Config;
use users::{AdminError, ProfileUpdate};

#[derive(Parser)]
#[command(name = "orderlog")]
#[command(about = "Monthly cargo and tool storage tidiness log", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import scored submissions from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Print aggregate statistics as JSON
    Stats {
        #[arg(long)]
        admin: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        admin: String,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// List users with their recent average and last submission
    Users {
        #[arg(long)]
        admin: String,
    },
    /// Change a user's department or admin notes
    #[command(group(
        ArgGroup::new("changes")
            .args(["department", "admin_notes", "clear_department", "clear_notes"])
            .required(true)
            .multiple(true)
    ))]
    UpdateUser {
        #[arg(long)]
        admin: String,
        #[arg(long)]
        id: Uuid,
        #[arg(long, conflicts_with = "clear_department")]
        department: Option<String>,
        #[arg(long, conflicts_with = "clear_notes")]
        admin_notes: Option<String>,
        #[arg(long)]
        clear_department: bool,
        #[arg(long)]
        clear_notes: bool,
    },
    /// Remove a user profile and its submissions
    DeleteUser {
        #[arg(long)]
        admin: String,
        #[arg(long)]
        id: Uuid,
    },
    /// Show a user's submission history
    History {
        #[arg(long)]
        email: String,
    },
    /// Record this month's submission from the two photo evaluations
    Submit {
        #[arg(long)]
        email: String,
        /// File holding the raw evaluation reply for the luggage photo
        #[arg(long)]
        luggage_response: PathBuf,
        /// File holding the raw evaluation reply for the toolbox photo
        #[arg(long)]
        toolbox_response: PathBuf,
        /// Verification reply for the luggage photo, checked first when given
        #[arg(long)]
        luggage_verification: Option<PathBuf>,
        /// Verification reply for the toolbox photo, checked first when given
        #[arg(long)]
        toolbox_verification: Option<PathBuf>,
        #[arg(long)]
        luggage_url: Option<String>,
        #[arg(long)]
        toolbox_url: Option<String>,
    },
    /// Check a model verification reply for an uploaded image
    CheckImage {
        #[arg(long)]
        response: PathBuf,
    },
    /// Show or change security settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// Check a registration code
    VerifyCode {
        #[arg(long)]
        code: String,
    },
    /// Decide whether a magic link may be sent to an address
    RequestLink {
        #[arg(long)]
        email: String,
        #[arg(long)]
        code: Option<String>,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show {
        #[arg(long)]
        admin: String,
    },
    #[command(group(
        ArgGroup::new("changes")
            .args(["domains", "code"])
            .required(true)
            .multiple(true)
    ))]
    Set {
        #[arg(long)]
        admin: String,
        /// Comma-separated list of allowed e-mail domains
        #[arg(long, value_delimiter = ',')]
        domains: Option<Vec<String>>,
        #[arg(long)]
        code: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_reply(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn check_image(path: &Path) -> anyhow::Result<()> {
    let verification = evaluation::check_verification(&read_reply(path)?)?;
    print_json(&verification)
}

/// Verifies (when a verification reply is given) and scores one photo.
fn evaluate_photo(
    response: &Path,
    verification: Option<&Path>,
) -> anyhow::Result<evaluation::Evaluation> {
    if let Some(path) = verification {
        evaluation::check_verification(&read_reply(path)?)?;
    }
    Ok(evaluation::parse_evaluation(&read_reply(response)?)?)
}

async fn require_admin(pool: &PgPool, email: &str) -> anyhow::Result<Uuid> {
    let profile = db::find_user_by_email(pool, email).await?;
    Ok(users::ensure_admin(email, profile.as_ref())?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("orderlog=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // the only command that never touches the database
    match cli.command {
        Commands::CheckImage { response } => check_image(&response),
        command => run(command).await,
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let config = Config::load()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    match command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let written = db::import_csv(&pool, &csv).await?;
            println!("Imported {written} submissions from {}.", csv.display());
        }
        Commands::Stats { admin, out } => {
            require_admin(&pool, &admin).await?;
            let stats = load_stats(&pool).await?;
            let json = serde_json::to_string_pretty(&stats)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Statistics written to {}.", path.display());
                }
                None => println!("{json}"),
            }
        }
        Commands::Report { admin, out } => {
            require_admin(&pool, &admin).await?;
            let stats = load_stats(&pool).await?;
            let report = report::build_report(&stats, Utc::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Users { admin } => {
            require_admin(&pool, &admin).await?;
            let now = Utc::now();
            let profiles = db::fetch_users(&pool).await?;
            let recent =
                db::fetch_submissions_between(&pool, stats::window_start(now), now).await?;
            let latest = db::fetch_last_submission_dates(&pool).await?;
            print_json(&users::summarize_users(&profiles, &recent, &latest, now))?;
        }
        Commands::UpdateUser {
            admin,
            id,
            department,
            admin_notes,
            clear_department,
            clear_notes,
        } => {
            require_admin(&pool, &admin).await?;
            let update = ProfileUpdate {
                department: if clear_department {
                    Some(None)
                } else {
                    department.map(Some)
                },
                admin_notes: if clear_notes {
                    Some(None)
                } else {
                    admin_notes.map(Some)
                },
            }
            .sanitized()?;

            let updated = db::update_profile(&pool, id, &update)
                .await?
                .ok_or(AdminError::UserNotFound(id))?;
            db::log_admin_action(
                &pool,
                &admin,
                "update_user",
                Some(&updated.email),
                Some(&update.describe()),
            )
            .await?;
            info!(user = %updated.id, "profile updated");
            println!("Updated {} ({}).", updated.label(), updated.email);
        }
        Commands::DeleteUser { admin, id } => {
            let admin_id = require_admin(&pool, &admin).await?;
            users::ensure_not_self(admin_id, id)?;
            let target = db::find_user(&pool, id)
                .await?
                .ok_or(AdminError::UserNotFound(id))?;
            if !db::delete_profile(&pool, id).await? {
                return Err(AdminError::UserNotFound(id).into());
            }
            db::log_admin_action(&pool, &admin, "delete_user", Some(&target.email), None).await?;
            info!(user = %id, "profile deleted");
            println!("Deleted {} ({}).", target.label(), target.email);
        }
        Commands::History { email } => {
            let user = db::find_user_by_email(&pool, &email)
                .await?
                .with_context(|| format!("no account found for {email}"))?;
            let entries = db::fetch_history(&pool, user.id, history::HISTORY_LIMIT).await?;
            print_json(&entries)?;
        }
        Commands::Submit {
            email,
            luggage_response,
            toolbox_response,
            luggage_verification,
            toolbox_verification,
            luggage_url,
            toolbox_url,
        } => {
            let user = db::find_user_by_email(&pool, &email)
                .await?
                .with_context(|| format!("no account found for {email}"))?;

            let luggage = evaluate_photo(&luggage_response, luggage_verification.as_deref())?;
            let toolbox = evaluate_photo(&toolbox_response, toolbox_verification.as_deref())?;

            let submission = history::new_submission(
                &user,
                &luggage,
                &toolbox,
                luggage_url,
                toolbox_url,
                Utc::now(),
            );

            let id = db::upsert_submission(&pool, &submission).await?;
            info!(submission = %id, user = %user.id, month = %submission.year_month, "submission recorded");
            println!(
                "Recorded {} for {}: score {}.",
                submission.year_month,
                user.label(),
                submission.ai_score
            );
            println!("{}\n\n{}", luggage.comment, toolbox.comment);
        }
        Commands::CheckImage { response } => check_image(&response)?,
        Commands::Settings { action } => match action {
            SettingsCommand::Show { admin } => {
                require_admin(&pool, &admin).await?;
                print_json(&db::fetch_settings(&pool).await?)?;
            }
            SettingsCommand::Set {
                admin,
                domains,
                code,
            } => {
                require_admin(&pool, &admin).await?;
                let update = auth::SettingsUpdate {
                    allowed_domains: domains,
                    registration_code: code,
                }
                .validated()?;
                let settings = db::update_settings(&pool, &update).await?;
                db::log_admin_action(&pool, &admin, "update_settings", None, None).await?;
                info!("security settings updated");
                print_json(&settings)?;
            }
        },
        Commands::VerifyCode { code } => {
            let settings = db::fetch_settings(&pool).await?;
            let valid = auth::verify_registration_code(&code, &settings.registration_code)?;
            print_json(&serde_json::json!({ "valid": valid }))?;
        }
        Commands::RequestLink { email, code } => {
            request_link(&pool, &config, &email, code.as_deref()).await?;
        }
    }

    Ok(())
}

async fn load_stats(pool: &PgPool) -> anyhow::Result<models::StatsReport> {
    let now = Utc::now();
    let (profiles, total, submissions) = tokio::try_join!(
        db::fetch_users(pool),
        db::count_submissions(pool),
        db::fetch_submissions_between(pool, stats::series_start(now), now),
    )?;
    info!(
        users = profiles.len(),
        submissions = submissions.len(),
        "computing statistics"
    );
    Ok(stats::build_stats(&submissions, &profiles, total, now))
}

async fn request_link(
    pool: &PgPool,
    config: &Config,
    email: &str,
    code: Option<&str>,
) -> anyhow::Result<()> {
    if email.trim().is_empty() {
        return Err(AccessError::EmailRequired.into());
    }

    let now = Utc::now();
    let mut attempts = db::load_attempts(pool, email).await?;
    attempts.refresh(now);
    attempts.check(now)?;

    let settings = db::fetch_settings(pool).await?;
    let existing = db::find_user_by_email(pool, email).await?.is_some();

    match auth::decide_access(email, code, &settings, existing, &config.site_url) {
        Ok(grant) => {
            attempts.record_sent(now);
            db::save_attempts(pool, email, &attempts).await?;
            info!(email, kind = ?grant.kind, "magic link approved");
            print_json(&grant)
        }
        Err(err) => {
            if err.is_failed_attempt() {
                attempts.record_failure(now);
                db::save_attempts(pool, email, &attempts).await?;
                warn!(email, attempts = attempts.attempts, "magic link refused: {err}");
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("orderlog").chain(args.iter().copied()))
    }

    #[test]
    fn admin_reads_require_the_acting_admin() {
        let commands: [&[&str]; 4] = [&["stats"], &["report"], &["users"], &["settings", "show"]];
        for args in commands {
            assert!(parse(args).is_err(), "{args:?} parsed without --admin");
        }

        let cli = parse(&["settings", "show", "--admin", "haruka.sato@fieldcrew.jp"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Settings {
                action: SettingsCommand::Show { admin }
            } if admin == "haruka.sato@fieldcrew.jp"
        ));
    }

    #[test]
    fn submit_takes_one_reply_per_photo() {
        assert!(parse(&["submit", "--email", "k@fieldcrew.jp", "--luggage-response", "l.txt"]).is_err());

        let cli = parse(&[
            "submit",
            "--email",
            "k@fieldcrew.jp",
            "--luggage-response",
            "l.txt",
            "--toolbox-response",
            "t.txt",
            "--toolbox-verification",
            "tv.txt",
        ])
        .unwrap();
        match cli.command {
            Commands::Submit {
                luggage_response,
                toolbox_response,
                luggage_verification,
                toolbox_verification,
                ..
            } => {
                assert_eq!(luggage_response, PathBuf::from("l.txt"));
                assert_eq!(toolbox_response, PathBuf::from("t.txt"));
                assert_eq!(luggage_verification, None);
                assert_eq!(toolbox_verification, Some(PathBuf::from("tv.txt")));
            }
            _ => panic!("expected submit"),
        }
    }

    #[test]
    fn check_image_reads_a_reply_file_without_config() {
        let path = std::env::temp_dir().join(format!("orderlog-check-{}.txt", Uuid::new_v4()));
        std::fs::write(&path, r#"The image: {"isValid": true, "category": "cargo"}"#).unwrap();
        let accepted = check_image(&path);
        std::fs::write(&path, r#"{"isValid": false, "reason": "a plate"}"#).unwrap();
        let rejected = check_image(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(accepted.is_ok());
        assert!(rejected.is_err());
    }
}
