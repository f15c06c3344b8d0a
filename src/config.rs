use std::{env, fmt::Display, str::FromStr};

use anyhow::Context;
use tracing::{debug, info};

use crate::auth;

pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub site_url: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }

        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let site_url = auth::resolve_site_url(
            var("ORDERLOG_SITE_URL").as_deref(),
            var("VERCEL_ENV").as_deref(),
            var("VERCEL_URL").as_deref(),
        );

        Ok(Self {
            database_url,
            max_connections: try_load("ORDERLOG_MAX_CONNECTIONS", "5")?,
            site_url,
        })
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.parse()
        .map_err(|e| anyhow::anyhow!("Invalid {key} value {raw:?}: {e}"))
}
