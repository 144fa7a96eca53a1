use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_CONTROL_BASE_URL: &str = "https://cw-serv.ru";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:crb.db?mode=rwc";

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_allowed_users: Vec<i64>,
    pub telegram_webhook_url: Option<String>,
    pub webhook_port: u16,
    pub telegram_safe_limit: usize,

    // Control service
    pub control_base_url: String,
    pub control_timeout: Duration,

    // Store
    pub database_url: String,
    pub database_max_connections: u32,
    pub database_acquire_timeout: Duration,
    pub database_max_lifetime: Duration,

    // Registration
    pub pending_key_ttl: Duration,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_source(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in production).
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let src = Source(&get);

        let telegram_bot_token = src.string("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        let telegram_allowed_users = parse_csv_i64(src.string("TELEGRAM_ALLOWED_USERS"));
        let telegram_webhook_url = src.string("TELEGRAM_WEBHOOK_URL");
        let webhook_port = src.parse::<u16>("PORT").unwrap_or(5000);
        let telegram_safe_limit = src.parse::<usize>("TELEGRAM_SAFE_LIMIT").unwrap_or(4000);

        let control_base_url = src
            .string("CONTROL_BASE_URL")
            .unwrap_or_else(|| DEFAULT_CONTROL_BASE_URL.to_string());
        validate_base_url(&control_base_url)?;
        let control_timeout =
            Duration::from_millis(src.parse::<u64>("CONTROL_TIMEOUT_MS").unwrap_or(10_000));

        let database_url = src
            .string("DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let database_max_connections = src
            .parse::<u32>("DATABASE_MAX_CONNECTIONS")
            .unwrap_or(5)
            .max(1);
        let database_acquire_timeout = Duration::from_millis(
            src.parse::<u64>("DATABASE_ACQUIRE_TIMEOUT_MS")
                .unwrap_or(5_000),
        );
        let database_max_lifetime = Duration::from_secs(30 * 60);

        let pending_key_ttl =
            Duration::from_secs(src.parse::<u64>("PENDING_KEY_TTL_SECS").unwrap_or(300));

        let rate_limit_enabled = src.boolean("RATE_LIMIT_ENABLED").unwrap_or(true);
        let rate_limit_requests = src.parse::<u32>("RATE_LIMIT_REQUESTS").unwrap_or(20);
        let rate_limit_window =
            Duration::from_secs(src.parse::<u64>("RATE_LIMIT_WINDOW").unwrap_or(60));

        let audit_log_path = PathBuf::from(
            src.string("AUDIT_LOG_PATH")
                .unwrap_or_else(|| "/tmp/crb-audit.log".to_string()),
        );
        let audit_log_json = src.boolean("AUDIT_LOG_JSON").unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            telegram_allowed_users,
            telegram_webhook_url,
            webhook_port,
            telegram_safe_limit,
            control_base_url,
            control_timeout,
            database_url,
            database_max_connections,
            database_acquire_timeout,
            database_max_lifetime,
            pending_key_ttl,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
            audit_log_path,
            audit_log_json,
        })
    }
}

struct Source<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Source<'_, F> {
    /// Trimmed, non-empty value.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.string(key).and_then(|s| s.parse::<T>().ok())
    }

    fn boolean(&self, key: &str) -> Option<bool> {
        self.string(key)
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

/// The base must parse as an absolute http(s) URL with a host.
fn validate_base_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw)
        .map_err(|e| Error::Config(format!("invalid CONTROL_BASE_URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::Config(format!(
            "CONTROL_BASE_URL must be an http(s) URL, got {raw:?}"
        )));
    }
    Ok(())
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}
