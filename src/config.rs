//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;

/// Contact named in rejection and info texts.
pub const DEFAULT_ADMIN_CONTACT: &str = "Manuel Ángel Trenas";

/// Top-level bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram: TelegramConfig,
    pub google: GoogleConfig,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    /// libSQL file for scheduler and chat-directory state.
    pub db_path: PathBuf,
    /// Directory for rolling log files. `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
    /// Interval of the liveness heartbeat log line.
    pub heartbeat_interval: Duration,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            telegram: TelegramConfig::from_env()?,
            google: GoogleConfig::from_env()?,
            scheduler: SchedulerConfig::from_env()?,
            engine: EngineConfig::from_env()?,
            db_path: std::env::var("REVIEW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/revision-bot.db")),
            log_dir: std::env::var("REVIEW_LOG_DIR").ok().map(PathBuf::from),
            heartbeat_interval: Duration::from_secs(env_parse("REVIEW_HEARTBEAT_SECS", 600)?),
        })
    }
}

/// Telegram transport configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = required("TELEGRAM_BOT_TOKEN")?;
        Ok(Self {
            bot_token: SecretString::from(bot_token),
        })
    }
}

/// Google Sheets / Drive configuration.
#[derive(Debug, Clone)]
pub struct GoogleConfig {
    /// Path to the service-account JSON key.
    pub credentials_path: PathBuf,
    /// Spreadsheet holding the question catalog (name or id).
    pub questions_spreadsheet: String,
    /// Spreadsheet holding the roster (name or id).
    pub users_spreadsheet: String,
    /// Spreadsheet receiving answer rows (name or id).
    pub answers_spreadsheet: String,
    /// Worksheet title inside the answers spreadsheet.
    pub answers_worksheet: String,
    /// Drive folder under which per-person photo folders are created.
    pub drive_root_folder: String,
}

impl GoogleConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            credentials_path: std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("credentials.json")),
            questions_spreadsheet: env_or("REVIEW_QUESTIONS_SPREADSHEET", "Preguntas"),
            users_spreadsheet: env_or("REVIEW_USERS_SPREADSHEET", "Users"),
            answers_spreadsheet: env_or("REVIEW_ANSWERS_SPREADSHEET", "Revisiones"),
            answers_worksheet: env_or("REVIEW_ANSWERS_WORKSHEET", "Revision"),
            drive_root_folder: required("REVIEW_DRIVE_ROOT_FOLDER")?,
        })
    }
}

/// Weekly broadcast configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Six-field cron expression (sec min hour day-of-month month day-of-week).
    pub schedule: String,
    /// Offset the schedule is evaluated in.
    pub utc_offset: FixedOffset,
    /// A missed occurrence older than this is skipped instead of fired.
    pub grace: Duration,
    /// Ticker interval.
    pub tick_interval: Duration,
    /// Maximum persons started concurrently during a broadcast.
    pub max_fanout: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule: "0 0 10 * * Sun".to_string(),
            utc_offset: FixedOffset::east_opt(3600).unwrap_or_else(utc),
            grace: Duration::from_secs(2 * 3600),
            tick_interval: Duration::from_secs(60),
            max_fanout: 8,
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let utc_offset = utc_offset_from_env()?;

        let schedule = env_or("REVIEW_SCHEDULE", &defaults.schedule);
        cron::Schedule::from_str(&schedule).map_err(|e| ConfigError::InvalidValue {
            key: "REVIEW_SCHEDULE".into(),
            message: e.to_string(),
        })?;

        let max_fanout: usize = env_parse("REVIEW_MAX_FANOUT", defaults.max_fanout)?;
        Ok(Self {
            schedule,
            utc_offset,
            grace: Duration::from_secs(60 * env_parse("REVIEW_SCHEDULE_GRACE_MINS", 120u64)?),
            tick_interval: Duration::from_secs(env_parse("REVIEW_SCHEDULER_TICK_SECS", 60u64)?),
            max_fanout: max_fanout.max(1),
        })
    }
}

/// Conversation engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for every answer-sink append and photo upload.
    pub io_timeout: Duration,
    /// Maximum events handled concurrently across identities.
    pub max_concurrent_events: usize,
    /// Offset used to stamp answer rows with a local date.
    pub utc_offset: FixedOffset,
    pub admin_contact: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(30),
            max_concurrent_events: 16,
            utc_offset: FixedOffset::east_opt(3600).unwrap_or_else(utc),
            admin_contact: DEFAULT_ADMIN_CONTACT.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent_events: usize = env_parse("REVIEW_MAX_CONCURRENT_EVENTS", 16)?;
        Ok(Self {
            io_timeout: Duration::from_secs(env_parse("REVIEW_IO_TIMEOUT_SECS", 30u64)?),
            max_concurrent_events: max_concurrent_events.max(1),
            utc_offset: utc_offset_from_env()?,
            admin_contact: env_or("REVIEW_ADMIN_CONTACT", DEFAULT_ADMIN_CONTACT),
        })
    }
}

fn utc_offset_from_env() -> Result<FixedOffset, ConfigError> {
    utc_offset_from_minutes(env_parse("REVIEW_UTC_OFFSET_MINUTES", 60)?)
}

/// Offsets beyond ±24h are rejected.
fn utc_offset_from_minutes(minutes: i32) -> Result<FixedOffset, ConfigError> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "REVIEW_UTC_OFFSET_MINUTES".into(),
            message: format!("{minutes} is out of range"),
        })
}

fn utc() -> FixedOffset {
    Utc.fix()
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
