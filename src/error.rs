//! Error types for the revision bot.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Google API error: {0}")]
    Google(#[from] GoogleError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to download media on channel {name}: {reason}")]
    DownloadFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Google Sheets / Drive errors.
#[derive(Debug, thiserror::Error)]
pub enum GoogleError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Request to {api} failed: {reason}")]
    Request { api: &'static str, reason: String },

    #[error("{api} returned {status}: {body}")]
    Status {
        api: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {api}: {reason}")]
    InvalidResponse { api: &'static str, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Conversation workflow errors.
///
/// Every variant except `Channel` corresponds to a class in the bot's
/// error taxonomy; [`ReviewError::user_message`] decides what the person
/// sees.
#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error("Identity {identity} is not enrolled")]
    Unauthorized { identity: String },

    #[error("Roster unavailable: {0}")]
    RosterUnavailable(String),

    #[error("Question catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Answer sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Binary storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Header row already written")]
    DuplicateHeaderWrite,

    #[error("Cannot freeze header row: {reason}")]
    FreezeUnsupported { single_row: bool, reason: String },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

impl ReviewError {
    /// Whether the error comes from an external service and should be
    /// answered with a generic apology.
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Self::RosterUnavailable(_)
                | Self::CatalogUnavailable(_)
                | Self::SinkUnavailable(_)
                | Self::StorageUnavailable(_)
        )
    }

    /// The reply sent to the person, if any.
    pub fn user_message(&self, admin_contact: &str) -> Option<String> {
        match self {
            Self::Unauthorized { .. } => Some(crate::review::prompts::unauthorized(admin_contact)),
            Self::Channel(_) => Some(crate::review::prompts::APOLOGY.to_string()),
            e if e.is_service_failure() => Some(crate::review::prompts::APOLOGY.to_string()),
            _ => None,
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_failures_get_an_apology() {
        for err in [
            ReviewError::RosterUnavailable("down".into()),
            ReviewError::CatalogUnavailable("down".into()),
            ReviewError::SinkUnavailable("down".into()),
            ReviewError::StorageUnavailable("down".into()),
        ] {
            assert!(err.is_service_failure());
            assert_eq!(
                err.user_message("Admin").as_deref(),
                Some(crate::review::prompts::APOLOGY)
            );
        }
    }

    #[test]
    fn transport_failures_get_an_apology() {
        let err = ReviewError::from(ChannelError::DownloadFailed {
            name: "telegram".into(),
            reason: "404".into(),
        });
        assert!(!err.is_service_failure());
        assert!(err.user_message("Admin").is_some());
    }

    #[test]
    fn unauthorized_names_the_admin() {
        let err = ReviewError::Unauthorized {
            identity: "@ghost".into(),
        };
        let msg = err.user_message("Manuel").unwrap();
        assert!(msg.contains("Manuel"));
    }

    #[test]
    fn malformed_and_benign_errors_are_silent() {
        assert!(ReviewError::MalformedEvent("sticker".into())
            .user_message("x")
            .is_none());
        assert!(ReviewError::DuplicateHeaderWrite.user_message("x").is_none());
        assert!(ReviewError::InvalidTransition("idle to idle".into())
            .user_message("x")
            .is_none());
        assert!(
            ReviewError::FreezeUnsupported {
                single_row: true,
                reason: "only one row".into()
            }
            .user_message("x")
            .is_none()
        );
    }
}
