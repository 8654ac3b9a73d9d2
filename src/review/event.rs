//! Inbound event model: the tagged variant the engine dispatches on.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Stable handle of a person on the messaging transport.
///
/// Compared case-insensitively and with any leading `@` ignored, so the
/// roster may list `ana` while Telegram reports `@Ana`. The raw form is kept
/// for display and persisted rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    raw: String,
    key: String,
}

impl Identity {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into().trim().to_string();
        let key = raw.trim_start_matches('@').to_lowercase();
        Self { raw, key }
    }

    /// The form the identity was created from.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Canonical comparison key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Conversation the transport delivers replies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub String);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Transport reference to a photo; the binary is downloaded on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoRef {
    /// Id used to download the file.
    pub file_id: String,
    /// Id that stays the same across re-deliveries of the same file.
    pub unique_id: String,
    pub width: u32,
    pub height: u32,
}

/// Commands the bot understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    /// Manual "run review now" trigger.
    Revision,
    Info,
    Instructions,
    /// Enable photo-only mode.
    Photos,
    Unknown(String),
}

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/([A-Za-z0-9_]+)(?:@\S+)?(?:\s|$)").expect("command regex is valid")
});

impl Command {
    /// Parse a `/command` (optionally `/command@botname args`).
    /// Returns `None` for text that is not a command.
    pub fn parse(text: &str) -> Option<Self> {
        let caps = COMMAND_RE.captures(text.trim())?;
        let name = caps.get(1)?.as_str().to_lowercase();
        Some(match name.as_str() {
            "start" => Self::Start,
            "revision" => Self::Revision,
            "info" => Self::Info,
            "instrucciones" => Self::Instructions,
            "fotos" => Self::Photos,
            _ => Self::Unknown(name),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Revision => write!(f, "revision"),
            Self::Info => write!(f, "info"),
            Self::Instructions => write!(f, "instrucciones"),
            Self::Photos => write!(f, "fotos"),
            Self::Unknown(name) => write!(f, "{name}"),
        }
    }
}

/// What an inbound event carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Text(String),
    Photo(PhotoRef),
    Command(Command),
}

impl EventKind {
    /// Classify a text message: commands start with `/`.
    pub fn from_text(text: &str) -> Self {
        match Command::parse(text) {
            Some(cmd) => Self::Command(cmd),
            None => Self::Text(text.to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Photo(_) => "photo",
            Self::Command(_) => "command",
        }
    }
}

/// An event received from the messaging gateway.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub sender: Identity,
    /// Display name reported by the transport.
    pub sender_name: Option<String>,
    pub chat: ChatId,
    pub kind: EventKind,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(sender: impl Into<Identity>, chat: impl Into<ChatId>, kind: EventKind) -> Self {
        Self {
            sender: sender.into(),
            sender_name: None,
            chat: chat.into(),
            kind,
            received_at: Utc::now(),
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    pub fn text(sender: &str, chat: &str, text: &str) -> Self {
        Self::new(sender, chat, EventKind::from_text(text))
    }

    pub fn photo(sender: &str, chat: &str, photo: PhotoRef) -> Self {
        Self::new(sender, chat, EventKind::Photo(photo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_at_prefix_and_case() {
        assert_eq!(Identity::new("@Ana"), Identity::new("ana"));
        assert_eq!(Identity::new(" @ana "), Identity::new("@ANA"));
        assert_ne!(Identity::new("ana"), Identity::new("anabel"));
    }

    #[test]
    fn identity_keeps_raw_form_for_display() {
        let id = Identity::new("@Ana");
        assert_eq!(id.to_string(), "@Ana");
        assert_eq!(id.key(), "ana");
    }

    #[test]
    fn parse_known_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/revision"), Some(Command::Revision));
        assert_eq!(Command::parse("/info"), Some(Command::Info));
        assert_eq!(Command::parse("/instrucciones"), Some(Command::Instructions));
        assert_eq!(Command::parse("/fotos"), Some(Command::Photos));
    }

    #[test]
    fn parse_command_with_bot_suffix_and_args() {
        assert_eq!(Command::parse("/Revision@ReviewBot"), Some(Command::Revision));
        assert_eq!(Command::parse("/fotos ahora"), Some(Command::Photos));
    }

    #[test]
    fn parse_unknown_command() {
        assert_eq!(
            Command::parse("/help"),
            Some(Command::Unknown("help".to_string()))
        );
    }

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(Command::parse("no"), None);
        assert_eq!(Command::parse("72 cm / 80 cm"), None);
        assert_eq!(
            EventKind::from_text("85"),
            EventKind::Text("85".to_string())
        );
    }
}
