//! Telegram channel: long-polls the Bot API for updates.
//!
//! Text, photo and command messages are turned into [`InboundEvent`]s;
//! everything else is logged and dropped.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{Channel, EventStream, OutgoingMessage, ParseMode};
use crate::error::ChannelError;
use crate::review::event::{ChatId, EventKind, Identity, InboundEvent, PhotoRef};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram channel: connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{API_BASE}/file/bot{}/{file_path}",
            self.bot_token.expose_secret()
        )
    }

    /// Send a text message, splitting past Telegram's 4096 char limit.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: ParseMode,
    ) -> Result<(), ChannelError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(chat_id, &chunk, parse_mode).await?;
        }
        Ok(())
    }

    /// Send a single chunk. Markdown is tried first with a plain-text retry,
    /// since user-provided names can break Telegram's Markdown parser.
    async fn send_message_chunk(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: ParseMode,
    ) -> Result<(), ChannelError> {
        if parse_mode == ParseMode::Markdown {
            let markdown_body = serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "Markdown"
            });

            let markdown_resp = self
                .client
                .post(self.api_url("sendMessage"))
                .json(&markdown_body)
                .send()
                .await
                .map_err(|e| send_failed(e.to_string()))?;

            if markdown_resp.status().is_success() {
                return Ok(());
            }

            tracing::warn!(
                status = ?markdown_resp.status(),
                "Telegram sendMessage with Markdown failed; retrying without parse_mode"
            );
        }

        let plain_body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&plain_body)
            .send()
            .await
            .map_err(|e| send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let status = plain_resp.status();
            let err = plain_resp.text().await.unwrap_or_default();
            return Err(send_failed(format!("sendMessage returned {status}: {err}")));
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(serde_json::Value::as_array)
                else {
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = uid + 1;
                    }

                    let event = match parse_update(update) {
                        Ok(Some(event)) => event,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Telegram: dropping update: {e}");
                            continue;
                        }
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, chat: &ChatId, message: OutgoingMessage) -> Result<(), ChannelError> {
        self.send_message(&chat.0, &message.text, message.parse_mode)
            .await
    }

    async fn download(&self, photo: &PhotoRef) -> Result<Vec<u8>, ChannelError> {
        let resp = self
            .client
            .post(self.api_url("getFile"))
            .json(&serde_json::json!({ "file_id": photo.file_id }))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        let file_path = data
            .get("result")
            .and_then(|r| r.get("file_path"))
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| download_failed(format!("getFile returned no file_path: {data}")))?;

        let resp = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| download_failed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(download_failed(format!(
                "file download returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| download_failed(e.to_string()))?;
        tracing::debug!(file_id = %photo.file_id, size = bytes.len(), "Telegram photo downloaded");
        Ok(bytes.to_vec())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(token: &SecretString, method: &str) -> String {
    format!("{API_BASE}/bot{}/{method}", token.expose_secret())
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "telegram".into(),
        reason,
    }
}

fn download_failed(reason: String) -> ChannelError {
    ChannelError::DownloadFailed {
        name: "telegram".into(),
        reason,
    }
}

/// Turn one `getUpdates` entry into an event.
///
/// `Ok(None)` means the update carries no message (edits, channel posts).
/// Messages without text or photo are rejected as invalid.
pub fn parse_update(update: &serde_json::Value) -> Result<Option<InboundEvent>, ChannelError> {
    let Some(message) = update.get("message") else {
        return Ok(None);
    };

    let from = message
        .get("from")
        .ok_or_else(|| ChannelError::InvalidMessage("message without sender".into()))?;

    // The roster keys people by @username; fall back to the numeric id.
    let identity = match from.get("username").and_then(|u| u.as_str()) {
        Some(username) => format!("@{username}"),
        None => from
            .get("id")
            .and_then(serde_json::Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| ChannelError::InvalidMessage("sender without id".into()))?,
    };

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| ChannelError::InvalidMessage("message without chat id".into()))?;

    let full_name = {
        let first = from.get("first_name").and_then(|n| n.as_str());
        let last = from.get("last_name").and_then(|n| n.as_str());
        match (first, last) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(f), None) => Some(f.to_string()),
            _ => None,
        }
    };

    let kind = if let Some(text) = message.get("text").and_then(|t| t.as_str()) {
        EventKind::from_text(text)
    } else if let Some(sizes) = message.get("photo").and_then(|p| p.as_array()) {
        // Sizes are ordered smallest first; keep the highest resolution.
        let largest = sizes
            .last()
            .ok_or_else(|| ChannelError::InvalidMessage("empty photo array".into()))?;
        EventKind::Photo(parse_photo_size(largest)?)
    } else {
        return Err(ChannelError::InvalidMessage(format!(
            "unsupported message from {identity}"
        )));
    };

    let mut event = InboundEvent::new(Identity::new(identity), ChatId(chat_id), kind);
    if let Some(name) = full_name {
        event = event.with_sender_name(name);
    }
    Ok(Some(event))
}

fn parse_photo_size(size: &serde_json::Value) -> Result<PhotoRef, ChannelError> {
    let field = |name: &str| {
        size.get(name)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ChannelError::InvalidMessage(format!("photo without {name}")))
    };
    let dim = |name: &str| size.get(name).and_then(|v| v.as_u64()).unwrap_or(0) as u32;

    Ok(PhotoRef {
        file_id: field("file_id")?,
        unique_id: field("file_unique_id")?,
        width: dim("width"),
        height: dim("height"),
    })
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char
/// boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_len;
        while cut > 0 && !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        let chunk = &remaining[..cut];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::event::Command;

    fn channel() -> TelegramChannel {
        TelegramChannel::new(SecretString::from("123:ABC"))
    }

    #[test]
    fn telegram_channel_name() {
        assert_eq!(channel().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            channel().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_file_url() {
        assert_eq!(
            channel().file_url("photos/file_1.jpg"),
            "https://api.telegram.org/file/bot123:ABC/photos/file_1.jpg"
        );
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn parse_text_update() {
        let update = serde_json::json!({
            "update_id": 10,
            "message": {
                "from": {"id": 42, "username": "ana", "first_name": "Ana", "last_name": "López"},
                "chat": {"id": 42},
                "text": "72"
            }
        });
        let event = parse_update(&update).unwrap().unwrap();
        assert_eq!(event.sender.as_str(), "@ana");
        assert_eq!(event.chat.0, "42");
        assert_eq!(event.sender_name.as_deref(), Some("Ana López"));
        assert_eq!(event.kind, EventKind::Text("72".into()));
    }

    #[test]
    fn parse_command_update() {
        let update = serde_json::json!({
            "message": {
                "from": {"id": 42, "username": "ana"},
                "chat": {"id": 42},
                "text": "/revision"
            }
        });
        let event = parse_update(&update).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Command(Command::Revision));
    }

    #[test]
    fn parse_photo_update_takes_largest_size() {
        let update = serde_json::json!({
            "message": {
                "from": {"id": 42, "username": "ana"},
                "chat": {"id": 42},
                "photo": [
                    {"file_id": "small", "file_unique_id": "u-small", "width": 90, "height": 120},
                    {"file_id": "big", "file_unique_id": "u-big", "width": 960, "height": 1280}
                ]
            }
        });
        let event = parse_update(&update).unwrap().unwrap();
        let EventKind::Photo(photo) = event.kind else {
            panic!("expected photo");
        };
        assert_eq!(photo.file_id, "big");
        assert_eq!(photo.unique_id, "u-big");
        assert_eq!((photo.width, photo.height), (960, 1280));
    }

    #[test]
    fn parse_sender_without_username_uses_numeric_id() {
        let update = serde_json::json!({
            "message": {
                "from": {"id": 777},
                "chat": {"id": 777},
                "text": "hola"
            }
        });
        let event = parse_update(&update).unwrap().unwrap();
        assert_eq!(event.sender.as_str(), "777");
    }

    #[test]
    fn parse_sticker_is_invalid() {
        let update = serde_json::json!({
            "message": {
                "from": {"id": 42, "username": "ana"},
                "chat": {"id": 42},
                "sticker": {"file_id": "x"}
            }
        });
        assert!(matches!(
            parse_update(&update),
            Err(ChannelError::InvalidMessage(_))
        ));
    }

    #[test]
    fn parse_update_without_message_is_skipped() {
        let update = serde_json::json!({"update_id": 3, "edited_message": {}});
        assert!(parse_update(&update).unwrap().is_none());
    }

    // ── Message splitting ───────────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks, vec!["a".repeat(2000), "b".repeat(3000)]);
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_respects_char_boundaries() {
        let msg = "ñ".repeat(3000); // 6000 bytes
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.concat(), msg);
    }

    // ── Network error (no server) ───────────────────────────────────

    #[tokio::test]
    async fn telegram_download_fails_with_fake_token() {
        let ch = TelegramChannel::new(SecretString::from("fake-token"));
        let photo = PhotoRef {
            file_id: "x".into(),
            unique_id: "y".into(),
            width: 1,
            height: 1,
        };
        assert!(ch.download(&photo).await.is_err());
    }
}
