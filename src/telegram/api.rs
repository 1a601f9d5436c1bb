//! Thin Telegram Bot API client.
//!
//! One `reqwest` client, 30 s default timeout, JSON in and out. Transient
//! failures (5xx, connect/timeout) are retried with a 3 s back-off inside
//! the send/edit paths; a Markdown parse rejection (400) is retried once as
//! plain text; a long-poll 409 surfaces as [`TransportError::Conflict`] for
//! the daemon loop to count.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    BotCommand, CallbackQuery, ChatAction, ChatId, ChatTransport, IncomingMessage, InlineKeyboard,
    MessageId, OutgoingMessage, TransportError, TransportResult, Update, UpdateKind, UserRef,
};
use crate::telegram::format::truncate_message;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
const SEND_RETRIES: u32 = 3;

pub struct TelegramApi {
    client: reqwest::Client,
    base: String,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct RawUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    callback_query: Option<RawCallback>,
}

#[derive(Deserialize)]
struct RawMessage {
    message_id: i64,
    chat: RawChat,
    #[serde(default)]
    from: Option<UserRef>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<Vec<RawPhotoSize>>,
    #[serde(default)]
    voice: Option<RawVoice>,
}

#[derive(Deserialize)]
struct RawChat {
    id: i64,
}

#[derive(Deserialize)]
struct RawPhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Deserialize)]
struct RawVoice {
    file_id: String,
}

#[derive(Deserialize)]
struct RawCallback {
    id: String,
    from: UserRef,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawFile {
    file_path: Option<String>,
}

impl TelegramApi {
    pub fn new(token: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base: format!("https://api.telegram.org/bot{token}"),
        })
    }

    fn file_base(&self) -> String {
        self.base.replace("/bot", "/file/bot")
    }

    async fn call<T: DeserializeOwned + Default>(
        &self,
        method: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> TransportResult<T> {
        let mut request = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let envelope: ApiEnvelope<T> = response.json().await?;

        if envelope.ok {
            envelope.result.ok_or(TransportError::Api {
                code: 0,
                description: "missing result".into(),
            })
        } else {
            let code = envelope.error_code.unwrap_or(0);
            if code == 409 {
                return Err(TransportError::Conflict);
            }
            Err(TransportError::Api {
                code,
                description: envelope.description.unwrap_or_default(),
            })
        }
    }

    /// Call with transient-error retry; non-transient errors pass through.
    async fn call_retrying<T: DeserializeOwned + Default>(
        &self,
        method: &str,
        body: &Value,
    ) -> TransportResult<T> {
        let mut attempt = 0;
        loop {
            match self.call(method, body, None).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < SEND_RETRIES => {
                    attempt += 1;
                    tracing::debug!(method, attempt, error = %err, "retrying transient API error");
                    // Symmetrical 10% jitter so parallel retries spread out.
                    let jitter = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                    tokio::time::sleep(RETRY_BACKOFF.mul_f64(jitter)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn keyboard_value(keyboard: &InlineKeyboard) -> Value {
        json!({
            "inline_keyboard": keyboard
                .rows
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({"text": b.text, "callback_data": b.callback_data}))
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>()
        })
    }

    fn convert_message(raw: RawMessage) -> IncomingMessage {
        // Telegram sends several sizes per photo; the last is the largest.
        let photo_file_id = raw.photo.and_then(|sizes| {
            sizes
                .into_iter()
                .max_by_key(|s| s.file_size.unwrap_or(0))
                .map(|s| s.file_id)
        });
        IncomingMessage {
            chat_id: raw.chat.id,
            message_id: raw.message_id,
            from: raw.from.unwrap_or(UserRef {
                id: 0,
                username: None,
            }),
            text: raw.text,
            photo_file_id,
            voice_file_id: raw.voice.map(|v| v.file_id),
            caption: raw.caption,
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn get_updates(&self, offset: i64, timeout_secs: u64) -> TransportResult<Vec<Update>> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "callback_query"],
        });
        // The HTTP timeout must outlive the long-poll window.
        let raw: Vec<RawUpdate> = self
            .call(
                "getUpdates",
                &body,
                Some(Duration::from_secs(timeout_secs + 10)),
            )
            .await?;

        let mut updates = Vec::with_capacity(raw.len());
        for update in raw {
            let kind = if let Some(message) = update.message {
                Some(UpdateKind::Message(Self::convert_message(message)))
            } else if let Some(callback) = update.callback_query {
                callback.message.map(|message| {
                    UpdateKind::Callback(CallbackQuery {
                        id: callback.id,
                        chat_id: message.chat.id,
                        message_id: message.message_id,
                        from: callback.from,
                        data: callback.data.unwrap_or_default(),
                    })
                })
            } else {
                None
            };
            if let Some(kind) = kind {
                updates.push(Update {
                    id: update.update_id,
                    kind,
                });
            }
        }
        Ok(updates)
    }

    async fn send_message(&self, message: OutgoingMessage) -> TransportResult<MessageId> {
        let text = truncate_message(&message.text);
        let mut body = json!({
            "chat_id": message.chat_id,
            "text": text.as_ref(),
        });
        if let Some(reply_to) = message.reply_to {
            body["reply_parameters"] = json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        if let Some(ref keyboard) = message.keyboard {
            body["reply_markup"] = Self::keyboard_value(keyboard);
        }
        if message.markdown {
            body["parse_mode"] = json!("Markdown");
        }

        #[derive(Deserialize, Default)]
        struct Sent {
            message_id: i64,
        }

        match self.call_retrying::<Sent>("sendMessage", &body).await {
            Ok(sent) => Ok(sent.message_id),
            Err(err) if message.markdown && err.is_parse_rejection() => {
                // Markdown rejected; retry once as plain text.
                if let Some(map) = body.as_object_mut() {
                    map.remove("parse_mode");
                }
                let sent: Sent = self.call_retrying("sendMessage", &body).await?;
                Ok(sent.message_id)
            }
            Err(err) => Err(err),
        }
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> TransportResult<()> {
        let text = truncate_message(text);
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text.as_ref(),
        });
        if let Some(ref keyboard) = keyboard {
            body["reply_markup"] = Self::keyboard_value(keyboard);
        }
        self.call_retrying::<Value>("editMessageText", &body)
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: MessageId) -> TransportResult<()> {
        let body = json!({"chat_id": chat_id, "message_id": message_id});
        self.call_retrying::<Value>("deleteMessage", &body)
            .await
            .map(|_| ())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> TransportResult<()> {
        let mut body = json!({"callback_query_id": callback_id});
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        self.call_retrying::<Value>("answerCallbackQuery", &body)
            .await
            .map(|_| ())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> TransportResult<()> {
        let action = match action {
            ChatAction::Typing => "typing",
            ChatAction::UploadPhoto => "upload_photo",
        };
        let body = json!({"chat_id": chat_id, "action": action});
        self.call::<Value>("sendChatAction", &body, None)
            .await
            .map(|_| ())
    }

    async fn set_my_commands(&self, commands: &[BotCommand]) -> TransportResult<()> {
        let body = json!({"commands": commands});
        self.call_retrying::<Value>("setMyCommands", &body)
            .await
            .map(|_| ())
    }

    async fn delete_webhook(&self) -> TransportResult<()> {
        self.call_retrying::<Value>("deleteWebhook", &json!({}))
            .await
            .map(|_| ())
    }

    async fn download_file(&self, file_id: &str, dest: &Path) -> TransportResult<()> {
        let info: RawFile = self
            .call_retrying("getFile", &json!({"file_id": file_id}))
            .await?;
        let Some(file_path) = info.file_path else {
            return Err(TransportError::Api {
                code: 0,
                description: "file has no path".into(),
            });
        };

        let url = format!("{}/{file_path}", self.file_base());
        let bytes = self.client.get(url).send().await?.bytes().await?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}
