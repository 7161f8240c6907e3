//! Async Bot API client with structured failure classification.
//!
//! Every call decodes the `{ok, result, ...}` envelope regardless of HTTP
//! status: the platform reports rate limits and chat migrations inside the
//! envelope's `parameters` object, and callers need those surfaced as typed
//! variants rather than opaque status codes.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::telegram_types::{
    AttachmentKind, ChatMember, ChatPermissions, InlineKeyboardMarkup, Message, Update, User,
};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
const LONG_POLL_GRACE_SECS: u64 = 10;

/// Errors surfaced by the platform client, split along the retry taxonomy
/// the moderation core keys its behavior on.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// Outbound flood control: wait `retry_after` seconds, then retry.
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    /// The chat identity changed; retry once against `new_chat_id`.
    #[error("chat migrated to {new_chat_id}")]
    Migrated { new_chat_id: i64 },
    /// Forbidden / bad-request class failures that will not succeed on retry.
    #[error("api failure {status}: {description}")]
    Permanent { status: u16, description: String },
    /// Connectivity problems; the request may never have reached the platform.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The platform answered with a body the envelope decoder cannot read.
    #[error("malformed api response: {0}")]
    Decode(String),
}

impl TelegramError {
    /// True for failures worth retrying later without state changes.
    /// Covers connectivity errors, flood control, and platform 5xx answers.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::RateLimited { .. } => true,
            Self::Permanent { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// True for per-recipient failures that will never succeed on retry:
    /// forbidden (recipient blocked the bot, bot kicked) or bad-request
    /// (recipient gone). The recipient should be pruned, not retried.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { status, .. } if *status < 500)
    }

    /// True when the failure means the chat is gone for this bot: kicked,
    /// blocked, or the chat no longer exists. Cached and persisted state for
    /// the chat should be purged.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Permanent {
                status,
                description,
            } => *status == 403 || description.to_lowercase().contains("not found"),
            _ => false,
        }
    }

    /// Seconds to wait when the platform asked us to back off.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// New chat id when the failure was an identity migration.
    pub fn migrated_to(&self) -> Option<i64> {
        match self {
            Self::Migrated { new_chat_id } => Some(*new_chat_id),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
    #[serde(default)]
    migrate_to_chat_id: Option<i64>,
}

/// Decodes one envelope body into the expected result or a typed failure.
fn decode_api_response<T: DeserializeOwned>(
    http_status: u16,
    body: &str,
) -> Result<T, TelegramError> {
    let envelope: ApiResponse<T> = serde_json::from_str(body)
        .map_err(|error| TelegramError::Decode(format!("status {http_status}: {error}")))?;
    if envelope.ok {
        return envelope.result.ok_or_else(|| {
            TelegramError::Decode(format!("status {http_status}: ok envelope without result"))
        });
    }
    let parameters = envelope.parameters.unwrap_or_default();
    if let Some(retry_after) = parameters.retry_after {
        return Err(TelegramError::RateLimited { retry_after });
    }
    if let Some(new_chat_id) = parameters.migrate_to_chat_id {
        return Err(TelegramError::Migrated { new_chat_id });
    }
    Err(TelegramError::Permanent {
        status: envelope.error_code.unwrap_or(http_status),
        description: envelope
            .description
            .unwrap_or_else(|| "no description".to_string()),
    })
}

#[derive(Debug, Clone)]
pub struct TelegramClientConfig {
    pub api_base: String,
    pub bot_token: String,
    pub http_timeout_ms: u64,
}

impl Default for TelegramClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token: String::new(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

/// Thin async wrapper over the Bot API methods the engine uses.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
}

impl TelegramClient {
    pub fn new(config: TelegramClientConfig) -> Result<Self, TelegramError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.bot_token,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: Value,
    ) -> Result<T, TelegramError> {
        self.call_with_timeout(method, payload, None).await
    }

    async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let mut request = self.http.post(self.method_url(method)).json(&payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;
        let http_status = response.status().as_u16();
        let body = response.text().await?;
        decode_api_response(http_status, &body)
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", json!({})).await
    }

    /// Long-polls for updates starting at `offset`. The per-request timeout
    /// is widened past the poll window so the client does not cut the poll
    /// short.
    pub async fn get_updates(
        &self,
        offset: i64,
        poll_timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        self.call_with_timeout(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": poll_timeout_secs,
                "allowed_updates": ["message", "callback_query", "my_chat_member"],
            }),
            Some(Duration::from_secs(
                poll_timeout_secs.saturating_add(LONG_POLL_GRACE_SECS),
            )),
        )
        .await
    }

    pub async fn get_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
    ) -> Result<ChatMember, TelegramError> {
        self.call(
            "getChatMember",
            json!({"chat_id": chat_id, "user_id": user_id}),
        )
        .await
    }

    pub async fn delete_message(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<bool, TelegramError> {
        self.call(
            "deleteMessage",
            json!({"chat_id": chat_id, "message_id": message_id}),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<Message, TelegramError> {
        self.call("sendMessage", json!({"chat_id": chat_id, "text": text}))
            .await
    }

    /// HTML-formatted send with an optional inline keyboard.
    pub async fn send_html_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = serde_json::to_value(keyboard)
                .map_err(|error| TelegramError::Decode(error.to_string()))?;
        }
        self.call("sendMessage", payload).await
    }

    pub async fn edit_html_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
    ) -> Result<Message, TelegramError> {
        self.call(
            "editMessageText",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "text": text,
                "parse_mode": "HTML",
            }),
        )
        .await
    }

    /// Sends one attachment by platform file id with the text as caption.
    pub async fn send_attachment(
        &self,
        chat_id: i64,
        kind: AttachmentKind,
        file_id: &str,
        caption: Option<&str>,
    ) -> Result<Message, TelegramError> {
        let mut payload = json!({"chat_id": chat_id});
        payload[kind.payload_field()] = Value::String(file_id.to_string());
        if let Some(caption) = caption.filter(|value| !value.is_empty()) {
            payload["caption"] = Value::String(caption.to_string());
        }
        self.call(kind.api_method(), payload).await
    }

    /// Photo send with HTML caption and optional keyboard, used for the
    /// private-chat introduction.
    pub async fn send_photo_html(
        &self,
        chat_id: i64,
        photo: &str,
        caption: &str,
        keyboard: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "photo": photo,
            "caption": caption,
            "parse_mode": "HTML",
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = serde_json::to_value(keyboard)
                .map_err(|error| TelegramError::Decode(error.to_string()))?;
        }
        self.call("sendPhoto", payload).await
    }

    pub async fn restrict_chat_member(
        &self,
        chat_id: i64,
        user_id: i64,
        permissions: &ChatPermissions,
        until_unix: u64,
    ) -> Result<bool, TelegramError> {
        self.call(
            "restrictChatMember",
            json!({
                "chat_id": chat_id,
                "user_id": user_id,
                "permissions": permissions,
                "until_date": until_unix,
            }),
        )
        .await
    }

    pub async fn leave_chat(&self, chat_id: i64) -> Result<bool, TelegramError> {
        self.call("leaveChat", json!({"chat_id": chat_id})).await
    }

    pub async fn answer_callback_query(&self, callback_id: &str) -> Result<bool, TelegramError> {
        self.call(
            "answerCallbackQuery",
            json!({"callback_query_id": callback_id}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;
    use crate::telegram_types::MemberStatus;

    fn client_for(server: &MockServer) -> TelegramClient {
        TelegramClient::new(TelegramClientConfig {
            api_base: server.base_url(),
            bot_token: "test-token".to_string(),
            http_timeout_ms: 2_000,
        })
        .expect("build client")
    }

    #[test]
    fn unit_decode_classifies_rate_limit() {
        let body = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 7","parameters":{"retry_after":7}}"#;
        let error = decode_api_response::<bool>(429, body).expect_err("must classify");
        assert_eq!(error.retry_after(), Some(7));
        assert!(error.is_transient());
    }

    #[test]
    fn unit_decode_classifies_migration() {
        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: group chat was upgraded to a supergroup chat","parameters":{"migrate_to_chat_id":-100987}}"#;
        let error = decode_api_response::<bool>(400, body).expect_err("must classify");
        assert_eq!(error.migrated_to(), Some(-100_987));
        assert!(!error.is_transient());
    }

    #[test]
    fn unit_decode_classifies_permanent_and_unreachable() {
        let kicked = r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was kicked from the supergroup chat"}"#;
        let error = decode_api_response::<bool>(403, kicked).expect_err("must classify");
        assert!(error.is_unreachable());

        let missing = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let error = decode_api_response::<bool>(400, missing).expect_err("must classify");
        assert!(error.is_unreachable());

        let rights = r#"{"ok":false,"error_code":400,"description":"Bad Request: not enough rights"}"#;
        let error = decode_api_response::<bool>(400, rights).expect_err("must classify");
        assert!(!error.is_unreachable());
    }

    #[test]
    fn unit_decode_rejects_ok_without_result() {
        let error = decode_api_response::<bool>(200, r#"{"ok":true}"#).expect_err("must fail");
        assert!(matches!(error, TelegramError::Decode(_)));
    }

    #[tokio::test]
    async fn functional_get_chat_member_decodes_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/getChatMember");
                then.status(200).json_body(json!({
                    "ok": true,
                    "result": {
                        "user": {"id": 99, "is_bot": true, "first_name": "Vela"},
                        "status": "administrator"
                    }
                }));
            })
            .await;

        let member = client_for(&server)
            .get_chat_member(-100_123, 99)
            .await
            .expect("member");
        assert_eq!(member.status, MemberStatus::Administrator);
        assert!(member.status.is_admin());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn functional_send_message_surfaces_rate_limit() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(429).json_body(json!({
                    "ok": false,
                    "error_code": 429,
                    "description": "Too Many Requests: retry after 3",
                    "parameters": {"retry_after": 3}
                }));
            })
            .await;

        let error = client_for(&server)
            .send_message(1, "hello")
            .await
            .expect_err("rate limit");
        assert_eq!(error.retry_after(), Some(3));
    }

    #[tokio::test]
    async fn functional_delete_message_posts_expected_payload() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/bottest-token/deleteMessage")
                    .json_body(json!({"chat_id": -100_5, "message_id": 77}));
                then.status(200).json_body(json!({"ok": true, "result": true}));
            })
            .await;

        let deleted = client_for(&server)
            .delete_message(-100_5, 77)
            .await
            .expect("delete");
        assert!(deleted);
        mock.assert_async().await;
    }
}
