//! Telegram Bot API client for the Vela moderation engine.
//!
//! Wire types and an async HTTP client over `reqwest`. Failures surface
//! through a four-way taxonomy (rate-limited, chat-migrated, permanent,
//! transport) so callers can coordinate retries, cache invalidation, and
//! chat-identity migration without string-matching ad hoc errors.

pub mod telegram_client;
pub mod telegram_types;

pub use telegram_client::{TelegramClient, TelegramClientConfig, TelegramError};
pub use telegram_types::{
    AttachmentKind, CallbackQuery, Chat, ChatKind, ChatMember, ChatMemberUpdated, ChatPermissions,
    EntityKind, FileRef, InlineKeyboardButton, InlineKeyboardMarkup, MemberStatus, Message,
    MessageEntity, PhotoSize, Update, User,
};
