//! Telegram Bot API integration.

pub mod client;
pub mod types;

pub use client::{MediaUpload, TelegramClient};
pub use types::{ExternalId, FileInfo, MediaKind, SentMessage, TgMessage, Update, User};

/// Provider limit for `sendMessage` text.
pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Provider limit for media captions.
pub const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;
