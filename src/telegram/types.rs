//! Bot API wire types.
//!
//! Only the fields the bridge reads are modelled; raw documents are kept as
//! `serde_json::Value` wherever they are persisted verbatim.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

/// `{ ok, result, description, error_code }` envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
}

/// An identifier the provider may send as a number or a string. Kept as
/// text because chat ids are not guaranteed to fit a signed 64-bit column
/// once they pass through JSON tooling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = ExternalId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or string identifier")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                if v.fract() == 0.0 && v.is_finite() {
                    Ok(ExternalId(format!("{v:.0}")))
                } else {
                    Err(E::custom(format!("non-integral identifier {v}")))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(ExternalId(v.trim().to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: ExternalId,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ExternalId,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

/// The parts of a Bot API `Message` the bridge reads.
#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    #[serde(default)]
    pub message_id: Option<ExternalId>,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub chat: Option<Chat>,
    /// Unix seconds.
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

impl TgMessage {
    /// Text body, falling back to a media caption.
    pub fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.date.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// One entry of a `getUpdates` batch, split into its id and the message
/// document (from `message` or `edited_message`).
#[derive(Debug, Clone)]
pub struct Update {
    pub update_id: i64,
    pub raw_message: Option<serde_json::Value>,
}

impl Update {
    /// Extract the update id and message document from a raw update.
    /// Returns `None` when the update carries no usable id.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let update_id = raw.get("update_id")?.as_i64()?;
        let raw_message = raw
            .get("message")
            .or_else(|| raw.get("edited_message"))
            .filter(|m| m.is_object())
            .cloned();
        Some(Self {
            update_id,
            raw_message,
        })
    }

    pub fn message(&self) -> Option<Result<TgMessage, serde_json::Error>> {
        self.raw_message
            .as_ref()
            .map(|m| serde_json::from_value(m.clone()))
    }
}

/// `getFile` result.
#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

/// A message the provider accepted, with its raw document.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub raw: serde_json::Value,
}

impl SentMessage {
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, String> {
        let msg: TgMessage =
            serde_json::from_value(raw.clone()).map_err(|e| format!("bad message: {e}"))?;
        let message_id = msg
            .message_id
            .as_ref()
            .filter(|id| !id.is_empty())
            .map(|id| id.to_string())
            .ok_or_else(|| "message without message_id".to_string())?;
        Ok(Self {
            message_id,
            sent_at: msg.sent_at(),
            text: msg.text,
            caption: msg.caption,
            raw,
        })
    }
}

/// Upload method family chosen from a MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime: Option<&str>) -> Self {
        let mime = mime.unwrap_or("").trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            MediaKind::Photo
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            MediaKind::Photo => "sendPhoto",
            MediaKind::Video => "sendVideo",
            MediaKind::Audio => "sendAudio",
            MediaKind::Document => "sendDocument",
        }
    }

    /// Multipart field carrying the file.
    pub fn field(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}
