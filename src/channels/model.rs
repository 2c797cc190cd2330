//! Channel, thread, and message data model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BridgeError;

/// Thread preview text for messages that carry no text of their own.
pub const ATTACHMENT_LABEL: &str = "Attachment";

/// Health state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Disabled,
    Error,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Disabled => "disabled",
            ChannelStatus::Error => "error",
        }
    }

    /// Channels in these states are swept by the inbound poller.
    pub fn is_pollable(&self) -> bool {
        matches!(self, ChannelStatus::Active | ChannelStatus::Error)
    }

    /// Guarded state machine. Self-transitions are allowed (no-ops);
    /// a disabled channel can only be re-enabled, never errored.
    pub fn can_transition_to(&self, next: ChannelStatus) -> bool {
        use ChannelStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Active, Error) | (Error, Active) => true,
            (Active, Disabled) | (Error, Disabled) => true,
            (Disabled, Active) => true,
            (Disabled, Error) => false,
            _ => false,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ChannelStatus::Active),
            "disabled" => Ok(ChannelStatus::Disabled),
            "error" => Ok(ChannelStatus::Error),
            other => Err(format!("unknown channel status: {other}")),
        }
    }
}

/// External provider a channel is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provider {
    Telegram,
    Other(String),
}

impl Provider {
    pub fn as_str(&self) -> &str {
        match self {
            Provider::Telegram => "telegram",
            Provider::Other(name) => name,
        }
    }
}

impl From<String> for Provider {
    fn from(s: String) -> Self {
        let normalized = s.trim().to_lowercase();
        if normalized == "telegram" {
            Provider::Telegram
        } else {
            Provider::Other(normalized)
        }
    }
}

impl From<Provider> for String {
    fn from(p: Provider) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Telegram-specific settings: bot identity plus the polling cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_username: Option<String>,
    #[serde(default)]
    pub bot_name: Option<String>,
    #[serde(default)]
    pub bot_id: Option<i64>,
    #[serde(default)]
    pub last_update_id: Option<i64>,
}

/// Provider settings, typed per provider. Unknown providers keep a plain
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChannelSettings {
    Telegram(TelegramSettings),
    Generic(serde_json::Map<String, serde_json::Value>),
}

const TELEGRAM_SETTINGS_KEYS: &[&str] = &["bot_username", "bot_name", "bot_id", "last_update_id"];

impl ChannelSettings {
    pub fn empty_for(provider: &Provider) -> Self {
        match provider {
            Provider::Telegram => ChannelSettings::Telegram(TelegramSettings::default()),
            Provider::Other(_) => ChannelSettings::Generic(serde_json::Map::new()),
        }
    }

    /// Interpret a JSON document according to the provider's settings shape.
    pub fn from_json(provider: &Provider, value: serde_json::Value) -> Result<Self, String> {
        let value = match value {
            serde_json::Value::Null => return Ok(Self::empty_for(provider)),
            v @ serde_json::Value::Object(_) => v,
            _ => return Err("settings must be a JSON object".into()),
        };
        match provider {
            Provider::Telegram => {
                if let Some(unknown) = value
                    .as_object()
                    .and_then(|m| m.keys().find(|k| !TELEGRAM_SETTINGS_KEYS.contains(&k.as_str())))
                {
                    return Err(format!("unknown telegram setting: {unknown}"));
                }
                serde_json::from_value(value)
                    .map(ChannelSettings::Telegram)
                    .map_err(|e| format!("invalid telegram settings: {e}"))
            }
            Provider::Other(_) => match value {
                serde_json::Value::Object(map) => Ok(ChannelSettings::Generic(map)),
                _ => Err("settings must be a JSON object".into()),
            },
        }
    }

    /// Lenient parse of a stored settings column. Unexpected keys are
    /// ignored; a corrupt document degrades to empty settings.
    pub fn from_stored(provider: &Provider, raw: &str) -> Self {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap_or_default();
        match provider {
            Provider::Telegram => serde_json::from_value(value)
                .map(ChannelSettings::Telegram)
                .unwrap_or_else(|_| Self::empty_for(provider)),
            Provider::Other(_) => match value {
                serde_json::Value::Object(map) => ChannelSettings::Generic(map),
                _ => Self::empty_for(provider),
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn telegram(&self) -> Option<&TelegramSettings> {
        match self {
            ChannelSettings::Telegram(s) => Some(s),
            ChannelSettings::Generic(_) => None,
        }
    }

    /// Current polling cursor, when one has been recorded.
    pub fn last_update_id(&self) -> Option<i64> {
        self.telegram().and_then(|s| s.last_update_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelegramSecrets {
    pub bot_token: Option<SecretString>,
}

/// Credentials, typed per provider. Never serialized into API responses.
#[derive(Debug, Clone)]
pub enum ChannelSecrets {
    Telegram(TelegramSecrets),
    Generic(serde_json::Map<String, serde_json::Value>),
}

impl ChannelSecrets {
    pub fn empty_for(provider: &Provider) -> Self {
        match provider {
            Provider::Telegram => ChannelSecrets::Telegram(TelegramSecrets::default()),
            Provider::Other(_) => ChannelSecrets::Generic(serde_json::Map::new()),
        }
    }

    pub fn from_json(provider: &Provider, raw: &str) -> Self {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap_or_default();
        match provider {
            Provider::Telegram => ChannelSecrets::Telegram(TelegramSecrets {
                bot_token: value
                    .get("bot_token")
                    .and_then(|t| t.as_str())
                    .filter(|t| !t.trim().is_empty())
                    .map(|t| SecretString::from(t.to_string())),
            }),
            Provider::Other(_) => match value {
                serde_json::Value::Object(map) => ChannelSecrets::Generic(map),
                _ => ChannelSecrets::Generic(serde_json::Map::new()),
            },
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            ChannelSecrets::Telegram(s) => serde_json::json!({
                "bot_token": s.bot_token.as_ref().map(|t| t.expose_secret().to_string()),
            }),
            ChannelSecrets::Generic(map) => serde_json::Value::Object(map.clone()),
        };
        value.to_string()
    }

    pub fn bot_token(&self) -> Option<&SecretString> {
        match self {
            ChannelSecrets::Telegram(s) => s.bot_token.as_ref(),
            ChannelSecrets::Generic(_) => None,
        }
    }
}

/// A group's binding to one external messaging provider.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: Uuid,
    pub group_id: i64,
    pub provider: Provider,
    pub display_name: String,
    pub status: ChannelStatus,
    pub settings: ChannelSettings,
    pub secrets: ChannelSecrets,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn bot_token(&self) -> Option<&SecretString> {
        self.secrets.bot_token()
    }

    pub fn has_token(&self) -> bool {
        self.bot_token().is_some()
    }

    /// Validate a status change against the state machine.
    pub fn check_transition(&self, next: ChannelStatus) -> Result<(), BridgeError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(BridgeError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// One external conversation under a channel.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub external_chat_id: String,
    pub external_user_id: Option<String>,
    pub kind: Option<String>,
    pub title: Option<String>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub last_update_id: Option<i64>,
    pub metadata: serde_json::Value,
    pub last_message_text: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "in")]
    Inbound,
    #[serde(rename = "out")]
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::Inbound),
            "out" => Ok(Direction::Outbound),
            other => Err(format!("direction must be 'in' or 'out', got '{other}'")),
        }
    }
}

/// Delivery state of a queued outbound file message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DeliveryStatus::Queued),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// A message inside a thread, inbound or outbound.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub direction: Direction,
    pub external_message_id: Option<String>,
    pub external_update_id: Option<i64>,
    pub sender_external_id: Option<String>,
    pub text: Option<String>,
    pub payload: serde_json::Value,
    pub delivery_status: Option<DeliveryStatus>,
    pub delivery_error: Option<String>,
    /// Provider timestamp of the message.
    pub sent_at: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a user inside a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Admin,
    Member,
}

impl GroupRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupRole::Admin => "admin",
            GroupRole::Member => "member",
        }
    }
}

impl FromStr for GroupRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(GroupRole::Admin),
            "member" => Ok(GroupRole::Member),
            other => Err(format!("unknown group role: {other}")),
        }
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

/// Pagination request, clamped per listing.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl PageRequest {
    /// Build a request from optional query values, applying the listing's
    /// default and upper bound.
    pub fn clamped(page: Option<u32>, per_page: Option<u32>, default: u32, max: u32) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(default).clamp(1, max),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_state_machine() {
        use ChannelStatus::*;
        assert!(Active.can_transition_to(Error));
        assert!(Error.can_transition_to(Active));
        assert!(Active.can_transition_to(Disabled));
        assert!(Error.can_transition_to(Disabled));
        assert!(Disabled.can_transition_to(Active));
        assert!(Disabled.can_transition_to(Disabled));
        assert!(!Disabled.can_transition_to(Error));
    }

    #[test]
    fn provider_normalizes() {
        assert_eq!(Provider::from("  Telegram ".to_string()), Provider::Telegram);
        assert_eq!(
            Provider::from("Slack".to_string()),
            Provider::Other("slack".into())
        );
    }

    #[test]
    fn telegram_settings_reject_unknown_fields() {
        let err = ChannelSettings::from_json(
            &Provider::Telegram,
            serde_json::json!({"bot_username": "x", "colour": "red"}),
        );
        assert!(err.is_err());

        let ok = ChannelSettings::from_json(
            &Provider::Telegram,
            serde_json::json!({"last_update_id": 100}),
        )
        .unwrap();
        assert_eq!(ok.last_update_id(), Some(100));
    }

    #[test]
    fn stored_settings_tolerate_extra_keys() {
        let s = ChannelSettings::from_stored(
            &Provider::Telegram,
            r#"{"last_update_id": 42, "legacy": true}"#,
        );
        assert_eq!(s.last_update_id(), Some(42));

        let s = ChannelSettings::from_stored(&Provider::Telegram, "not json");
        assert_eq!(s, ChannelSettings::Telegram(TelegramSettings::default()));
    }

    #[test]
    fn generic_settings_keep_object() {
        let s = ChannelSettings::from_json(
            &Provider::Other("slack".into()),
            serde_json::json!({"team": "T1"}),
        )
        .unwrap();
        assert_eq!(s.to_json(), r#"{"team":"T1"}"#);
    }

    #[test]
    fn secrets_round_trip_and_blank_token() {
        let s = ChannelSecrets::from_json(&Provider::Telegram, r#"{"bot_token":"123:abc"}"#);
        assert_eq!(s.bot_token().unwrap().expose_secret(), "123:abc");

        let blank = ChannelSecrets::from_json(&Provider::Telegram, r#"{"bot_token":""}"#);
        assert!(blank.bot_token().is_none());

        let cleared = ChannelSecrets::Telegram(TelegramSecrets::default());
        assert_eq!(cleared.to_json(), r#"{"bot_token":null}"#);
    }

    #[test]
    fn page_request_clamps() {
        let p = PageRequest::clamped(None, None, 30, 100);
        assert_eq!((p.page, p.per_page, p.offset()), (1, 30, 0));

        let p = PageRequest::clamped(Some(3), Some(500), 50, 200);
        assert_eq!((p.page, p.per_page, p.offset()), (3, 200, 400));

        let p = PageRequest::clamped(Some(0), Some(0), 50, 200);
        assert_eq!((p.page, p.per_page), (1, 1));
    }
}
