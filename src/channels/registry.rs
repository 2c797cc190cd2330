//! Channel registry: credentialed configuration of (group, provider) pairs.
//!
//! Every mutating operation requires the caller to administer the owning
//! group; reads require membership. A channel addressed under a group it
//! does not belong to is reported as not found.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use uuid::Uuid;

use crate::channels::model::{
    Channel, ChannelSecrets, ChannelSettings, ChannelStatus, GroupRole, Page, PageRequest,
    Provider, TelegramSecrets, TelegramSettings, Thread,
};
use crate::error::{BridgeError, DatabaseError};
use crate::store::{ChannelPatch, Database};
use crate::telegram::TelegramClient;

const MAX_PROVIDER_LEN: usize = 32;
const MAX_DISPLAY_NAME_LEN: usize = 120;
const MIN_TOKEN_LEN: usize = 20;
const MAX_TOKEN_LEN: usize = 255;

pub const THREADS_DEFAULT_PER_PAGE: u32 = 30;
pub const THREADS_MAX_PER_PAGE: u32 = 100;

/// Administrator-supplied partial update. Raw values are validated here.
#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub settings: Option<serde_json::Value>,
}

pub struct ChannelRegistry {
    db: Arc<dyn Database>,
    telegram: TelegramClient,
}

impl ChannelRegistry {
    pub fn new(db: Arc<dyn Database>, telegram: TelegramClient) -> Self {
        Self { db, telegram }
    }

    pub async fn list(&self, user_id: i64, group_id: i64) -> Result<Vec<Channel>, BridgeError> {
        require_member(self.db.as_ref(), group_id, user_id).await?;
        Ok(self.db.list_channels(group_id).await?)
    }

    pub async fn create(
        &self,
        user_id: i64,
        group_id: i64,
        provider: &str,
        display_name: &str,
    ) -> Result<Channel, BridgeError> {
        require_admin(self.db.as_ref(), group_id, user_id).await?;

        let provider = provider.trim().to_lowercase();
        let provider_len = provider.chars().count();
        if provider_len == 0 || provider_len > MAX_PROVIDER_LEN {
            return Err(BridgeError::Validation(format!(
                "provider must be 1-{MAX_PROVIDER_LEN} characters"
            )));
        }
        let display_name = validate_display_name(display_name)?;
        let provider = Provider::from(provider);

        match self.db.create_channel(group_id, &provider, &display_name).await {
            Ok(channel) => {
                info!(channel_id = %channel.id, group_id, provider = %provider, "Channel created");
                Ok(channel)
            }
            Err(DatabaseError::Constraint(_)) => Err(BridgeError::Conflict(format!(
                "A {provider} channel already exists for this group"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(
        &self,
        user_id: i64,
        group_id: i64,
        channel_id: Uuid,
        update: ChannelUpdate,
    ) -> Result<Channel, BridgeError> {
        require_admin(self.db.as_ref(), group_id, user_id).await?;
        let channel = channel_in_group(self.db.as_ref(), group_id, channel_id).await?;

        let mut patch = ChannelPatch::default();
        if let Some(name) = update.display_name.as_deref() {
            patch.display_name = Some(validate_display_name(name)?);
        }
        if let Some(raw) = update.status.as_deref() {
            let next: ChannelStatus = raw
                .trim()
                .parse()
                .map_err(|_| BridgeError::Validation("status must be active, disabled or error".into()))?;
            channel.check_transition(next)?;
            if next != channel.status {
                patch.status = Some(next);
            }
        }
        if let Some(value) = update.settings {
            patch.settings = Some(
                ChannelSettings::from_json(&channel.provider, value).map_err(BridgeError::Validation)?,
            );
        }

        let updated = self
            .db
            .update_channel(channel.id, &patch)
            .await?
            .ok_or_else(|| BridgeError::NotFound("Channel not found".into()))?;
        if updated.status != channel.status {
            info!(
                channel_id = %channel.id,
                from = %channel.status,
                to = %updated.status,
                "Channel status changed"
            );
        }
        Ok(updated)
    }

    pub async fn delete(
        &self,
        user_id: i64,
        group_id: i64,
        channel_id: Uuid,
    ) -> Result<(), BridgeError> {
        require_admin(self.db.as_ref(), group_id, user_id).await?;
        let channel = channel_in_group(self.db.as_ref(), group_id, channel_id).await?;
        self.db.delete_channel(channel.id).await?;
        info!(channel_id = %channel.id, group_id, "Channel deleted");
        Ok(())
    }

    /// Validate a bot token against the provider and bind it to the
    /// channel. The identity check is never retried.
    pub async fn connect_telegram(
        &self,
        user_id: i64,
        group_id: i64,
        channel_id: Uuid,
        bot_token: SecretString,
    ) -> Result<Channel, BridgeError> {
        require_admin(self.db.as_ref(), group_id, user_id).await?;
        let channel = channel_in_group(self.db.as_ref(), group_id, channel_id).await?;
        require_telegram(&channel)?;

        let token = SecretString::from(bot_token.expose_secret().trim().to_string());
        let token_len = token.expose_secret().chars().count();
        if !(MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&token_len) {
            return Err(BridgeError::Validation(format!(
                "bot_token must be {MIN_TOKEN_LEN}-{MAX_TOKEN_LEN} characters"
            )));
        }
        channel.check_transition(ChannelStatus::Active)?;

        let me = self.telegram.get_me(&token).await.map_err(|e| {
            warn!(channel_id = %channel.id, error = %e, "Bot token validation failed");
            BridgeError::Validation("Telegram token validation failed".into())
        })?;

        let settings = TelegramSettings {
            bot_username: me.username.clone(),
            bot_name: me.first_name.clone(),
            bot_id: me.id.as_str().parse().ok(),
            last_update_id: None,
        };
        let patch = ChannelPatch {
            status: Some(ChannelStatus::Active),
            settings: Some(ChannelSettings::Telegram(settings)),
            secrets: Some(ChannelSecrets::Telegram(TelegramSecrets {
                bot_token: Some(token),
            })),
            ..Default::default()
        };
        let updated = self
            .db
            .update_channel(channel.id, &patch)
            .await?
            .ok_or_else(|| BridgeError::NotFound("Channel not found".into()))?;

        info!(
            channel_id = %channel.id,
            group_id,
            bot_username = me.username.as_deref().unwrap_or(""),
            "Telegram channel connected"
        );
        Ok(updated)
    }

    /// Forget the token, bot identity, and cursor; disable the channel.
    pub async fn disconnect_telegram(
        &self,
        user_id: i64,
        group_id: i64,
        channel_id: Uuid,
    ) -> Result<Channel, BridgeError> {
        require_admin(self.db.as_ref(), group_id, user_id).await?;
        let channel = channel_in_group(self.db.as_ref(), group_id, channel_id).await?;
        require_telegram(&channel)?;
        channel.check_transition(ChannelStatus::Disabled)?;

        let patch = ChannelPatch {
            status: Some(ChannelStatus::Disabled),
            settings: Some(ChannelSettings::Telegram(TelegramSettings::default())),
            secrets: Some(ChannelSecrets::Telegram(TelegramSecrets::default())),
            ..Default::default()
        };
        let updated = self
            .db
            .update_channel(channel.id, &patch)
            .await?
            .ok_or_else(|| BridgeError::NotFound("Channel not found".into()))?;

        info!(channel_id = %channel.id, group_id, "Telegram channel disconnected");
        Ok(updated)
    }

    pub async fn threads(
        &self,
        user_id: i64,
        group_id: i64,
        channel_id: Uuid,
        query: Option<&str>,
        page: PageRequest,
    ) -> Result<Page<Thread>, BridgeError> {
        require_member(self.db.as_ref(), group_id, user_id).await?;
        let channel = channel_in_group(self.db.as_ref(), group_id, channel_id).await?;
        Ok(self.db.list_threads(channel.id, query, page).await?)
    }
}

fn validate_display_name(raw: &str) -> Result<String, BridgeError> {
    let name = raw.trim();
    let len = name.chars().count();
    if len == 0 || len > MAX_DISPLAY_NAME_LEN {
        return Err(BridgeError::Validation(format!(
            "display_name must be 1-{MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

fn require_telegram(channel: &Channel) -> Result<(), BridgeError> {
    if channel.provider != Provider::Telegram {
        return Err(BridgeError::Validation(format!(
            "Channel provider is {}, not telegram",
            channel.provider
        )));
    }
    Ok(())
}

pub(crate) async fn require_member(
    db: &dyn Database,
    group_id: i64,
    user_id: i64,
) -> Result<GroupRole, BridgeError> {
    db.group_role(group_id, user_id)
        .await?
        .ok_or_else(|| BridgeError::Forbidden("Not a member of this group".into()))
}

pub(crate) async fn require_admin(
    db: &dyn Database,
    group_id: i64,
    user_id: i64,
) -> Result<(), BridgeError> {
    match require_member(db, group_id, user_id).await? {
        GroupRole::Admin => Ok(()),
        GroupRole::Member => Err(BridgeError::Forbidden(
            "Group administrator role required".into(),
        )),
    }
}

async fn channel_in_group(
    db: &dyn Database,
    group_id: i64,
    channel_id: Uuid,
) -> Result<Channel, BridgeError> {
    db.get_channel(channel_id)
        .await?
        .filter(|c| c.group_id == group_id)
        .ok_or_else(|| BridgeError::NotFound("Channel not found".into()))
}

/// Load a thread and its channel for a caller who must be a member of the
/// owning group.
pub(crate) async fn thread_for_member(
    db: &dyn Database,
    user_id: i64,
    thread_id: Uuid,
) -> Result<(Thread, Channel), BridgeError> {
    let thread = db
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound("Thread not found".into()))?;
    let channel = db
        .get_channel(thread.channel_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound("Thread not found".into()))?;
    require_member(db, channel.group_id, user_id).await?;
    Ok((thread, channel))
}
