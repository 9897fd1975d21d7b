use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{SubscriptionUpdate, UsersPresencePayload},
};
use tracing::debug;

/// Batch resolution endpoint. Identifiers missing from the payload are
/// treated as offline; an `Err` fails the whole batch.
#[async_trait]
pub trait PresenceFetcher: Send + Sync {
    async fn fetch_presence(&self, ids: &[UserId]) -> Result<UsersPresencePayload>;
}

/// Live presence stream: receives the interest delta of every cycle.
#[async_trait]
pub trait PresenceSubscription: Send + Sync {
    async fn update(&self, update: SubscriptionUpdate) -> Result<()>;
}

pub struct MissingPresenceFetcher;

#[async_trait]
impl PresenceFetcher for MissingPresenceFetcher {
    async fn fetch_presence(&self, ids: &[UserId]) -> Result<UsersPresencePayload> {
        Err(anyhow!(
            "presence fetcher unavailable for {} identifiers",
            ids.len()
        ))
    }
}

pub struct MissingPresenceSubscription;

#[async_trait]
impl PresenceSubscription for MissingPresenceSubscription {
    async fn update(&self, update: SubscriptionUpdate) -> Result<()> {
        debug!(?update, "presence: no live subscription configured, dropping update");
        Ok(())
    }
}
