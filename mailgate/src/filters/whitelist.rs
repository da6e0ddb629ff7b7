//! Auto-whitelist: remembers who authenticated users write to.
//!
//! Mail from an authenticated sender records every (sender, recipient) pair.
//! Mail from anyone else is accepted outright when *every* recipient has
//! previously been written to by that address, i.e. the message is a reply
//! within an established correspondence.

use async_trait::async_trait;
use tracing::{debug, error};

use super::{Decision, Filter, MessageContext};
use crate::config::{CfgStore, CfgWhitelist};
use crate::fingerprint::fingerprint;
use crate::storage::{unix_time, Store, StoreError};

pub const STORE_NAME: &str = "whitelist";

pub struct AutoWhitelist {
    store: Store,
}

impl AutoWhitelist {
    pub async fn open(cfg: &CfgWhitelist, store_cfg: &CfgStore) -> Result<Self, StoreError> {
        let store = Store::open(STORE_NAME, cfg.ttl, cfg.purge_interval, store_cfg).await?;
        Ok(Self::new(store))
    }

    pub fn new(store: Store) -> Self {
        AutoWhitelist { store }
    }

    pub async fn check_at(&self, msg: &MessageContext, now: i64) -> Result<Decision, StoreError> {
        self.store.purge_at(now).await?;

        let sender = msg.sender.trim();
        if sender.is_empty() {
            return Ok(Decision::NoOpinion);
        }
        let correspondents = msg.correspondents();

        if msg.is_authenticated() {
            let mut guard = self.store.lock().await?;
            for recipient in &correspondents {
                // The pair is stored from the replier's point of view.
                guard.set(&fingerprint(&[recipient, sender]), now).await?;
            }
            guard.unlock().await?;
            debug!(sender, recipients = correspondents.len(), "Recorded correspondents");
            return Ok(Decision::NoOpinion);
        }

        if correspondents.is_empty() {
            return Ok(Decision::NoOpinion);
        }

        let mut guard = self.store.lock().await?;
        for recipient in &correspondents {
            if !guard.contains(&fingerprint(&[sender, recipient])).await? {
                return Ok(Decision::NoOpinion);
            }
        }
        guard.unlock().await?;

        debug!(sender, "All recipients are known correspondents");
        Ok(Decision::Accept)
    }
}

#[async_trait]
impl Filter for AutoWhitelist {
    async fn check(&self, msg: &MessageContext) -> Decision {
        match self.check_at(msg, unix_time()).await {
            Ok(decision) => decision,
            Err(err) => {
                error!(sender = %msg.sender, error = %err, "Auto-whitelist store failure");
                Decision::NoOpinion
            }
        }
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.store.purge().await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "whitelist"
    }
}
