//! Simple retry check.
//!
//! Asks for every new (sender, recipient) pair to be delivered a second time,
//! with no minimum delay. Real MTAs retry; fire-and-forget senders do not.

use async_trait::async_trait;
use tracing::{error, info};

use super::{Decision, Filter, MessageContext, LOCAL_FAILURE};
use crate::config::{CfgComeagain, CfgStore};
use crate::fingerprint::fingerprint;
use crate::storage::{unix_time, Store, StoreError};

pub const STORE_NAME: &str = "comeagain";

pub const SEND_AGAIN: &str = "421 Please send the message again.";

pub struct Comeagain {
    store: Store,
}

impl Comeagain {
    pub async fn open(cfg: &CfgComeagain, store_cfg: &CfgStore) -> Result<Self, StoreError> {
        let store = Store::open(STORE_NAME, cfg.ttl, cfg.purge_interval, store_cfg).await?;
        Ok(Self::new(store))
    }

    pub fn new(store: Store) -> Self {
        Comeagain { store }
    }

    pub async fn check_at(&self, msg: &MessageContext, now: i64) -> Decision {
        let sender = msg.sender.trim();
        if sender.is_empty() || msg.is_authenticated() {
            return Decision::NoOpinion;
        }

        match self.record(sender, &msg.correspondents(), now).await {
            Ok(0) => Decision::NoOpinion,
            Ok(unseen) => {
                info!(sender, unseen, "First delivery attempt, asking for a retry");
                Decision::TempFail(SEND_AGAIN.to_string())
            }
            Err(err) => {
                error!(sender, error = %err, "Comeagain store failure");
                Decision::TempFail(LOCAL_FAILURE.to_string())
            }
        }
    }

    /// Stamps every pair with `now` and returns how many were new.
    async fn record(&self, sender: &str, recipients: &[String], now: i64) -> Result<usize, StoreError> {
        self.store.purge_at(now).await?;

        let mut guard = self.store.lock().await?;
        let mut unseen = 0;
        for recipient in recipients {
            let key = fingerprint(&[sender, recipient]);
            if !guard.contains(&key).await? {
                unseen += 1;
            }
            guard.set(&key, now).await?;
        }
        guard.unlock().await?;
        Ok(unseen)
    }
}

#[async_trait]
impl Filter for Comeagain {
    async fn check(&self, msg: &MessageContext) -> Decision {
        self.check_at(msg, unix_time()).await
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.store.purge().await.map(|_| ())
    }

    fn name(&self) -> &'static str {
        "comeagain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    const NOW: i64 = 1_700_000_000;

    fn comeagain() -> Comeagain {
        Comeagain::new(Store::with_backend(
            STORE_NAME,
            7 * 86400,
            3600,
            Box::new(MemoryBackend::new()),
        ))
    }

    fn message(sender: &str, recipients: &[&str]) -> MessageContext {
        MessageContext {
            sender: sender.to_string(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            sender_ip: Some("192.0.2.1".to_string()),
            auth_user: None,
        }
    }

    #[tokio::test]
    async fn test_second_attempt_is_let_through() {
        let ca = comeagain();
        let msg = message("a@remote.example", &["me@local.example"]);

        assert_eq!(
            ca.check_at(&msg, NOW).await,
            Decision::TempFail(SEND_AGAIN.to_string())
        );
        // No minimum delay.
        assert_eq!(ca.check_at(&msg, NOW).await, Decision::NoOpinion);
    }

    #[tokio::test]
    async fn test_one_new_recipient_defers_the_message() {
        let ca = comeagain();
        ca.check_at(&message("a@remote.example", &["one@local.example"]), NOW)
            .await;

        let both = message("a@remote.example", &["one@local.example", "two@local.example"]);
        assert_eq!(
            ca.check_at(&both, NOW + 10).await,
            Decision::TempFail(SEND_AGAIN.to_string())
        );
        assert_eq!(ca.check_at(&both, NOW + 20).await, Decision::NoOpinion);
    }

    #[tokio::test]
    async fn test_pairs_are_refreshed_and_expire() {
        let ca = comeagain();
        let msg = message("a@remote.example", &["me@local.example"]);
        ca.check_at(&msg, NOW).await;

        let week = 7 * 86400;
        assert_eq!(ca.check_at(&msg, NOW + week - 10).await, Decision::NoOpinion);
        // Refreshed above, so still known a week after the first sighting.
        assert_eq!(ca.check_at(&msg, NOW + week + 10).await, Decision::NoOpinion);

        let silent = NOW + 3 * week;
        assert_eq!(
            ca.check_at(&msg, silent).await,
            Decision::TempFail(SEND_AGAIN.to_string())
        );
    }

    #[tokio::test]
    async fn test_exempt_messages() {
        let ca = comeagain();
        assert_eq!(
            ca.check_at(&message("", &["me@local.example"]), NOW).await,
            Decision::NoOpinion
        );
        assert_eq!(
            ca.check_at(&message("me@local.example", &["me@local.example"]), NOW)
                .await,
            Decision::NoOpinion
        );

        let mut authenticated = message("a@remote.example", &["me@local.example"]);
        authenticated.auth_user = Some("a".to_string());
        assert_eq!(ca.check_at(&authenticated, NOW).await, Decision::NoOpinion);
    }
}
