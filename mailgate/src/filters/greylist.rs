//! Greylisting.
//!
//! Every (sender, recipient, sender network) triplet must be seen twice, at
//! least `delay` seconds apart, before mail for it is accepted. Triplets
//! waiting out their delay live in the short-lived `not_passed` store; once a
//! retry arrives after the delay the triplet moves to the long-lived `passed`
//! store and is refreshed on every later message. A triplet is never in both.
//!
//! Lock order is always `not_passed` then `passed`.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Decision, Filter, MessageContext, LOCAL_FAILURE};
use crate::config::{CfgGreylist, CfgStore};
use crate::fingerprint::{fingerprint, network_prefix};
use crate::storage::{unix_time, Store, StoreError};

pub const NOT_PASSED_STORE: &str = "greylist_not_passed";
pub const PASSED_STORE: &str = "greylist_passed";

pub const UNKNOWN_NETWORK: &str = "451 4.3.0 Unable to determine sender network";

/// Where one recipient's triplet stands after this message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    /// Never seen before; recorded now.
    FirstContact,
    /// Seen before, but the delay has not elapsed yet.
    Waiting { remaining: i64 },
    Passed,
}

impl RecipientState {
    fn remaining(&self, delay: i64) -> Option<i64> {
        match self {
            RecipientState::FirstContact => Some(delay),
            RecipientState::Waiting { remaining } => Some(*remaining),
            RecipientState::Passed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreylistVerdict {
    pub delay: i64,
    pub recipients: Vec<(String, RecipientState)>,
}

impl GreylistVerdict {
    pub fn all_passed(&self) -> bool {
        self.recipients
            .iter()
            .all(|(_, state)| *state == RecipientState::Passed)
    }

    /// Longest wait among the recipients that did not pass.
    pub fn max_remaining(&self) -> Option<i64> {
        self.recipients
            .iter()
            .filter_map(|(_, state)| state.remaining(self.delay))
            .max()
    }

    pub fn decision(&self) -> Decision {
        match self.max_remaining() {
            None => Decision::NoOpinion,
            Some(remaining) => Decision::TempFail(format!(
                "451 4.7.1 Greylisted, please try again in {}",
                format_hms(remaining)
            )),
        }
    }
}

/// Formats seconds as `HH:MM:SS`.
pub fn format_hms(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub struct Greylist {
    not_passed: Store,
    passed: Store,
    delay: i64,
}

impl Greylist {
    pub async fn open(cfg: &CfgGreylist, store_cfg: &CfgStore) -> Result<Self, StoreError> {
        let not_passed = Store::open(
            NOT_PASSED_STORE,
            cfg.not_passed_ttl,
            cfg.purge_interval,
            store_cfg,
        )
        .await?;
        let passed =
            Store::open(PASSED_STORE, cfg.passed_ttl, cfg.purge_interval, store_cfg).await?;
        Ok(Self::new(not_passed, passed, cfg.delay))
    }

    pub fn new(not_passed: Store, passed: Store, delay: u64) -> Self {
        Greylist {
            not_passed,
            passed,
            delay: delay as i64,
        }
    }

    pub async fn check_at(&self, msg: &MessageContext, now: i64) -> Decision {
        let sender = msg.sender.trim();
        if sender.is_empty() || msg.is_authenticated() {
            return Decision::NoOpinion;
        }
        let ip = match msg.sender_ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => ip,
            _ => return Decision::NoOpinion,
        };
        let Some(network) = network_prefix(ip) else {
            warn!(sender, ip, "Cannot derive a network from the sender address");
            return Decision::TempFail(UNKNOWN_NETWORK.to_string());
        };

        let verdict = match self.purge_at(now).await {
            Ok(()) => self.evaluate(sender, &msg.correspondents(), &network, now).await,
            Err(err) => Err(err),
        };
        match verdict {
            Ok(verdict) => {
                if !verdict.all_passed() {
                    info!(
                        sender,
                        network,
                        remaining = verdict.max_remaining(),
                        "Greylisting message"
                    );
                }
                verdict.decision()
            }
            Err(err) => {
                error!(sender, error = %err, "Greylist store failure");
                Decision::TempFail(LOCAL_FAILURE.to_string())
            }
        }
    }

    async fn purge_at(&self, now: i64) -> Result<(), StoreError> {
        self.not_passed.purge_at(now).await?;
        self.passed.purge_at(now).await?;
        Ok(())
    }

    /// Advances the triplet of every recipient. `recipients` must already be
    /// lower-cased and exclude the sender.
    pub async fn evaluate(
        &self,
        sender: &str,
        recipients: &[String],
        network: &str,
        now: i64,
    ) -> Result<GreylistVerdict, StoreError> {
        let mut states = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let triplet = fingerprint(&[sender, recipient, network]);
            let state = self.advance(&triplet, now).await?;
            debug!(sender, recipient, network, ?state, "Greylist triplet");
            states.push((recipient.clone(), state));
        }
        Ok(GreylistVerdict {
            delay: self.delay,
            recipients: states,
        })
    }

    async fn advance(&self, triplet: &str, now: i64) -> Result<RecipientState, StoreError> {
        let mut not_passed = self.not_passed.lock().await?;
        let mut passed = self.passed.lock().await?;

        let state = if let Some(first_seen) = not_passed.get(triplet).await? {
            let elapsed = now - first_seen;
            if elapsed < 0 {
                // First sighting lies in the future: restart the clock.
                warn!(triplet, first_seen, now, "Greylist timestamp ahead of clock");
                not_passed.set(triplet, now).await?;
                RecipientState::FirstContact
            } else if elapsed < self.delay {
                RecipientState::Waiting {
                    remaining: self.delay - elapsed,
                }
            } else {
                passed.set(triplet, now).await?;
                not_passed.delete(triplet).await?;
                RecipientState::Passed
            }
        } else if passed.contains(triplet).await? {
            passed.set(triplet, now).await?;
            RecipientState::Passed
        } else {
            not_passed.set(triplet, now).await?;
            RecipientState::FirstContact
        };

        passed.unlock().await?;
        not_passed.unlock().await?;
        Ok(state)
    }
}

#[async_trait]
impl Filter for Greylist {
    async fn check(&self, msg: &MessageContext) -> Decision {
        self.check_at(msg, unix_time()).await
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.purge_at(unix_time()).await
    }

    fn name(&self) -> &'static str {
        "greylist"
    }
}
