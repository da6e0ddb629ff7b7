use async_trait::async_trait;
use miette::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Cfg;
use crate::dialback::{resolver::DnsResolver, Dialback};
use crate::storage::StoreError;

pub mod comeagain;
pub mod greylist;
pub mod whitelist;

/// Decision returned when a filter's own state cannot be read or written.
pub const LOCAL_FAILURE: &str = "451 4.3.0 Temporary local problem, please try again later";

/// Envelope data of one message, as read from the MTA's control file.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    /// Envelope sender; empty for bounces.
    pub sender: String,
    pub recipients: Vec<String>,
    /// Address of the connecting client; `None` for locally submitted mail.
    pub sender_ip: Option<String>,
    /// SMTP AUTH identity, when the client authenticated.
    pub auth_user: Option<String>,
}

impl MessageContext {
    pub fn is_authenticated(&self) -> bool {
        self.auth_user.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Lower-cased recipients, minus any that equal the sender.
    pub fn correspondents(&self) -> Vec<String> {
        self.recipients
            .iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty() && !crate::fingerprint::same_address(r, self.sender.trim()))
            .collect()
    }
}

/// Outcome of a filter, rendered as an SMTP-style reply string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Let other filters and the MTA decide. Renders as `""`.
    NoOpinion,
    /// Accept the message and skip the remaining filters. Renders as `200 Ok`.
    Accept,
    /// Full 4xx reply.
    TempFail(String),
    /// Full 5xx reply.
    Reject(String),
}

impl Decision {
    pub fn is_final(&self) -> bool {
        !matches!(self, Decision::NoOpinion)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::NoOpinion => Ok(()),
            Decision::Accept => f.write_str("200 Ok"),
            Decision::TempFail(reply) | Decision::Reject(reply) => f.write_str(reply),
        }
    }
}

#[async_trait]
pub trait Filter: Send + Sync {
    async fn check(&self, msg: &MessageContext) -> Decision;

    /// Runs the throttled purge of every store the filter owns.
    async fn purge(&self) -> Result<(), StoreError>;

    /// Short name used in log fields and by `--filter`.
    fn name(&self) -> &'static str;
}

/// Runs `filters` in order and returns the first decision that is not
/// [`Decision::NoOpinion`].
pub async fn run_chain(filters: &[Box<dyn Filter>], msg: &MessageContext) -> Decision {
    for filter in filters {
        let decision = filter.check(msg).await;
        debug!(filter = filter.name(), %decision, "Filter decision");
        if decision.is_final() {
            info!(filter = filter.name(), sender = %msg.sender, %decision, "Message decided");
            return decision;
        }
    }
    Decision::NoOpinion
}

/// Chain order used when no explicit selection is given.
pub const FILTER_ORDER: [&str; 4] = ["whitelist", "dialback", "greylist", "comeagain"];

/// Opens the filters named in `only`, or every enabled filter when `only` is
/// empty, in [`FILTER_ORDER`]. Any store that cannot be opened aborts start-up.
pub async fn open_filters(cfg: &Cfg, only: &[String]) -> Result<Vec<Box<dyn Filter>>> {
    if let Some(unknown) = only
        .iter()
        .find(|name| !FILTER_ORDER.contains(&name.as_str()))
    {
        miette::bail!("unknown filter {:?}", unknown);
    }

    let wanted = |name: &str, enabled: bool| {
        if only.is_empty() {
            enabled
        } else {
            only.iter().any(|n| n == name)
        }
    };

    let mut filters: Vec<Box<dyn Filter>> = Vec::new();
    if wanted("whitelist", cfg.whitelist.enabled) {
        let filter = whitelist::AutoWhitelist::open(&cfg.whitelist, &cfg.store)
            .await
            .wrap_err("initializing auto-whitelist")?;
        filters.push(Box::new(filter));
    }
    if wanted("dialback", cfg.dialback.enabled) {
        let resolver = DnsResolver::new(&cfg.dialback).wrap_err("creating dns resolver")?;
        let filter = Dialback::open(&cfg.dialback, &cfg.store, Arc::new(resolver))
            .await
            .wrap_err("initializing dialback")?;
        filters.push(Box::new(filter));
    }
    if wanted("greylist", cfg.greylist.enabled) {
        let filter = greylist::Greylist::open(&cfg.greylist, &cfg.store)
            .await
            .wrap_err("initializing greylist")?;
        filters.push(Box::new(filter));
    }
    if wanted("comeagain", cfg.comeagain.enabled) {
        let filter = comeagain::Comeagain::open(&cfg.comeagain, &cfg.store)
            .await
            .wrap_err("initializing comeagain")?;
        filters.push(Box::new(filter));
    }
    Ok(filters)
}
