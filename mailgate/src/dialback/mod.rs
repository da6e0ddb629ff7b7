//! Sender verification by SMTP callback.
//!
//! The sender's mail exchangers are asked, one after the other, whether they
//! would accept mail for the envelope sender. A `2xx` or `5xx` answer to
//! `RCPT TO` settles the question and is remembered in the `good` or `bad`
//! verdict cache; anything else moves on to the next exchanger. Nothing past
//! `RCPT TO` is ever sent.

use async_trait::async_trait;
use miette::Diagnostic;
use smtp::{Reply, ReplyClass, SmtpClient, SmtpError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{CfgDialback, CfgStore};
use crate::filters::{Decision, Filter, MessageContext, LOCAL_FAILURE};
use crate::fingerprint::fingerprint;
use crate::storage::{unix_time, Store, StoreError};

pub mod resolver;
use resolver::{MailExchanger, MxResolver};

pub const GOOD_STORE: &str = "dialback_good";
pub const BAD_STORE: &str = "dialback_bad";

pub const INVALID_SENDER: &str = "517 Envelope sender invalid";
pub const CACHED_BAD: &str = "517 Sender does not exist (cached dialback result)";
pub const UNAVAILABLE: &str = "421 No SMTP servers were available to authenticate sender";

/// Upper bound on waiting for the answer to `QUIT`.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a single exchanger could not give a verdict.
#[derive(Debug, Error, Diagnostic)]
pub enum ProbeError {
    #[error("Cannot connect to {host}: {source}")]
    #[diagnostic(code(mailgate::dialback::connect))]
    Connect {
        host: String,
        #[source]
        source: SmtpError,
    },

    #[error("SMTP conversation with {host} failed: {source}")]
    #[diagnostic(code(mailgate::dialback::protocol))]
    Protocol {
        host: String,
        #[source]
        source: SmtpError,
    },

    #[error("{host} did not answer within {timeout:?}")]
    #[diagnostic(code(mailgate::dialback::timeout))]
    Timeout { host: String, timeout: Duration },
}

/// What one exchanger said about the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ProbeOutcome {
    Accepted,
    Rejected(Reply),
    /// No verdict; carries the reply that ended the conversation.
    Deferred(Reply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialbackVerdict {
    CachedGood,
    CachedBad,
    InvalidSender,
    /// The domain has no exchangers at all. Let through.
    Unresolvable,
    Verified { host: String },
    Rejected(Reply),
    /// Every exchanger failed; carries the last reply any of them gave.
    Indeterminate(Option<Reply>),
}

impl DialbackVerdict {
    pub fn decision(&self) -> Decision {
        match self {
            DialbackVerdict::CachedGood
            | DialbackVerdict::Unresolvable
            | DialbackVerdict::Verified { .. } => Decision::NoOpinion,
            DialbackVerdict::CachedBad => Decision::Reject(CACHED_BAD.to_string()),
            DialbackVerdict::InvalidSender => Decision::Reject(INVALID_SENDER.to_string()),
            DialbackVerdict::Rejected(reply) => {
                let text = reply.text();
                if text.is_empty() {
                    Decision::Reject(format!("517 Sender rejected with code {}", reply.code))
                } else {
                    Decision::Reject(format!("517 {}", text))
                }
            }
            DialbackVerdict::Indeterminate(None) => Decision::TempFail(UNAVAILABLE.to_string()),
            DialbackVerdict::Indeterminate(Some(reply)) => {
                Decision::TempFail(format!("{}: {}", UNAVAILABLE, reply))
            }
        }
    }
}

/// How this host presents itself to the servers it probes.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub helo_name: String,
    /// Reverse path of the probe; empty for `MAIL FROM:<>`.
    pub probe_from: String,
    /// Bound on one whole conversation, connect included.
    pub smtp_timeout: Duration,
}

impl ProbeSettings {
    pub async fn from_config(cfg: &CfgDialback) -> Self {
        let helo_name = match &cfg.helo_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => system_hostname().await,
        };
        let probe_from = match &cfg.probe_from {
            Some(from) => from.trim().to_string(),
            None => format!("postmaster@{}", helo_name),
        };
        if probe_from.is_empty() {
            warn!("Dialback probes use the null reverse path; some servers refuse those");
        }
        ProbeSettings {
            helo_name,
            probe_from,
            smtp_timeout: Duration::from_secs(cfg.smtp_timeout),
        }
    }
}

async fn system_hostname() -> String {
    match tokio::fs::read_to_string("/etc/hostname").await {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => "localhost".to_string(),
    }
}

/// `local@domain` with both halves non-empty; returns the domain.
fn sender_domain(sender: &str) -> Option<&str> {
    let (local, domain) = sender.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains(char::is_whitespace) {
        return None;
    }
    Some(domain)
}

pub struct Dialback {
    good: Store,
    bad: Store,
    resolver: Arc<dyn MxResolver>,
    settings: ProbeSettings,
}

impl Dialback {
    pub async fn open(
        cfg: &CfgDialback,
        store_cfg: &CfgStore,
        resolver: Arc<dyn MxResolver>,
    ) -> Result<Self, StoreError> {
        let good = Store::open(GOOD_STORE, cfg.good_ttl, cfg.purge_interval, store_cfg).await?;
        let bad = Store::open(BAD_STORE, cfg.bad_ttl, cfg.purge_interval, store_cfg).await?;
        let settings = ProbeSettings::from_config(cfg).await;
        info!(helo = %settings.helo_name, from = %settings.probe_from, "Dialback ready");
        Ok(Self::new(good, bad, resolver, settings))
    }

    pub fn new(
        good: Store,
        bad: Store,
        resolver: Arc<dyn MxResolver>,
        settings: ProbeSettings,
    ) -> Self {
        Dialback {
            good,
            bad,
            resolver,
            settings,
        }
    }

    pub async fn check_at(&self, msg: &MessageContext, now: i64) -> Decision {
        let sender = msg.sender.trim();
        if sender.is_empty() || msg.is_authenticated() {
            return Decision::NoOpinion;
        }

        match self.verify(sender, now).await {
            Ok(verdict) => {
                debug!(sender, ?verdict, "Dialback verdict");
                verdict.decision()
            }
            Err(err) => {
                error!(sender, error = %err, "Dialback store failure");
                Decision::TempFail(LOCAL_FAILURE.to_string())
            }
        }
    }

    pub async fn verify(&self, sender: &str, now: i64) -> Result<DialbackVerdict, StoreError> {
        let digest = fingerprint(&[sender]);
        self.good.purge_at(now).await?;
        self.bad.purge_at(now).await?;

        if refresh(&self.good, &digest, now).await? {
            return Ok(DialbackVerdict::CachedGood);
        }
        if refresh(&self.bad, &digest, now).await? {
            return Ok(DialbackVerdict::CachedBad);
        }

        let Some(domain) = sender_domain(sender) else {
            info!(sender, "Malformed envelope sender");
            return Ok(DialbackVerdict::InvalidSender);
        };

        let exchangers = match self.resolver.mail_exchangers(domain).await {
            Ok(exchangers) => exchangers,
            Err(err) => {
                warn!(sender, domain, error = %err, "Cannot resolve sender domain");
                return Ok(DialbackVerdict::Indeterminate(None));
            }
        };
        if exchangers.is_empty() {
            info!(sender, domain, "Sender domain has no mail exchangers, letting it through");
            return Ok(DialbackVerdict::Unresolvable);
        }

        let verdict = self.probe_all(sender, &exchangers).await;
        match &verdict {
            DialbackVerdict::Verified { host } => {
                info!(sender, host = %host, "Sender verified");
                remember(&self.good, &digest, now).await?;
            }
            DialbackVerdict::Rejected(reply) => {
                info!(sender, %reply, "Sender rejected by its own mail exchanger");
                remember(&self.bad, &digest, now).await?;
            }
            _ => {}
        }
        Ok(verdict)
    }

    async fn probe_all(&self, sender: &str, exchangers: &[MailExchanger]) -> DialbackVerdict {
        let mut last_reply = None;
        for mx in exchangers {
            match self.probe(mx, sender).await {
                Ok(ProbeOutcome::Accepted) => {
                    return DialbackVerdict::Verified {
                        host: mx.host.clone(),
                    }
                }
                Ok(ProbeOutcome::Rejected(reply)) => return DialbackVerdict::Rejected(reply),
                Ok(ProbeOutcome::Deferred(reply)) => {
                    debug!(host = %mx.host, %reply, "No verdict from exchanger");
                    last_reply = Some(reply);
                }
                Err(err) => {
                    warn!(host = %mx.host, port = mx.port, error = %err, "Dialback probe failed");
                }
            }
        }
        DialbackVerdict::Indeterminate(last_reply)
    }

    /// Asks one exchanger about `sender`. The conversation up to the `RCPT TO`
    /// reply runs under the SMTP timeout; `QUIT` is sent afterwards and its
    /// fate never changes the outcome.
    async fn probe(&self, mx: &MailExchanger, sender: &str) -> Result<ProbeOutcome, ProbeError> {
        let timeout = self.settings.smtp_timeout;
        let (client, outcome) =
            match tokio::time::timeout(timeout, self.converse(mx, sender)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ProbeError::Timeout {
                        host: mx.host.clone(),
                        timeout,
                    })
                }
            };

        match tokio::time::timeout(timeout.min(QUIT_TIMEOUT), client.quit()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => debug!(host = %mx.host, error = %err, "QUIT failed"),
            Err(_) => debug!(host = %mx.host, "No answer to QUIT"),
        }
        Ok(outcome)
    }

    async fn converse(
        &self,
        mx: &MailExchanger,
        sender: &str,
    ) -> Result<(SmtpClient, ProbeOutcome), ProbeError> {
        let (mut client, greeting) = SmtpClient::connect(&mx.host, mx.port)
            .await
            .map_err(|source| ProbeError::Connect {
                host: mx.host.clone(),
                source,
            })?;
        let protocol = |source: SmtpError| ProbeError::Protocol {
            host: mx.host.clone(),
            source,
        };

        let outcome = 'conversation: {
            if !greeting.is_positive() {
                break 'conversation ProbeOutcome::Deferred(greeting);
            }
            let reply = client.helo(&self.settings.helo_name).await.map_err(protocol)?;
            if !reply.is_positive() {
                break 'conversation ProbeOutcome::Deferred(reply);
            }
            let reply = client
                .mail_from(&self.settings.probe_from)
                .await
                .map_err(protocol)?;
            if !reply.is_positive() {
                break 'conversation ProbeOutcome::Deferred(reply);
            }

            let reply = client.rcpt_to(sender).await.map_err(protocol)?;
            match reply.class() {
                ReplyClass::Positive => ProbeOutcome::Accepted,
                ReplyClass::Permanent => ProbeOutcome::Rejected(reply),
                ReplyClass::Intermediate | ReplyClass::Transient => ProbeOutcome::Deferred(reply),
            }
        };
        Ok((client, outcome))
    }
}

/// Refreshes `key` if present and reports whether it was.
async fn refresh(store: &Store, key: &str, now: i64) -> Result<bool, StoreError> {
    let mut guard = store.lock().await?;
    if !guard.contains(key).await? {
        return Ok(false);
    }
    guard.set(key, now).await?;
    guard.unlock().await?;
    Ok(true)
}

async fn remember(store: &Store, key: &str, now: i64) -> Result<(), StoreError> {
    let mut guard = store.lock().await?;
    guard.set(key, now).await?;
    guard.unlock().await
}

#[async_trait]
impl Filter for Dialback {
    async fn check(&self, msg: &MessageContext) -> Decision {
        self.check_at(msg, unix_time()).await
    }

    async fn purge(&self) -> Result<(), StoreError> {
        self.good.purge().await?;
        self.bad.purge().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dialback"
    }
}
