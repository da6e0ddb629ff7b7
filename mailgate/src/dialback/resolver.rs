//! Mail exchanger resolution for dialback probes.

use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::lookup::MxLookup;
use hickory_resolver::system_conf::read_system_conf;
use hickory_resolver::TokioAsyncResolver;
use miette::Diagnostic;
use moka::{future::Cache, Expiry};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use crate::config::CfgDialback;

#[derive(Debug, Error, Diagnostic)]
pub enum ResolverError {
    #[error("Failed to read system DNS configuration: {0}")]
    #[diagnostic(code(mailgate::dns::config))]
    Config(#[source] ResolveError),

    #[error("DNS lookup for {domain} failed: {source}")]
    #[diagnostic(code(mailgate::dns::lookup))]
    Lookup {
        domain: String,
        #[source]
        source: ResolveError,
    },
}

/// One host to probe, in the order it should be tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchanger {
    pub host: String,
    pub port: u16,
}

#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Hosts accepting mail for `domain`, most preferred first. An empty list
    /// means the domain has neither MX nor address records.
    async fn mail_exchangers(&self, domain: &str) -> Result<Vec<MailExchanger>, ResolverError>;
}

pub struct MXExpiry;

impl Expiry<String, MxLookup> for MXExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MxLookup,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(time_to_live(value.valid_until(), Instant::now()))
    }
}

/// How long a lookup valid until `valid_until` may stay cached. Lookups that
/// are already stale expire at once rather than never.
fn time_to_live(valid_until: Instant, now: Instant) -> Duration {
    valid_until.saturating_duration_since(now)
}

/// Resolver backed by the system's DNS configuration.
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    mx_cache: Cache<String, MxLookup>,
    port: u16,
}

impl DnsResolver {
    pub fn new(cfg: &CfgDialback) -> Result<Self, ResolverError> {
        let (config, mut opts) = read_system_conf().map_err(ResolverError::Config)?;
        opts.timeout = Duration::from_secs(cfg.dns_timeout);
        let resolver = TokioAsyncResolver::tokio(config, opts);

        let mx_cache: Cache<_, _> = Cache::builder()
            .max_capacity(10000)
            .expire_after(MXExpiry)
            .build();

        Ok(DnsResolver {
            resolver,
            mx_cache,
            port: cfg.smtp_port,
        })
    }

    async fn mx_lookup(&self, domain: &str) -> Result<Option<MxLookup>, ResolveError> {
        if let Some(lookup) = self.mx_cache.get(domain).await {
            return Ok(Some(lookup));
        }
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                self.mx_cache.insert(domain.to_string(), lookup.clone()).await;
                Ok(Some(lookup))
            }
            Err(err) if is_no_records(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn has_address(&self, domain: &str) -> Result<bool, ResolveError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => Ok(lookup.iter().next().is_some()),
            Err(err) if is_no_records(&err) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn mail_exchangers(&self, domain: &str) -> Result<Vec<MailExchanger>, ResolverError> {
        let domain = domain.trim_end_matches('.').to_lowercase();
        let lookup_error = |source: ResolveError| ResolverError::Lookup {
            domain: domain.clone(),
            source,
        };

        if let Some(mx) = self.mx_lookup(&domain).await.map_err(lookup_error)? {
            let records = mx
                .iter()
                .map(|record| (record.preference(), record.exchange().to_utf8()));
            let exchangers = order_exchangers(records, self.port);
            debug!(domain = %domain, count = exchangers.len(), "Resolved MX records");
            return Ok(exchangers);
        }

        // No MX: the domain itself is the implicit exchanger.
        if self.has_address(&domain).await.map_err(lookup_error)? {
            debug!(domain = %domain, "No MX records, using the domain's own address");
            return Ok(vec![MailExchanger {
                host: domain.clone(),
                port: self.port,
            }]);
        }
        Ok(Vec::new())
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

/// Sorts `(preference, exchange)` pairs, dropping null MX (`.`) entries and
/// the trailing dot of each name. The sort is stable, so equal preferences
/// keep their DNS order.
pub fn order_exchangers(
    records: impl IntoIterator<Item = (u16, String)>,
    port: u16,
) -> Vec<MailExchanger> {
    let mut records: Vec<(u16, String)> = records
        .into_iter()
        .map(|(preference, exchange)| (preference, exchange.trim_end_matches('.').to_lowercase()))
        .filter(|(_, exchange)| !exchange.is_empty())
        .collect();
    records.sort_by_key(|(preference, _)| *preference);
    records
        .into_iter()
        .map(|(_, host)| MailExchanger { host, port })
        .collect()
}
