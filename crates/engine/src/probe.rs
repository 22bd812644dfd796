//! Readiness probes used with [`crate::Poller`].
//!
//! A probe answers one question once: `Ok(true)` when the resource is
//! usable, `Ok(false)` when it is not yet, `Err` when the check itself
//! failed. The poller treats the last two the same way.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

/// Public recursive resolver used when the system resolver cannot answer.
pub const FALLBACK_NAMESERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));

/// Per-query timeout for TXT lookups.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// GET `url` and report ready only on `200 OK`.
///
/// # Errors
///
/// Returns an error on transport failures (connection refused, TLS, timeout).
pub async fn http_ready(client: &Client, url: &str) -> Result<bool> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;

    let status = response.status();
    debug!(url = %url, status = status.as_u16(), "Readiness probe response");
    Ok(status == StatusCode::OK)
}

/// TXT record lookup.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Resolve `name` and return every TXT string found.
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>>;
}

/// Ready when any TXT value resolves for `name`.
///
/// The resolved value is not compared to the value that was written; any
/// answer counts as propagated.
///
/// # Errors
///
/// Returns the resolver error when no resolver could answer.
pub async fn txt_record_resolves(resolver: &dyn TxtResolver, name: &str) -> Result<bool> {
    let values = resolver.lookup_txt(name).await?;
    for value in &values {
        info!(name = %name, value = %value, "TXT record resolved");
    }
    Ok(!values.is_empty())
}

/// System resolver with a public fallback.
///
/// Some hosts cannot resolve TXT records through their configured resolver,
/// so a failed system lookup is retried against [`FALLBACK_NAMESERVER`]
/// before the attempt counts as failed. Caching is disabled on both so each
/// poll attempt sees fresh answers rather than a cached NXDOMAIN.
pub struct FallbackResolver {
    primary: Option<TokioAsyncResolver>,
    fallback: TokioAsyncResolver,
}

impl FallbackResolver {
    /// Build from the host's resolver configuration.
    ///
    /// If the system configuration cannot be read only the fallback is used.
    #[must_use]
    pub fn from_system() -> Self {
        let primary = match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, mut opts)) => {
                opts.cache_size = 0;
                opts.timeout = DNS_QUERY_TIMEOUT;
                Some(TokioAsyncResolver::tokio(config, opts))
            }
            Err(e) => {
                debug!(error = %e, "System resolver configuration unavailable");
                None
            }
        };

        Self {
            primary,
            fallback: public_resolver(FALLBACK_NAMESERVER),
        }
    }
}

fn public_resolver(ip: IpAddr) -> TokioAsyncResolver {
    let servers = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
    let config = ResolverConfig::from_parts(None, vec![], servers);
    let mut opts = ResolverOpts::default();
    opts.timeout = DNS_QUERY_TIMEOUT;
    opts.cache_size = 0;
    TokioAsyncResolver::tokio(config, opts)
}

async fn lookup_with(resolver: &TokioAsyncResolver, name: &str) -> Result<Vec<String>> {
    let lookup = resolver
        .txt_lookup(name)
        .await
        .with_context(|| format!("TXT lookup for {name}"))?;

    Ok(lookup
        .iter()
        .map(|txt| {
            txt.txt_data()
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<String>()
        })
        .collect())
}

#[async_trait]
impl TxtResolver for FallbackResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>> {
        if let Some(primary) = &self.primary {
            match lookup_with(primary, name).await {
                Ok(values) => return Ok(values),
                Err(e) => debug!(name = %name, error = %e, "System resolver failed, trying fallback"),
            }
        }
        lookup_with(&self.fallback, name).await
    }
}
