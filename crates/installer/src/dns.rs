//! DNS zone discovery and propagation checks.
//!
//! The hosted zone must exist at the DNS provider before anything else is
//! created, and its delegation must actually work: a throwaway TXT record
//! is written and the installer waits until public resolvers return it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use provision_engine::{txt_record_resolves, FallbackResolver, Ledger, Poller, Step, TxtResolver};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::{handle_response, ApiError};
use crate::context::InstallContext;

/// Value written to the liveness TXT record.
pub const LIVENESS_RECORD_VALUE: &str = "domain record propagated";

/// Ledger key holding the liveness record written by an earlier attempt.
pub const LIVENESS_RECORD_KEY: &str = "dns.liveness.record";

/// Timeout for DNS provider API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// A hosted zone at the DNS provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DnsDomain {
    pub id: String,
    pub account_id: String,
    pub name: String,
}

/// Record type accepted by [`DnsProvider::create_record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    Txt,
}

/// Record to create.
#[derive(Debug, Clone, Serialize)]
pub struct DnsRecordConfig {
    #[serde(rename = "type")]
    pub record_type: DnsRecordType,
    /// Name relative to the zone.
    pub name: String,
    pub value: String,
    pub priority: u32,
    pub ttl: u32,
}

/// A record as stored by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsRecord {
    pub id: String,
    pub domain_id: String,
    pub name: String,
    pub value: String,
}

/// The subset of a DNS provider's API the installer needs.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Look up a hosted zone by its name.
    async fn find_domain(&self, name: &str) -> Result<DnsDomain, ApiError>;

    /// Create a record in the zone with id `domain_id`.
    async fn create_record(
        &self,
        domain_id: &str,
        record: &DnsRecordConfig,
    ) -> Result<DnsRecord, ApiError>;
}

/// Civo DNS API client.
#[derive(Clone)]
pub struct CivoClient {
    client: Client,
    base_url: String,
    token: String,
    region: String,
}

impl CivoClient {
    /// Create a new Civo client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        region: impl Into<String>,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            region: region.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl DnsProvider for CivoClient {
    async fn find_domain(&self, name: &str) -> Result<DnsDomain, ApiError> {
        let url = self.url("/dns");
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("region", self.region.as_str())])
            .send()
            .await?;

        let domains: Vec<DnsDomain> = handle_response(response).await?;
        domains
            .into_iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ApiError::NotFound(format!("DNS domain {name}")))
    }

    async fn create_record(
        &self,
        domain_id: &str,
        record: &DnsRecordConfig,
    ) -> Result<DnsRecord, ApiError> {
        let url = self.url(&format!("/dns/{domain_id}/records"));
        debug!(url = %url, name = %record.name, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[("region", self.region.as_str())])
            .json(record)
            .send()
            .await?;

        handle_response(response).await
    }
}

/// Unique name for a liveness record, so stale answers from earlier runs
/// cannot satisfy the check.
#[must_use]
pub fn liveness_record_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8])
}

/// Fully qualified name of this install's liveness record, creating the
/// record only if the ledger does not name one yet.
///
/// # Errors
///
/// Returns an error if the record cannot be created or recorded.
pub async fn liveness_record(
    provider: &dyn DnsProvider,
    ledger: &mut Ledger,
    domain_id: &str,
    domain_name: &str,
    record_prefix: &str,
) -> Result<String> {
    if let Some(name) = ledger.text(LIVENESS_RECORD_KEY) {
        debug!(record = %name, "Reusing liveness record");
        return Ok(format!("{name}.{domain_name}"));
    }

    let record = DnsRecordConfig {
        record_type: DnsRecordType::Txt,
        name: liveness_record_name(record_prefix),
        value: LIVENESS_RECORD_VALUE.to_string(),
        priority: 100,
        ttl: 10,
    };

    let created = provider
        .create_record(domain_id, &record)
        .await
        .with_context(|| format!("Failed to create liveness record in {domain_name}"))?;
    ledger.set_and_persist(LIVENESS_RECORD_KEY, created.name.as_str())?;

    Ok(format!("{}.{domain_name}", created.name))
}

/// Make sure a TXT record exists in the zone and wait until it resolves.
///
/// Returns `Ok(false)` if it never resolved within the poller's attempts.
///
/// # Errors
///
/// Returns an error if the record cannot be created.
pub async fn domain_liveness(
    provider: &dyn DnsProvider,
    resolver: &dyn TxtResolver,
    poller: &Poller,
    ledger: &mut Ledger,
    domain_id: &str,
    domain_name: &str,
    record_prefix: &str,
) -> Result<bool> {
    let fqdn = liveness_record(provider, ledger, domain_id, domain_name, record_prefix).await?;
    info!(record = %fqdn, "Waiting for liveness record to propagate");

    Ok(poller
        .is_ready(&fqdn, || txt_record_resolves(resolver, &fqdn))
        .await)
}

fn civo_client(ctx: &InstallContext) -> Result<CivoClient> {
    CivoClient::new(
        &ctx.config.civo_api_url,
        &ctx.config.civo_token,
        &ctx.config.region,
    )
    .context("Failed to create Civo client")
}

/// Resolve the hosted zone and record its identifiers.
pub struct DnsZoneStep {
    ctx: Arc<InstallContext>,
}

impl DnsZoneStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for DnsZoneStep {
    fn name(&self) -> &str {
        "Look up DNS zone"
    }

    fn checkpoint(&self) -> &str {
        "create.dns.zone"
    }

    fn describe(&self) -> String {
        format!("look up hosted zone {} at Civo", self.ctx.config.domain_name)
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let provider = civo_client(&self.ctx)?;
        let domain = provider
            .find_domain(&self.ctx.config.domain_name)
            .await
            .with_context(|| format!("Hosted zone {} not found", self.ctx.config.domain_name))?;

        info!(domain = %domain.name, id = %domain.id, "Found hosted zone");
        ledger.set_and_persist("dns.domain.id", domain.id)?;
        ledger.set_and_persist("dns.account.id", domain.account_id)?;
        Ok(())
    }
}

/// Prove the zone's delegation works before building on it.
pub struct DnsLivenessStep {
    ctx: Arc<InstallContext>,
}

impl DnsLivenessStep {
    pub fn new(ctx: Arc<InstallContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for DnsLivenessStep {
    fn name(&self) -> &str {
        "Check DNS liveness"
    }

    fn checkpoint(&self) -> &str {
        "create.dns.liveness"
    }

    fn requires(&self) -> Vec<String> {
        vec!["dns.domain.id".into()]
    }

    fn describe(&self) -> String {
        format!(
            "write a {}-* TXT record in {} and wait for it to resolve",
            self.ctx.config.liveness_record_prefix, self.ctx.config.domain_name
        )
    }

    async fn run(&self, ledger: &mut Ledger) -> Result<()> {
        let domain_id = ledger.require("dns.domain.id")?.to_string();
        let provider = civo_client(&self.ctx)?;
        let resolver = FallbackResolver::from_system();
        let poller = self.ctx.poller(Poller::dns());

        let live = domain_liveness(
            &provider,
            &resolver,
            &poller,
            ledger,
            &domain_id,
            &self.ctx.config.domain_name,
            &self.ctx.config.liveness_record_prefix,
        )
        .await?;

        if !live {
            anyhow::bail!(
                "unable to resolve a TXT record in {}; check that your registrar's NS records point at the DNS provider",
                self.ctx.config.domain_name
            );
        }
        Ok(())
    }
}
