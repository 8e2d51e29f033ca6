//! Domain resolution, connected-address discovery and the expiry
//! notification sweep, plus the configuration that wires them together.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use keepens_adapters::{
    ChainReader, DomainIndexer, ExpiryNotice, GraphIndexer, IdentityLookup, IdentityProfile,
    IndexerEndpoints, JsonRpcCaller, LogMailer, Mailer, NeynarIdentityClient, RegistryChainReader,
    RegistryContracts, ResendMailer, NEYNAR_API_BASE, RESEND_EMAILS_URL,
};
use keepens_core::{
    addresses_equal, days_left, label_to_identifier, normalize_address, synthesized_domain_id,
    DomainRecord, ExpiringSubscription, Namespace, ResolvedDomain, Urgency, SECONDS_PER_DAY,
};
use keepens_storage::{
    HttpClientConfig, JsonHttpClient, MemorySubscriptionStore, PgSubscriptionStore, StoreError,
    SubscriptionStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinError;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "keepens-engine";

pub const RESEND_KEY_PLACEHOLDER: &str = "your_resend_api_key_here";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub indexer_url: String,
    pub rpc_url: String,
}

/// Per-namespace endpoints and registry contract addresses, loaded from
/// `networks.yaml` or the built-in mainnet defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRegistry {
    pub primary: NetworkEndpoint,
    pub l2: NetworkEndpoint,
    pub contracts: RegistryContracts,
}

impl Default for NetworkRegistry {
    fn default() -> Self {
        Self {
            primary: NetworkEndpoint {
                indexer_url: "https://api.thegraph.com/subgraphs/name/ensdomains/ens".to_string(),
                rpc_url: "https://eth.llamarpc.com".to_string(),
            },
            l2: NetworkEndpoint {
                indexer_url: "https://api.alpha.ensnode.io/subgraph".to_string(),
                rpc_url: "https://mainnet.base.org".to_string(),
            },
            contracts: RegistryContracts {
                base_registrar: "0x57f1887a8BF19b14fC0dF6Fd9B2acc9Af147eA85".to_string(),
                name_wrapper: "0xD4416b13d2b3a9aBae7AcD5D6C2BbDBE25686401".to_string(),
                l2_registrar: "0x03c4738Ee98aE44591e1A4A4F3CaB6641d95DD9a".to_string(),
            },
        }
    }
}

impl NetworkRegistry {
    pub fn indexer_endpoints(&self) -> IndexerEndpoints {
        IndexerEndpoints {
            primary: self.primary.indexer_url.clone(),
            l2: self.l2.indexer_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub eth_rpc_url: Option<String>,
    pub base_rpc_url: Option<String>,
    pub ens_subgraph_url: Option<String>,
    pub ensnode_subgraph_url: Option<String>,
    pub neynar_api_key: Option<String>,
    pub resend_api_key: Option<String>,
    pub resend_from: String,
    pub cron_secret: Option<String>,
    pub scheduler_enabled: bool,
    pub notify_cron: String,
    pub notify_days: i64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
    pub networks_file: Option<PathBuf>,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_opt("DATABASE_URL"),
            eth_rpc_url: env_opt("ETH_RPC_URL"),
            base_rpc_url: env_opt("BASE_RPC_URL"),
            ens_subgraph_url: env_opt("ENS_SUBGRAPH_URL"),
            ensnode_subgraph_url: env_opt("ENSNODE_SUBGRAPH_URL"),
            neynar_api_key: env_opt("NEYNAR_API_KEY"),
            resend_api_key: env_opt("RESEND_API_KEY"),
            resend_from: env_opt("RESEND_FROM")
                .unwrap_or_else(|| "KeepENS <onboarding@resend.dev>".to_string()),
            cron_secret: env_opt("CRON_SECRET"),
            scheduler_enabled: std::env::var("KEEPENS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            notify_cron: env_opt("KEEPENS_NOTIFY_CRON")
                .unwrap_or_else(|| "0 0 9 * * *".to_string()),
            notify_days: env_opt("KEEPENS_NOTIFY_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            http_timeout_secs: env_opt("KEEPENS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: env_opt("KEEPENS_USER_AGENT").unwrap_or_else(|| "keepens/0.1".to_string()),
            web_port: env_opt("KEEPENS_WEB_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            networks_file: env_opt("KEEPENS_NETWORKS_FILE").map(PathBuf::from),
        }
    }

    /// Registry from `networks_file` (or built-ins), with URL overrides from
    /// the environment applied on top.
    pub async fn network_registry(&self) -> Result<NetworkRegistry> {
        let mut registry = match &self.networks_file {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => NetworkRegistry::default(),
        };
        if let Some(url) = &self.eth_rpc_url {
            registry.primary.rpc_url = url.clone();
        }
        if let Some(url) = &self.base_rpc_url {
            registry.l2.rpc_url = url.clone();
        }
        if let Some(url) = &self.ens_subgraph_url {
            registry.primary.indexer_url = url.clone();
        }
        if let Some(url) = &self.ensnode_subgraph_url {
            registry.l2.indexer_url = url.clone();
        }
        Ok(registry)
    }

    /// Resend key if it is set to something other than the sample placeholder.
    pub fn usable_resend_key(&self) -> Option<&str> {
        self.resend_api_key
            .as_deref()
            .filter(|key| *key != RESEND_KEY_PLACEHOLDER)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("indexer task for {namespace} namespace failed: {source}")]
    IndexerTask {
        namespace: Namespace,
        #[source]
        source: JoinError,
    },
}

/// Combines indexer discovery across namespaces with authoritative on-chain
/// expiry reads.
#[derive(Clone)]
pub struct DomainResolver {
    indexer: Arc<dyn DomainIndexer>,
    chain: Arc<dyn ChainReader>,
    wrapper_address: String,
}

impl DomainResolver {
    pub fn new(
        indexer: Arc<dyn DomainIndexer>,
        chain: Arc<dyn ChainReader>,
        wrapper_address: impl Into<String>,
    ) -> Self {
        Self {
            indexer,
            chain,
            wrapper_address: wrapper_address.into(),
        }
    }

    pub async fn resolve(&self, owner_address: &str) -> Result<Vec<ResolvedDomain>, ResolveError> {
        self.resolve_at(owner_address, Utc::now().timestamp()).await
    }

    pub async fn resolve_at(
        &self,
        owner_address: &str,
        now_secs: i64,
    ) -> Result<Vec<ResolvedDomain>, ResolveError> {
        let owner = normalize_address(owner_address);

        let tasks = Namespace::ALL.map(|namespace| {
            let indexer = self.indexer.clone();
            let owner = owner.clone();
            (
                namespace,
                tokio::spawn(async move { indexer.fetch_owned_domains(&owner, namespace).await }),
            )
        });

        // Join every task before surfacing a failure so none outlives this call.
        let mut joined = Vec::with_capacity(tasks.len());
        for (namespace, task) in tasks {
            joined.push((namespace, task.await));
        }

        let mut discovered = Vec::new();
        for (namespace, outcome) in joined {
            let records =
                outcome.map_err(|source| ResolveError::IndexerTask { namespace, source })?;
            discovered.extend(records.into_iter().map(|mut record| {
                record.namespace = namespace;
                record
            }));
        }

        let resolvable: Vec<DomainRecord> = discovered
            .into_iter()
            .filter(|record| record.hashable_label().is_some())
            .collect();

        let resolved = join_all(
            resolvable
                .iter()
                .map(|record| self.resolve_record(record, now_secs)),
        )
        .await;

        let mut output: Vec<ResolvedDomain> = Vec::with_capacity(resolved.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for domain in resolved.into_iter().flatten() {
            match positions.get(&domain.id) {
                Some(&index) => {
                    warn!(
                        id = %domain.id,
                        previous = %output[index].name,
                        replacement = %domain.name,
                        "duplicate domain id, keeping the later record"
                    );
                    output[index] = domain;
                }
                None => {
                    positions.insert(domain.id.clone(), output.len());
                    output.push(domain);
                }
            }
        }

        output.sort_by_key(|domain| domain.expiry_timestamp);
        debug!(owner = %owner, count = output.len(), "resolution complete");
        Ok(output)
    }

    async fn resolve_record(&self, record: &DomainRecord, now_secs: i64) -> Option<ResolvedDomain> {
        let label = record.hashable_label()?;
        let is_wrapped = record.namespace == Namespace::Primary
            && addresses_equal(&record.owner_address, &self.wrapper_address);
        let identifier = label_to_identifier(label);

        let expiry_timestamp = match self
            .chain
            .authoritative_expiry(&identifier, record.namespace, is_wrapped)
            .await
        {
            Ok(expiry) => expiry,
            Err(err) => {
                let fallback = record.raw_expiry.unwrap_or(0);
                let fallback_source = if record.raw_expiry.is_some() {
                    "indexer"
                } else {
                    "unknown"
                };
                warn!(
                    name = %record.full_name,
                    namespace = %record.namespace,
                    is_wrapped,
                    error = %err,
                    fallback,
                    fallback_source,
                    "chain read failed, using fallback expiry"
                );
                fallback
            }
        };

        let days = days_left(expiry_timestamp, now_secs);
        let urgency = Urgency::from_days_left(days);
        debug!(
            name = %record.full_name,
            expiry_timestamp,
            days_left = days,
            urgency = urgency.as_str(),
            "domain resolved"
        );
        Some(ResolvedDomain {
            id: record
                .external_id
                .clone()
                .unwrap_or_else(|| synthesized_domain_id(label, record.namespace)),
            name: record.full_name.clone(),
            label: label.to_string(),
            expiry_timestamp,
            owner_address: normalize_address(&record.owner_address),
            days_left: days,
            urgency,
            is_wrapped,
            namespace: record.namespace,
        })
    }
}

/// One way of reading wallet addresses out of an identity profile.
pub trait AddressStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn addresses(&self, profile: &IdentityProfile) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifiedAddresses;

impl AddressStrategy for VerifiedAddresses {
    fn name(&self) -> &'static str {
        "verified"
    }

    fn addresses(&self, profile: &IdentityProfile) -> Vec<String> {
        profile.verified_eth_addresses.clone()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CustodyAddress;

impl AddressStrategy for CustodyAddress {
    fn name(&self) -> &'static str {
        "custody"
    }

    fn addresses(&self, profile: &IdentityProfile) -> Vec<String> {
        profile.custody_address.iter().cloned().collect()
    }
}

fn dedup_lowercase(addresses: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .map(|a| normalize_address(&a))
        .filter(|a| !a.is_empty() && seen.insert(a.clone()))
        .collect()
}

/// Best-effort mapping from a social identity to wallet addresses. Never
/// fails outward; every problem yields an empty list.
pub struct ConnectedAddressResolver {
    lookup: Arc<dyn IdentityLookup>,
    strategies: Vec<Box<dyn AddressStrategy>>,
}

impl ConnectedAddressResolver {
    pub fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        Self {
            lookup,
            strategies: vec![Box::new(VerifiedAddresses), Box::new(CustodyAddress)],
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn AddressStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub async fn resolve_addresses_for_identity(&self, social_id: &str) -> Vec<String> {
        let Ok(fid) = social_id.trim().parse::<u64>() else {
            debug!(social_id, "social id is not numeric");
            return Vec::new();
        };

        let profile = match self.lookup.lookup(fid).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!(fid, "identity not found");
                return Vec::new();
            }
            Err(err) => {
                warn!(fid, error = %err, "identity lookup failed");
                return Vec::new();
            }
        };

        for strategy in &self.strategies {
            let addresses = dedup_lowercase(strategy.addresses(&profile));
            if !addresses.is_empty() {
                info!(
                    fid,
                    strategy = strategy.name(),
                    count = addresses.len(),
                    "connected addresses resolved"
                );
                return addresses;
            }
        }
        debug!(fid, "no strategy produced addresses");
        Vec::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOutcome {
    pub domains_count: usize,
    pub error: Option<String>,
}

pub const PREVIEW_DOMAIN_LIMIT: usize = 3;

pub fn format_notice_date(at: DateTime<Utc>) -> String {
    at.format("%B %-d, %Y").to_string()
}

pub fn notice_for(record: &ExpiringSubscription, now: DateTime<Utc>) -> ExpiryNotice {
    let expiry = record.subscription.expiry_date;
    let expiry_secs = u64::try_from(expiry.timestamp()).unwrap_or(0);
    ExpiryNotice {
        name: record.subscription.ens_name.clone(),
        expiry_date: format_notice_date(expiry),
        days_left: days_left(expiry_secs, now.timestamp()),
    }
}

/// Fixed notice used to check mail delivery end to end.
pub fn sample_notice(now: DateTime<Utc>) -> ExpiryNotice {
    let expiry = now + chrono::Duration::days(7);
    ExpiryNotice {
        name: "test.eth".to_string(),
        expiry_date: format_notice_date(expiry),
        days_left: 7,
    }
}

pub struct ExpiryNotifier {
    store: Arc<dyn SubscriptionStore>,
    mailer: Arc<dyn Mailer>,
    days_threshold: i64,
}

impl ExpiryNotifier {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        mailer: Arc<dyn Mailer>,
        days_threshold: i64,
    ) -> Self {
        Self {
            store,
            mailer,
            days_threshold,
        }
    }

    pub fn mailer(&self) -> &Arc<dyn Mailer> {
        &self.mailer
    }

    fn threshold(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
        now + chrono::Duration::seconds(days.saturating_mul(SECONDS_PER_DAY))
    }

    async fn mark_all_notified(
        &self,
        records: &[&ExpiringSubscription],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for record in records {
            self.store.mark_notified(record.subscription.id, now).await?;
        }
        Ok(())
    }

    /// Email every owner with not-yet-notified subscriptions inside the
    /// threshold, then mark those subscriptions notified.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<NotificationSummary, StoreError> {
        let expiring = self
            .store
            .expiring_subscriptions(Self::threshold(now, self.days_threshold))
            .await?;

        let mut summary = NotificationSummary::default();
        let mut by_email: BTreeMap<String, Vec<&ExpiringSubscription>> = BTreeMap::new();
        for record in &expiring {
            match record.user.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
                Some(email) => by_email.entry(email.to_string()).or_default().push(record),
                None => {
                    warn!(
                        subscription = %record.subscription.id,
                        "no email for subscription owner, skipping"
                    );
                    summary.skipped += 1;
                }
            }
        }

        for (email, records) in by_email {
            let notices: Vec<ExpiryNotice> = records.iter().map(|r| notice_for(r, now)).collect();
            let user_name = notices
                .first()
                .and_then(|n| n.name.split('.').next())
                .map(ToString::to_string);

            match self
                .mailer
                .send_expiry_notice(&email, &notices, user_name.as_deref())
                .await
            {
                Ok(()) => match self.mark_all_notified(&records, now).await {
                    Ok(()) => summary.sent += 1,
                    Err(err) => {
                        warn!(email = %email, error = %err, "expiry notice sent but not recorded");
                        summary.failed += 1;
                        summary
                            .errors
                            .push(format!("Sent to {email} but failed to mark notified: {err}"));
                    }
                },
                Err(err) => {
                    warn!(email = %email, error = %err, "expiry notice failed");
                    summary.failed += 1;
                    summary.errors.push(format!("Failed to send to {email}: {err}"));
                }
            }
        }

        info!(
            candidates = expiring.len(),
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "expiry notification sweep complete"
        );
        Ok(summary)
    }

    /// Send up to three expiring subscriptions to `to` without marking
    /// anything notified.
    pub async fn send_preview(
        &self,
        to: &str,
        days_threshold: i64,
        now: DateTime<Utc>,
    ) -> Result<PreviewOutcome, StoreError> {
        let expiring = self
            .store
            .expiring_subscriptions(Self::threshold(now, days_threshold))
            .await?;
        let notices: Vec<ExpiryNotice> = expiring
            .iter()
            .take(PREVIEW_DOMAIN_LIMIT)
            .map(|r| notice_for(r, now))
            .collect();
        if notices.is_empty() {
            return Ok(PreviewOutcome {
                domains_count: 0,
                error: None,
            });
        }

        let error = self
            .mailer
            .send_expiry_notice(to, &notices, Some("Test User"))
            .await
            .err()
            .map(|err| err.to_string());
        Ok(PreviewOutcome {
            domains_count: notices.len(),
            error,
        })
    }
}

pub async fn maybe_build_scheduler(
    config: &AppConfig,
    notifier: Arc<ExpiryNotifier>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.notify_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let notifier = notifier.clone();
        Box::pin(async move {
            if let Err(err) = notifier.run_once(Utc::now()).await {
                warn!(error = %err, "scheduled expiry sweep failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Everything the API and CLI need, constructed once at startup.
#[derive(Clone)]
pub struct Services {
    pub config: AppConfig,
    pub resolver: Arc<DomainResolver>,
    pub connected: Arc<ConnectedAddressResolver>,
    pub notifier: Arc<ExpiryNotifier>,
    pub store: Arc<dyn SubscriptionStore>,
}

impl Services {
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let registry = config.network_registry().await?;
        let http = Arc::new(JsonHttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let indexer = Arc::new(GraphIndexer::new(http.clone(), registry.indexer_endpoints()));
        let chain = Arc::new(RegistryChainReader::new(
            Arc::new(JsonRpcCaller::new(
                http.clone(),
                registry.primary.rpc_url.clone(),
                "rpc:primary",
            )),
            Arc::new(JsonRpcCaller::new(http.clone(), registry.l2.rpc_url.clone(), "rpc:l2")),
            registry.contracts.clone(),
        ));
        let resolver = Arc::new(DomainResolver::new(
            indexer,
            chain,
            registry.contracts.name_wrapper.clone(),
        ));

        let identity = Arc::new(NeynarIdentityClient::new(
            http.clone(),
            NEYNAR_API_BASE,
            config.neynar_api_key.clone(),
        ));
        let connected = Arc::new(ConnectedAddressResolver::new(identity));

        let store: Arc<dyn SubscriptionStore> = match &config.database_url {
            Some(url) => Arc::new(
                PgSubscriptionStore::connect(url)
                    .await
                    .context("connecting to subscription database")?,
            ),
            None => {
                warn!("DATABASE_URL not set, subscriptions are kept in memory");
                Arc::new(MemorySubscriptionStore::new())
            }
        };

        let mailer: Arc<dyn Mailer> = match config.usable_resend_key() {
            Some(key) => Arc::new(ResendMailer::new(
                http,
                RESEND_EMAILS_URL,
                key,
                config.resend_from.clone(),
            )),
            None => {
                warn!("RESEND_API_KEY not configured, expiry notices will only be logged");
                Arc::new(LogMailer)
            }
        };
        let notifier = Arc::new(ExpiryNotifier::new(store.clone(), mailer, config.notify_days));

        Ok(Self {
            config,
            resolver,
            connected,
            notifier,
            store,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(AppConfig::from_env()).await
    }
}
