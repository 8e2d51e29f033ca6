//! Adapters for the external services KeepENS depends on: the domain
//! indexers, registry contracts on each chain, the social identity API and
//! outbound mail.

use std::sync::Arc;

use async_trait::async_trait;
use keepens_core::{keccak256, normalize_address, DomainRecord, LabelHash, Namespace};
use keepens_storage::{FetchError, JsonHttpClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "keepens-adapters";

pub const NAME_EXPIRES_SIGNATURE: &str = "nameExpires(uint256)";
pub const GET_DATA_SIGNATURE: &str = "getData(uint256)";

const WORD_BYTES: usize = 32;

pub const OWNED_DOMAINS_QUERY: &str = r#"
query OwnedDomains($owner: String!) {
  domains(where: { owner: $owner }) {
    id
    name
    labelName
    expiryDate
    owner {
      id
    }
  }
}
"#;

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_non_empty_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return Vec::new(),
        }
    }
    cur.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Indexers report timestamps either as decimal strings or as numbers.
fn json_timestamp(value: Option<&JsonValue>) -> Option<u64> {
    match value? {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Short preview of a credential for log lines.
pub fn redact_secret(secret: &str) -> String {
    if secret.len() > 8 && secret.is_ascii() {
        format!("{}...{}", &secret[..4], &secret[secret.len() - 4..])
    } else {
        "***".to_string()
    }
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("indexer transport failed: {0}")]
    Transport(#[from] FetchError),
    #[error("indexer returned errors: {0}")]
    GraphQl(String),
    #[error("unrecognized indexer response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait DomainIndexer: Send + Sync {
    /// Raw query; `owner` is already lowercased by the caller.
    async fn query_owned_domains(
        &self,
        owner: &str,
        namespace: Namespace,
    ) -> Result<Vec<DomainRecord>, IndexerError>;

    /// Domains owned by `owner` in `namespace`. A failed query degrades to an
    /// empty list so one namespace never blocks the other.
    async fn fetch_owned_domains(&self, owner: &str, namespace: Namespace) -> Vec<DomainRecord> {
        let owner = normalize_address(owner);
        match self.query_owned_domains(&owner, namespace).await {
            Ok(records) => {
                debug!(%namespace, owner = %owner, count = records.len(), "indexer query complete");
                records
            }
            Err(err) => {
                warn!(
                    %namespace,
                    owner = %owner,
                    error = %err,
                    "indexer query failed, treating as no domains"
                );
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerEndpoints {
    pub primary: String,
    pub l2: String,
}

impl IndexerEndpoints {
    pub fn for_namespace(&self, namespace: Namespace) -> &str {
        match namespace {
            Namespace::Primary => &self.primary,
            Namespace::L2 => &self.l2,
        }
    }
}

/// GraphQL subgraph client; one endpoint per namespace.
#[derive(Debug, Clone)]
pub struct GraphIndexer {
    http: Arc<JsonHttpClient>,
    endpoints: IndexerEndpoints,
}

impl GraphIndexer {
    pub fn new(http: Arc<JsonHttpClient>, endpoints: IndexerEndpoints) -> Self {
        Self { http, endpoints }
    }
}

#[async_trait]
impl DomainIndexer for GraphIndexer {
    async fn query_owned_domains(
        &self,
        owner: &str,
        namespace: Namespace,
    ) -> Result<Vec<DomainRecord>, IndexerError> {
        let body = json!({
            "query": OWNED_DOMAINS_QUERY,
            "variables": { "owner": owner },
        });
        let target = format!("indexer:{namespace}");
        let response = self
            .http
            .post_json(&target, self.endpoints.for_namespace(namespace), &body, &[])
            .await?;
        parse_graph_domains(&response, namespace)
    }
}

/// Validate a subgraph `domains` response into records for `namespace`.
/// Entries without a name or owner are dropped; a missing label is kept as
/// `None` for the engine to discard.
pub fn parse_graph_domains(
    response: &JsonValue,
    namespace: Namespace,
) -> Result<Vec<DomainRecord>, IndexerError> {
    if let Some(errors) = response.get("errors").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let message = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(IndexerError::GraphQl(if message.is_empty() {
                "unspecified error".to_string()
            } else {
                message
            }));
        }
    }

    let domains = response
        .get("data")
        .and_then(|d| d.get("domains"))
        .and_then(|d| d.as_array())
        .ok_or_else(|| IndexerError::Malformed("missing data.domains array".to_string()))?;

    Ok(domains
        .iter()
        .filter_map(|domain| {
            let full_name = json_non_empty_str(domain, &["name"])?;
            let owner_address = json_non_empty_str(domain, &["owner", "id"])?;
            if !namespace.matches_name(&full_name) {
                return None;
            }
            Some(DomainRecord {
                external_id: json_non_empty_str(domain, &["id"]),
                label: json_non_empty_str(domain, &["labelName"]),
                raw_expiry: json_timestamp(domain.get("expiryDate")),
                full_name,
                owner_address,
                namespace,
            })
        })
        .collect())
}

#[derive(Debug, Error)]
pub enum ChainReadError {
    #[error("rpc transport failed: {0}")]
    Transport(#[from] FetchError),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed contract response: {0}")]
    Malformed(String),
    #[error("return word {word_index} does not fit in 64 bits")]
    Overflow { word_index: usize },
}

pub fn function_selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Calldata for a single-`uint256`-argument function.
pub fn encode_uint256_call(selector: [u8; 4], argument: &LabelHash) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD_BYTES);
    data.extend_from_slice(&selector);
    data.extend_from_slice(argument.as_bytes());
    data
}

/// Read the `word_index`-th 32-byte return word as a `u64`.
pub fn decode_u64_word(output: &[u8], word_index: usize) -> Result<u64, ChainReadError> {
    let start = word_index * WORD_BYTES;
    let word = output.get(start..start + WORD_BYTES).ok_or_else(|| {
        ChainReadError::Malformed(format!(
            "expected at least {} bytes, got {}",
            start + WORD_BYTES,
            output.len()
        ))
    })?;
    let (high, low) = word.split_at(WORD_BYTES - 8);
    if high.iter().any(|b| *b != 0) {
        return Err(ChainReadError::Overflow { word_index });
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(low);
    Ok(u64::from_be_bytes(buf))
}

/// Read-only contract call against one network.
#[async_trait]
pub trait ContractCall: Send + Sync {
    async fn call(&self, contract: &str, calldata: &[u8]) -> Result<Vec<u8>, ChainReadError>;
}

/// `eth_call` at the latest block over JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcCaller {
    http: Arc<JsonHttpClient>,
    rpc_url: String,
    target: String,
}

impl JsonRpcCaller {
    pub fn new(
        http: Arc<JsonHttpClient>,
        rpc_url: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            http,
            rpc_url: rpc_url.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl ContractCall for JsonRpcCaller {
    async fn call(&self, contract: &str, calldata: &[u8]) -> Result<Vec<u8>, ChainReadError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [
                { "to": contract, "data": format!("0x{}", hex::encode(calldata)) },
                "latest"
            ],
        });
        let response = self.http.post_json(&self.target, &self.rpc_url, &body, &[]).await?;
        decode_rpc_result(&response)
    }
}

pub fn decode_rpc_result(response: &JsonValue) -> Result<Vec<u8>, ChainReadError> {
    if let Some(error) = response.get("error") {
        return Err(ChainReadError::Rpc {
            code: error.get("code").and_then(|c| c.as_i64()).unwrap_or_default(),
            message: json_str(error, &["message"]).unwrap_or("unknown").to_string(),
        });
    }
    let result = json_str(response, &["result"])
        .ok_or_else(|| ChainReadError::Malformed("missing result".to_string()))?;
    let digits = result.strip_prefix("0x").unwrap_or(result);
    hex::decode(digits).map_err(|e| ChainReadError::Malformed(format!("result is not hex: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryContracts {
    pub base_registrar: String,
    pub name_wrapper: String,
    pub l2_registrar: String,
}

/// Which contract accessor holds the expiry for a given domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReadPath {
    L2Registrar,
    BaseRegistrar,
    NameWrapper,
}

impl ExpiryReadPath {
    pub fn select(namespace: Namespace, is_wrapped: bool) -> Self {
        match (namespace, is_wrapped) {
            (Namespace::L2, _) => ExpiryReadPath::L2Registrar,
            (Namespace::Primary, false) => ExpiryReadPath::BaseRegistrar,
            (Namespace::Primary, true) => ExpiryReadPath::NameWrapper,
        }
    }
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Expiry in seconds since epoch. Errors are returned, never swallowed,
    /// so the caller can apply its own fallback.
    async fn authoritative_expiry(
        &self,
        identifier: &LabelHash,
        namespace: Namespace,
        is_wrapped: bool,
    ) -> Result<u64, ChainReadError>;
}

pub struct RegistryChainReader {
    primary: Arc<dyn ContractCall>,
    l2: Arc<dyn ContractCall>,
    contracts: RegistryContracts,
}

impl RegistryChainReader {
    pub fn new(
        primary: Arc<dyn ContractCall>,
        l2: Arc<dyn ContractCall>,
        contracts: RegistryContracts,
    ) -> Self {
        Self {
            primary,
            l2,
            contracts,
        }
    }
}

#[async_trait]
impl ChainReader for RegistryChainReader {
    async fn authoritative_expiry(
        &self,
        identifier: &LabelHash,
        namespace: Namespace,
        is_wrapped: bool,
    ) -> Result<u64, ChainReadError> {
        match ExpiryReadPath::select(namespace, is_wrapped) {
            ExpiryReadPath::L2Registrar => {
                let data =
                    encode_uint256_call(function_selector(NAME_EXPIRES_SIGNATURE), identifier);
                let output = self.l2.call(&self.contracts.l2_registrar, &data).await?;
                decode_u64_word(&output, 0)
            }
            ExpiryReadPath::BaseRegistrar => {
                let data =
                    encode_uint256_call(function_selector(NAME_EXPIRES_SIGNATURE), identifier);
                let output = self.primary.call(&self.contracts.base_registrar, &data).await?;
                decode_u64_word(&output, 0)
            }
            ExpiryReadPath::NameWrapper => {
                // getData returns (owner, fuses, expiry)
                let data = encode_uint256_call(function_selector(GET_DATA_SIGNATURE), identifier);
                let output = self.primary.call(&self.contracts.name_wrapper, &data).await?;
                decode_u64_word(&output, 2)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity API credential is not configured")]
    MissingCredential,
    #[error("identity transport failed: {0}")]
    Transport(#[from] FetchError),
    #[error("unrecognized identity response: {0}")]
    Malformed(String),
}

/// Wallets linked to one social identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub fid: u64,
    pub verified_eth_addresses: Vec<String>,
    pub custody_address: Option<String>,
}

#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// `Ok(None)` when the identity does not exist.
    async fn lookup(&self, fid: u64) -> Result<Option<IdentityProfile>, IdentityError>;
}

pub const NEYNAR_API_BASE: &str = "https://api.neynar.com";

#[derive(Debug, Clone)]
pub struct NeynarIdentityClient {
    http: Arc<JsonHttpClient>,
    base_url: String,
    api_key: Option<String>,
}

impl NeynarIdentityClient {
    pub fn new(
        http: Arc<JsonHttpClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let api_key = api_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        match &api_key {
            Some(key) => info!(api_key = %redact_secret(key), "identity client configured"),
            None => warn!("identity API key not configured; connected addresses will be empty"),
        }
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl IdentityLookup for NeynarIdentityClient {
    async fn lookup(&self, fid: u64) -> Result<Option<IdentityProfile>, IdentityError> {
        let api_key = self.api_key.as_ref().ok_or(IdentityError::MissingCredential)?;
        let url = format!("{}/v2/farcaster/user/bulk?fids={fid}", self.base_url);
        let response = self
            .http
            .get_json("identity", &url, &[("x-api-key", api_key.clone())])
            .await?;
        parse_bulk_users(&response, fid)
    }
}

pub fn parse_bulk_users(
    response: &JsonValue,
    fid: u64,
) -> Result<Option<IdentityProfile>, IdentityError> {
    let users = response
        .get("users")
        .and_then(|u| u.as_array())
        .ok_or_else(|| IdentityError::Malformed("missing users array".to_string()))?;
    let Some(user) = users.first() else {
        return Ok(None);
    };
    Ok(Some(IdentityProfile {
        fid: user.get("fid").and_then(|f| f.as_u64()).unwrap_or(fid),
        verified_eth_addresses: json_string_vec(user, &["verified_addresses", "eth_addresses"]),
        custody_address: json_non_empty_str(user, &["custody_address"]),
    }))
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport failed: {0}")]
    Transport(#[from] FetchError),
    #[error("mail provider rejected message: {0}")]
    Rejected(String),
}

/// One line of an expiry notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryNotice {
    pub name: String,
    pub expiry_date: String,
    pub days_left: i64,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_expiry_notice(
        &self,
        to: &str,
        domains: &[ExpiryNotice],
        user_name: Option<&str>,
    ) -> Result<(), MailError>;
}

pub fn expiry_subject(count: usize) -> String {
    if count == 1 {
        "Your ENS domain is expiring soon".to_string()
    } else {
        "Your ENS domains are expiring soon".to_string()
    }
}

pub fn expiry_text_body(domains: &[ExpiryNotice], user_name: Option<&str>) -> String {
    let mut lines = vec![format!("Hello {},", user_name.unwrap_or("there")), String::new()];
    for domain in domains {
        lines.push(format!(
            "- {}: expires {} ({} days left)",
            domain.name, domain.expiry_date, domain.days_left
        ));
    }
    lines.join("\n")
}

pub const RESEND_EMAILS_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone)]
pub struct ResendMailer {
    http: Arc<JsonHttpClient>,
    endpoint: String,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(
        http: Arc<JsonHttpClient>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            from: from.into(),
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send_expiry_notice(
        &self,
        to: &str,
        domains: &[ExpiryNotice],
        user_name: Option<&str>,
    ) -> Result<(), MailError> {
        let body = json!({
            "from": self.from,
            "to": [to],
            "subject": expiry_subject(domains.len()),
            "text": expiry_text_body(domains, user_name),
        });
        let response = self
            .http
            .post_json(
                "mail",
                &self.endpoint,
                &body,
                &[("authorization", format!("Bearer {}", self.api_key))],
            )
            .await?;
        match json_non_empty_str(&response, &["id"]) {
            Some(id) => {
                debug!(to, message_id = %id, "expiry notice accepted");
                Ok(())
            }
            None => Err(MailError::Rejected(
                json_str(&response, &["message"])
                    .unwrap_or("response carried no message id")
                    .to_string(),
            )),
        }
    }
}

/// Stand-in used when no mail provider is configured: records what would
/// have been sent and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_expiry_notice(
        &self,
        to: &str,
        domains: &[ExpiryNotice],
        _user_name: Option<&str>,
    ) -> Result<(), MailError> {
        let names = domains.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();
        info!(to, domains = ?names, "mail provider not configured, simulating expiry notice");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepens_core::label_to_identifier;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCaller {
        output: Vec<u8>,
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ContractCall for RecordingCaller {
        async fn call(&self, contract: &str, calldata: &[u8]) -> Result<Vec<u8>, ChainReadError> {
            self.calls
                .lock()
                .unwrap()
                .push((contract.to_string(), calldata.to_vec()));
            Ok(self.output.clone())
        }
    }

    fn word(value: u64) -> Vec<u8> {
        let mut out = vec![0u8; 24];
        out.extend_from_slice(&value.to_be_bytes());
        out
    }

    fn contracts() -> RegistryContracts {
        RegistryContracts {
            base_registrar: "0xbase".into(),
            name_wrapper: "0xwrapper".into(),
            l2_registrar: "0xl2".into(),
        }
    }

    #[test]
    fn name_expires_selector_matches_registrar_abi() {
        assert_eq!(hex::encode(function_selector(NAME_EXPIRES_SIGNATURE)), "d6e4fa86");
    }

    #[test]
    fn calldata_is_selector_then_identifier_word() {
        let id = label_to_identifier("alice");
        let data = encode_uint256_call([1, 2, 3, 4], &id);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
        assert_eq!(&data[4..], id.as_bytes());
    }

    #[test]
    fn decode_word_handles_short_and_oversized_values() {
        assert_eq!(decode_u64_word(&word(1_700_000_000), 0).unwrap(), 1_700_000_000);
        assert!(matches!(decode_u64_word(&[0u8; 31], 0), Err(ChainReadError::Malformed(_))));
        let mut big = word(1);
        big[0] = 1;
        assert!(matches!(
            decode_u64_word(&big, 0),
            Err(ChainReadError::Overflow { word_index: 0 })
        ));
    }

    #[test]
    fn read_path_selection() {
        assert_eq!(ExpiryReadPath::select(Namespace::L2, true), ExpiryReadPath::L2Registrar);
        assert_eq!(ExpiryReadPath::select(Namespace::L2, false), ExpiryReadPath::L2Registrar);
        assert_eq!(
            ExpiryReadPath::select(Namespace::Primary, false),
            ExpiryReadPath::BaseRegistrar
        );
        assert_eq!(ExpiryReadPath::select(Namespace::Primary, true), ExpiryReadPath::NameWrapper);
    }

    #[tokio::test]
    async fn wrapped_primary_reads_expiry_field_from_wrapper_data() {
        let mut output = word(0xdead);
        output.extend(word(0x10000));
        output.extend(word(1_800_000_000));
        let primary = Arc::new(RecordingCaller { output, ..Default::default() });
        let l2 = Arc::new(RecordingCaller::default());
        let reader = RegistryChainReader::new(primary.clone(), l2.clone(), contracts());

        let id = label_to_identifier("alice");
        let expiry = reader.authoritative_expiry(&id, Namespace::Primary, true).await.unwrap();
        assert_eq!(expiry, 1_800_000_000);

        let calls = primary.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "0xwrapper");
        assert_eq!(&calls[0].1[..4], &function_selector(GET_DATA_SIGNATURE));
        assert!(l2.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn l2_names_read_from_l2_registrar_only() {
        let primary = Arc::new(RecordingCaller::default());
        let l2 = Arc::new(RecordingCaller { output: word(42), ..Default::default() });
        let reader = RegistryChainReader::new(primary.clone(), l2.clone(), contracts());

        let expiry = reader
            .authoritative_expiry(&label_to_identifier("bob"), Namespace::L2, false)
            .await
            .unwrap();
        assert_eq!(expiry, 42);
        assert_eq!(l2.calls.lock().unwrap()[0].0, "0xl2");
        assert!(primary.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn rpc_error_object_is_surfaced() {
        let err = decode_rpc_result(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 3, "message": "execution reverted"}
        }))
        .unwrap_err();
        match err {
            ChainReadError::Rpc { code, message } => {
                assert_eq!(code, 3);
                assert_eq!(message, "execution reverted");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            decode_rpc_result(&json!({"result": "0xzz"})),
            Err(ChainReadError::Malformed(_))
        ));
    }

    #[test]
    fn graph_response_is_split_by_namespace_and_validated() {
        let response = json!({
            "data": {
                "domains": [
                    {
                        "id": "0x01",
                        "name": "alice.eth",
                        "labelName": "alice",
                        "expiryDate": "1700000000",
                        "owner": {"id": "0xOwner"}
                    },
                    {
                        "id": "0x02",
                        "name": "bob.base.eth",
                        "labelName": "bob",
                        "expiryDate": 1710000000,
                        "owner": {"id": "0xowner"}
                    },
                    {
                        "id": "0x03",
                        "name": "[abc].eth",
                        "labelName": null,
                        "expiryDate": null,
                        "owner": {"id": "0xowner"}
                    },
                    {"id": "0x04", "name": null, "labelName": "ghost", "owner": {"id": "0xowner"}},
                    {"id": "0x05", "name": "noowner.eth", "labelName": "noowner"}
                ]
            }
        });

        let primary = parse_graph_domains(&response, Namespace::Primary).unwrap();
        assert_eq!(primary.len(), 2);
        assert_eq!(primary[0].full_name, "alice.eth");
        assert_eq!(primary[0].raw_expiry, Some(1_700_000_000));
        assert_eq!(primary[0].owner_address, "0xOwner");
        assert_eq!(primary[1].label, None);
        assert_eq!(primary[1].raw_expiry, None);

        let l2 = parse_graph_domains(&response, Namespace::L2).unwrap();
        assert_eq!(l2.len(), 1);
        assert_eq!(l2[0].external_id.as_deref(), Some("0x02"));
        assert_eq!(l2[0].raw_expiry, Some(1_710_000_000));
        assert_eq!(l2[0].namespace, Namespace::L2);
    }

    #[test]
    fn graph_errors_and_unknown_shapes_are_rejected() {
        assert!(matches!(
            parse_graph_domains(&json!({"errors": [{"message": "boom"}]}), Namespace::Primary),
            Err(IndexerError::GraphQl(m)) if m == "boom"
        ));
        assert!(matches!(
            parse_graph_domains(&json!({"data": {"domains": {}}}), Namespace::Primary),
            Err(IndexerError::Malformed(_))
        ));
    }

    #[test]
    fn bulk_user_parsing_is_lenient() {
        let profile = parse_bulk_users(
            &json!({"users": [{
                "fid": 3,
                "custody_address": "0xCustody",
                "verified_addresses": {"eth_addresses": ["0xAAA", "", 7], "sol_addresses": ["x"]}
            }]}),
            3,
        )
        .unwrap()
        .unwrap();
        assert_eq!(profile.verified_eth_addresses, vec!["0xAAA".to_string()]);
        assert_eq!(profile.custody_address.as_deref(), Some("0xCustody"));

        let missing = parse_bulk_users(&json!({"users": [{}]}), 9).unwrap().unwrap();
        assert_eq!(missing.fid, 9);
        assert!(missing.verified_eth_addresses.is_empty());

        assert_eq!(parse_bulk_users(&json!({"users": []}), 1).unwrap(), None);
        assert!(parse_bulk_users(&json!({"result": {}}), 1).is_err());
    }

    #[test]
    fn secrets_are_redacted() {
        assert_eq!(redact_secret("abcd1234efgh5678"), "abcd...5678");
        assert_eq!(redact_secret("short"), "***");
    }

    #[test]
    fn notice_subject_and_body() {
        assert_eq!(expiry_subject(1), "Your ENS domain is expiring soon");
        assert_eq!(expiry_subject(2), "Your ENS domains are expiring soon");
        let body = expiry_text_body(
            &[ExpiryNotice {
                name: "alice.eth".into(),
                expiry_date: "March 5, 2026".into(),
                days_left: 4,
            }],
            None,
        );
        assert!(body.starts_with("Hello there,"));
        assert!(body.contains("alice.eth: expires March 5, 2026 (4 days left)"));
    }
}
