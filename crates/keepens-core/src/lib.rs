//! Core domain model, label hashing and expiry arithmetic for KeepENS.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "keepens-core";

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Suffix shared by every name registered through the L2 registrar.
pub const L2_NAME_SUFFIX: &str = ".base.eth";

/// Naming system a domain belongs to. Selects the indexer source and the
/// registry contracts used to read its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Primary,
    L2,
}

impl Namespace {
    pub const ALL: [Namespace; 2] = [Namespace::Primary, Namespace::L2];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Primary => "primary",
            Namespace::L2 => "l2",
        }
    }

    /// Suffix predicate used to split indexer results between namespaces.
    pub fn matches_name(self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        match self {
            Namespace::L2 => lower.ends_with(L2_NAME_SUFFIX),
            Namespace::Primary => !lower.ends_with(L2_NAME_SUFFIX),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indexer-sourced domain entry, before its expiry is reconciled on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub external_id: Option<String>,
    pub full_name: String,
    pub label: Option<String>,
    pub raw_expiry: Option<u64>,
    pub owner_address: String,
    pub namespace: Namespace,
}

impl DomainRecord {
    /// Label usable for hashing, if the indexer supplied a non-empty one.
    pub fn hashable_label(&self) -> Option<&str> {
        self.label.as_deref().filter(|label| !label.is_empty())
    }
}

/// Keccak-256 digest of a label, the lookup key into registrar contracts.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelHash([u8; 32]);

impl LabelHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for LabelHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for LabelHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LabelHash({})", self.to_hex())
    }
}

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash a human-readable label into its on-chain identifier.
pub fn label_to_identifier(label: &str) -> LabelHash {
    LabelHash(keccak256(label.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
    Active,
    ExpiringSoon,
    ExpiringVerySoon,
    Expired,
}

impl Urgency {
    pub fn from_days_left(days_left: i64) -> Self {
        if days_left < 0 {
            Urgency::Expired
        } else if days_left <= 7 {
            Urgency::ExpiringVerySoon
        } else if days_left <= 30 {
            Urgency::ExpiringSoon
        } else {
            Urgency::Active
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Active => "active",
            Urgency::ExpiringSoon => "expiring-soon",
            Urgency::ExpiringVerySoon => "expiring-very-soon",
            Urgency::Expired => "expired",
        }
    }
}

/// Whole days from `now_secs` until `expiry_timestamp`, rounded toward negative infinity.
pub fn days_left(expiry_timestamp: u64, now_secs: i64) -> i64 {
    let expiry = i64::try_from(expiry_timestamp).unwrap_or(i64::MAX);
    expiry.saturating_sub(now_secs).div_euclid(SECONDS_PER_DAY)
}

/// Engine output: one owned domain with its authoritative expiry.
///
/// `expiry_timestamp == 0` means neither the chain nor the indexer produced
/// an expiry; such entries classify as `Expired`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDomain {
    pub id: String,
    pub name: String,
    pub label: String,
    pub expiry_timestamp: u64,
    pub owner_address: String,
    pub days_left: i64,
    pub urgency: Urgency,
    pub is_wrapped: bool,
    pub namespace: Namespace,
}

/// Identifier for a record the indexer gave no id for.
pub fn synthesized_domain_id(label: &str, namespace: Namespace) -> String {
    format!("{label}-{namespace}")
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

pub fn addresses_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// `0x` followed by exactly 40 hex digits, any case.
pub fn is_hex_address(address: &str) -> bool {
    let trimmed = address.trim();
    let Some(body) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    else {
        return false;
    };
    body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub wallet_address: String,
    pub email: Option<String>,
    pub fid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted request to be notified before `ens_name` expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ens_name: String,
    pub expiry_date: DateTime<Utc>,
    pub notified: bool,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringSubscription {
    pub subscription: SubscriptionRecord,
    pub user: UserRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn label_hash_matches_known_vectors() {
        assert_eq!(
            label_to_identifier("eth").to_hex(),
            "0x4f5b812789fc606be1b3b16908db13fc7a9adf7ca72641f84d75b47069d3d7f0"
        );
        assert_eq!(
            label_to_identifier("").to_hex(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn label_hash_is_deterministic() {
        for label in ["alice", "bob", "unicode-ñ", "a.b"] {
            assert_eq!(label_to_identifier(label), label_to_identifier(label));
        }
        assert_ne!(label_to_identifier("alice"), label_to_identifier("Alice"));
    }

    #[test]
    fn urgency_boundaries() {
        assert_eq!(Urgency::from_days_left(-1), Urgency::Expired);
        assert_eq!(Urgency::from_days_left(0), Urgency::ExpiringVerySoon);
        assert_eq!(Urgency::from_days_left(7), Urgency::ExpiringVerySoon);
        assert_eq!(Urgency::from_days_left(8), Urgency::ExpiringSoon);
        assert_eq!(Urgency::from_days_left(30), Urgency::ExpiringSoon);
        assert_eq!(Urgency::from_days_left(31), Urgency::Active);
    }

    #[test]
    fn urgency_names_match_wire_format() {
        for urgency in [
            Urgency::Active,
            Urgency::ExpiringSoon,
            Urgency::ExpiringVerySoon,
            Urgency::Expired,
        ] {
            assert_eq!(serde_json::to_value(urgency).unwrap(), urgency.as_str());
        }
    }

    #[test]
    fn days_left_rounds_down() {
        assert_eq!(days_left((NOW + SECONDS_PER_DAY) as u64, NOW), 1);
        assert_eq!(days_left((NOW + SECONDS_PER_DAY - 1) as u64, NOW), 0);
        assert_eq!(days_left((NOW - 1) as u64, NOW), -1);
        assert_eq!(days_left(NOW as u64, NOW), 0);
    }

    #[test]
    fn unknown_expiry_is_hugely_negative_and_expired() {
        let days = days_left(0, NOW);
        assert!(days < -19_000);
        assert_eq!(Urgency::from_days_left(days), Urgency::Expired);
    }

    #[test]
    fn namespace_suffix_predicate_splits_names() {
        assert!(Namespace::L2.matches_name("alice.base.eth"));
        assert!(Namespace::L2.matches_name("Alice.BASE.eth"));
        assert!(!Namespace::L2.matches_name("alice.eth"));
        assert!(Namespace::Primary.matches_name("alice.eth"));
        assert!(!Namespace::Primary.matches_name("alice.base.eth"));
    }

    #[test]
    fn resolved_domain_serializes_camel_case_with_kebab_urgency() {
        let domain = ResolvedDomain {
            id: synthesized_domain_id("alice", Namespace::L2),
            name: "alice.base.eth".into(),
            label: "alice".into(),
            expiry_timestamp: 1,
            owner_address: "0xabc".into(),
            days_left: -3,
            urgency: Urgency::ExpiringVerySoon,
            is_wrapped: false,
            namespace: Namespace::L2,
        };
        let value = serde_json::to_value(&domain).unwrap();
        assert_eq!(value["id"], "alice-l2");
        assert_eq!(value["expiryTimestamp"], 1);
        assert_eq!(value["urgency"], "expiring-very-soon");
        assert_eq!(value["namespace"], "l2");
        assert_eq!(value["isWrapped"], false);
    }

    #[test]
    fn address_helpers() {
        assert_eq!(normalize_address(" 0xABcD "), "0xabcd");
        assert!(addresses_equal("0xABCD", "0xabcd"));
        assert!(is_hex_address("0x57f1887a8BF19b14fC0dF6Fd9B2acc9Af147eA85"));
        assert!(!is_hex_address("0x57f1887a8BF19b14fC0dF6Fd9B2acc9Af147eA8"));
        assert!(!is_hex_address("57f1887a8BF19b14fC0dF6Fd9B2acc9Af147eA85"));
    }
}
