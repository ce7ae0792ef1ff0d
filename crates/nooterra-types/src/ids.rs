//! Newtype identifiers. Each carries its own string prefix - `"key_<uuid>"`,
//! `"entry_<uuid>"` - so that an id's kind is recognizable from the string
//! alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! prefixed_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

prefixed_id!(TenantId, "tenant");
prefixed_id!(AgentId, "agent");
prefixed_id!(RunId, "run");
prefixed_id!(StreamId, "stream");
prefixed_id!(EventId, "evt");
prefixed_id!(ArtifactId, "artifact");
prefixed_id!(WalletId, "wallet");
prefixed_id!(SettlementId, "settlement");
prefixed_id!(RfqId, "rfq");
prefixed_id!(BidId, "bid");
prefixed_id!(AgreementId, "agreement");
prefixed_id!(DisputeId, "dispute");
prefixed_id!(DelegationId, "delegation");
prefixed_id!(KeyId, "key");
prefixed_id!(GateId, "gate");
prefixed_id!(LedgerEntryId, "entry");
prefixed_id!(VerdictId, "verdict");
prefixed_id!(AdjustmentId, "adjustment");
prefixed_id!(ProposalId, "proposal");

/// Content address of a canonicalized document: lowercase hex SHA-256.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An idempotency key as supplied by the caller in the `Idempotency-Key`
/// header. Opaque on our side; uniqueness is scoped to `(tenantId, key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer cents. All ledger arithmetic is exact, checked integer math —
/// never floating point.
pub type Cents = i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"));
    }

    #[test]
    fn ids_roundtrip_through_string() {
        let id = TenantId::from("tenant_abc");
        assert_eq!(id.as_str(), "tenant_abc");
        assert_eq!(id.to_string(), "tenant_abc");
    }
}
