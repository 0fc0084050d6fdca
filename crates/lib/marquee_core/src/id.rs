// @awa-component: CORE-Identifiers
//
//! Opaque identifiers with a single canonicalization boundary.
//!
//! Raw identifier values arrive from tokens, request bodies, query strings and
//! database rows in slightly different shapes (padded, quoted, numeric). They
//! are canonicalized exactly once, when the typed identifier is built, and all
//! comparisons happen between typed identifiers afterwards.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn uuidv7() -> Uuid {
    Uuid::now_v7()
}

/// Trim whitespace and strip any number of wrapping quote pairs.
pub fn canonicalize(raw: &str) -> &str {
    let mut current = raw.trim();
    loop {
        let stripped = strip_wrapping_quotes(current);
        if stripped.len() == current.len() {
            return current;
        }
        current = stripped.trim();
    }
}

fn strip_wrapping_quotes(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Accepts string and numeric JSON identifiers alike.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentifier {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RawIdentifier {
    fn into_string(self) -> String {
        match self {
            RawIdentifier::Text(s) => s,
            RawIdentifier::Signed(n) => n.to_string(),
            RawIdentifier::Unsigned(n) => n.to_string(),
        }
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build the identifier from a raw value, canonicalizing it.
            pub fn new(raw: impl AsRef<str>) -> Self {
                Self(canonicalize(raw.as_ref()).to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::new(raw)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self::new(raw)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawIdentifier::deserialize(deserializer).map(|raw| Self::new(raw.into_string()))
            }
        }
    };
}

identifier!(
    /// A user, administrator or synthetic agent principal.
    UserId
);

identifier!(
    /// A theater: the top-level partition of all data and authorization.
    TenantId
);

identifier!(
    /// A persisted order.
    OrderId
);

identifier!(
    /// Client-generated key that makes order submission idempotent.
    IdempotencyKey
);

impl UserId {
    /// Synthetic principal used by the POS agent of a tenant.
    pub fn agent_for(tenant_id: &TenantId) -> Self {
        Self(format!("agent:{tenant_id}"))
    }
}

impl IdempotencyKey {
    /// A fresh random key, generated once per queued order.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuidv7_is_monotonic() {
        let a = uuidv7();
        let b = uuidv7();
        assert!(b >= a);
    }

    #[test]
    fn canonicalize_trims_and_strips_quotes() {
        assert_eq!(canonicalize("  T1 "), "T1");
        assert_eq!(canonicalize("\"T1\""), "T1");
        assert_eq!(canonicalize(" ' \"T1\" ' "), "T1");
        assert_eq!(canonicalize("\""), "\"");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn identifiers_compare_after_canonicalization() {
        assert_eq!(TenantId::new("\"T1\""), TenantId::new("T1 "));
        assert_ne!(TenantId::new("T1"), TenantId::new("T2"));
    }

    #[test]
    fn identifiers_deserialize_from_strings_and_numbers() {
        let from_str: TenantId = serde_json::from_str("\" 42 \"").unwrap();
        let from_num: TenantId = serde_json::from_str("42").unwrap();
        assert_eq!(from_str, from_num);
        assert_eq!(serde_json::to_string(&from_num).unwrap(), "\"42\"");
    }

    #[test]
    fn agent_principal_is_bound_to_tenant() {
        let id = UserId::agent_for(&TenantId::new("T1"));
        assert_eq!(id.as_str(), "agent:T1");
    }

    #[test]
    fn generated_idempotency_keys_are_unique() {
        assert_ne!(IdempotencyKey::generate(), IdempotencyKey::generate());
    }
}
