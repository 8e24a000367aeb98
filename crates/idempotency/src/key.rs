use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic identifier for an externally originated operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key for a gateway notification: SHA-256 over provider, reference and
    /// reported status. Redeliveries of the same notification collide; a
    /// later status change for the same reference does not.
    pub fn webhook(provider: &str, reference: &str, status: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(reference.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(status.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Key for one application of a workflow step.
    pub fn step(instance_id: impl std::fmt::Display, step_index: usize, class: &str) -> Self {
        Self(format!("step:{instance_id}:{step_index}:{class}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_key_is_deterministic_hex() {
        let a = IdempotencyKey::webhook("ecocash", "ORD-1", "SUCCESS");
        let b = IdempotencyKey::webhook("ecocash", "ORD-1", "SUCCESS");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn webhook_key_separates_fields() {
        let base = IdempotencyKey::webhook("ecocash", "ORD-1", "SUCCESS");
        assert_ne!(base, IdempotencyKey::webhook("card", "ORD-1", "SUCCESS"));
        assert_ne!(base, IdempotencyKey::webhook("ecocash", "ORD-1", "FAILED"));
        // Field boundaries matter.
        assert_ne!(
            IdempotencyKey::webhook("ab", "c", "S"),
            IdempotencyKey::webhook("a", "bc", "S")
        );
    }

    #[test]
    fn step_key_is_readable() {
        let key = IdempotencyKey::step("abc", 2, "signal:payment");
        assert_eq!(key.to_string(), "step:abc:2:signal:payment");
    }
}
