//! Event model: canonical encoding, content-addressed ids, and signatures.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Kind allow-list: the fixed set plus the open addressable range.
pub const ALLOWED_KINDS: &[u32] = &[1301, 33401, 33402];
pub const ALLOWED_KIND_RANGE: std::ops::RangeInclusive<u32> = 32018..=32048;

pub fn kind_allowed(kind: u32) -> bool {
    ALLOWED_KINDS.contains(&kind) || ALLOWED_KIND_RANGE.contains(&kind)
}

/// A single tag: an ordered, non-empty sequence of strings. The first
/// element is the tag name.
pub type Tag = Vec<String>;

/// A signed event, the unit of publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 64 lowercase hex chars: sha256 of the canonical encoding.
    pub id: String,
    /// 64 lowercase hex chars: Ed25519 verifying key of the author.
    pub pubkey: String,
    /// Unix timestamp, seconds.
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
    /// 128 lowercase hex chars: Ed25519 signature over the raw id bytes.
    pub sig: String,
}

/// The subset of fields that participate in the canonical encoding, prior
/// to id derivation and signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Tag>,
    pub content: String,
}

/// Canonical form: `[0, pubkey, created_at, kind, tags, content]`, serialized
/// with `serde_json`. The leading `0` is a fixed version discriminant.
pub fn canonical_json(event: &UnsignedEvent) -> Result<String> {
    let value = (
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    Ok(serde_json::to_string(&value)?)
}

/// sha256 of the canonical encoding, lowercase hex.
pub fn compute_id(event: &UnsignedEvent) -> Result<String> {
    let canonical = canonical_json(event)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

fn decode_fixed<const N: usize>(hex_str: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidFormat(format!("{field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidFormat(format!("{field}: expected {N} bytes")))
}

impl Event {
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    fn verify_signature(&self) -> Result<()> {
        let pubkey_bytes: [u8; 32] = decode_fixed(&self.pubkey, "pubkey")?;
        let verifying_key = VerifyingKey::from_bytes(&pubkey_bytes)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

        let sig_bytes: [u8; 64] = decode_fixed(&self.sig, "sig")?;
        let signature = Signature::from_bytes(&sig_bytes);

        let id_bytes: [u8; 32] = decode_fixed(&self.id, "id")?;
        verifying_key
            .verify(&id_bytes, &signature)
            .map_err(|_| Error::InvalidSig)
    }

    /// Full ingest validation per the Event Validator contract: format,
    /// recomputed id, signature, kind allow-list, then clock skew.
    ///
    /// `now` and `max_future_skew_seconds` together bound how far into the
    /// future `created_at` may sit; the past is unbounded.
    pub fn validate(&self, now: i64, max_future_skew_seconds: i64) -> Result<()> {
        if self.id.len() != 64 || !self.id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidFormat("id must be 64 hex chars".into()));
        }
        if self.pubkey.len() != 64 || !self.pubkey.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidFormat("pubkey must be 64 hex chars".into()));
        }
        if self.sig.len() != 128 || !self.sig.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidFormat("sig must be 128 hex chars".into()));
        }
        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Err(Error::InvalidFormat("tags must be non-empty".into()));
        }

        let computed = compute_id(&self.unsigned())?;
        if computed != self.id {
            return Err(Error::InvalidId {
                computed,
                supplied: self.id.clone(),
            });
        }

        self.verify_signature()?;

        if !kind_allowed(self.kind) {
            return Err(Error::UnsupportedKind(self.kind));
        }

        if self.created_at > now + max_future_skew_seconds {
            return Err(Error::ClockSkew {
                created_at: self.created_at,
                max_future: max_future_skew_seconds,
            });
        }

        Ok(())
    }

    /// First value of the first tag named `name`, if any.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// `expires_at` tag value parsed as a unix timestamp, if present and well-formed.
    pub fn expires_at(&self) -> Option<i64> {
        self.first_tag_value("expires_at").and_then(|v| v.parse().ok())
    }
}

/// Sign an unsigned event with the given Ed25519 signing key, producing a
/// fully formed `Event`.
pub fn sign_event(
    unsigned: &UnsignedEvent,
    signing_key: &ed25519_dalek::SigningKey,
) -> Result<Event> {
    use ed25519_dalek::Signer;

    let id = compute_id(unsigned)?;
    let id_bytes: [u8; 32] = decode_fixed(&id, "id")?;
    let signature = signing_key.sign(&id_bytes);

    Ok(Event {
        id,
        pubkey: hex::encode(signing_key.verifying_key().to_bytes()),
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags.clone(),
        content: unsigned.content.clone(),
        sig: hex::encode(signature.to_bytes()),
    })
}

/// Order two events by `created_at` descending, tiebreaking on `id` ascending.
pub fn order_events(events: &mut [Event]) {
    events.sort_by(|a, b| match b.created_at.cmp(&a.created_at) {
        std::cmp::Ordering::Equal => a.id.cmp(&b.id),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn test_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn sample_unsigned(key: &SigningKey) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at: 1_700_000_000,
            kind: 33401,
            tags: vec![
                vec!["d".to_string(), "abc".to_string()],
                vec!["title".to_string(), "Push-up".to_string()],
            ],
            content: String::new(),
        }
    }

    #[test]
    fn id_round_trips_through_canonicalization() {
        let key = test_key();
        let unsigned = sample_unsigned(&key);
        let event = sign_event(&unsigned, &key).unwrap();
        assert_eq!(compute_id(&event.unsigned()).unwrap(), event.id);
    }

    #[test]
    fn valid_event_passes_validation() {
        let key = test_key();
        let event = sign_event(&sample_unsigned(&key), &key).unwrap();
        assert!(event.validate(1_700_000_100, 60).is_ok());
    }

    #[test]
    fn tampered_id_is_rejected() {
        let key = test_key();
        let mut event = sign_event(&sample_unsigned(&key), &key).unwrap();
        event.id = "0".repeat(64);
        let err = event.validate(1_700_000_100, 60).unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let key = test_key();
        let other = test_key();
        let mut unsigned = sample_unsigned(&key);
        unsigned.pubkey = hex::encode(other.verifying_key().to_bytes());
        let event = sign_event(&unsigned, &key).unwrap();
        let err = event.validate(1_700_000_100, 60).unwrap_err();
        assert_eq!(err.code(), "INVALID_SIG");
    }

    #[test]
    fn disallowed_kind_is_rejected() {
        let key = test_key();
        let mut unsigned = sample_unsigned(&key);
        unsigned.kind = 99;
        let event = sign_event(&unsigned, &key).unwrap();
        let err = event.validate(1_700_000_100, 60).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_KIND");
    }

    #[test]
    fn far_future_created_at_is_rejected() {
        let key = test_key();
        let mut unsigned = sample_unsigned(&key);
        unsigned.created_at = 1_700_100_000;
        let event = sign_event(&unsigned, &key).unwrap();
        let err = event.validate(1_700_000_000, 60).unwrap_err();
        assert_eq!(err.code(), "CLOCK_SKEW");
    }

    #[test]
    fn far_past_created_at_is_accepted() {
        let key = test_key();
        let mut unsigned = sample_unsigned(&key);
        unsigned.created_at = 0;
        let event = sign_event(&unsigned, &key).unwrap();
        assert!(event.validate(1_700_000_000, 60).is_ok());
    }

    #[test]
    fn order_events_breaks_ties_by_id_ascending() {
        let key = test_key();
        let mut a = sign_event(&sample_unsigned(&key), &key).unwrap();
        let mut b = a.clone();
        a.id = "a".repeat(64);
        b.id = "b".repeat(64);
        let mut events = vec![b.clone(), a.clone()];
        order_events(&mut events);
        assert_eq!(events[0].id, a.id);
        assert_eq!(events[1].id, b.id);
    }
}
