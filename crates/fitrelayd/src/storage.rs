//! Durable event storage with secondary indexes, backed by sled.
//!
//! Four logical multimaps mirror the spec's index shape: a unique primary
//! keyed by id, and by-author / by-kind / by-tag multimaps ordered for
//! `created_at`-descending range scans. Each secondary key embeds the
//! inverted `created_at` so a forward sled scan yields newest-first, with
//! the trailing id breaking exact-timestamp ties in ascending order.

use std::path::Path;

use fitrelay_core::Event;
use sled::{Db, Transactional, Tree};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed id: {0}")]
    MalformedId(String),
}

type Result<T> = std::result::Result<T, StorageError>;

/// An opaque resume point for a range scan; the bytes of the last key
/// yielded, scans resume strictly after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(Vec<u8>);

pub struct Storage {
    db: Db,
    events: Tree,
    idx_author: Tree,
    idx_kind: Tree,
    idx_tag: Tree,
    satellites: Tree,
    meta: Tree,
}

const IDENTITY_SEED_KEY: &[u8] = b"identity_seed";

fn decode_id(id: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(id).map_err(|e| StorageError::MalformedId(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| StorageError::MalformedId(format!("{id}: expected 32 bytes")))
}

fn decode_pubkey(pubkey: &str) -> Result<[u8; 32]> {
    decode_id(pubkey)
}

/// Larger `created_at` sorts first under a forward byte-order scan.
fn invert_created_at(created_at: i64) -> [u8; 8] {
    (u64::MAX - created_at as u64).to_be_bytes()
}

fn author_key(pubkey: &[u8; 32], created_at: i64, id: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + 8 + 32);
    key.extend_from_slice(pubkey);
    key.extend_from_slice(&invert_created_at(created_at));
    key.extend_from_slice(id);
    key
}

fn kind_key(kind: u32, created_at: i64, id: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 8 + 32);
    key.extend_from_slice(&kind.to_be_bytes());
    key.extend_from_slice(&invert_created_at(created_at));
    key.extend_from_slice(id);
    key
}

fn tag_key(name: char, value: &str, created_at: i64, id: &[u8; 32]) -> Vec<u8> {
    let value_bytes = value.as_bytes();
    let mut key = Vec::with_capacity(1 + 2 + value_bytes.len() + 8 + 32);
    key.push(name as u8);
    key.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
    key.extend_from_slice(value_bytes);
    key.extend_from_slice(&invert_created_at(created_at));
    key.extend_from_slice(id);
    key
}

fn tag_prefix(name: char, value: &str) -> Vec<u8> {
    let value_bytes = value.as_bytes();
    let mut prefix = Vec::with_capacity(1 + 2 + value_bytes.len());
    prefix.push(name as u8);
    prefix.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
    prefix.extend_from_slice(value_bytes);
    prefix
}

/// Trailing 32 bytes of a secondary key are always the event id.
fn id_from_index_key(key: &[u8]) -> [u8; 32] {
    let mut id = [0u8; 32];
    id.copy_from_slice(&key[key.len() - 32..]);
    id
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let idx_author = db.open_tree("idx_author")?;
        let idx_kind = db.open_tree("idx_kind")?;
        let idx_tag = db.open_tree("idx_tag")?;
        let satellites = db.open_tree("satellites")?;
        let meta = db.open_tree("meta")?;

        let storage = Self {
            db,
            events,
            idx_author,
            idx_kind,
            idx_tag,
            satellites,
            meta,
        };
        storage.rebuild_indexes_if_needed()?;
        Ok(storage)
    }

    /// Crash recovery: if the primary tree holds events but every secondary
    /// index is empty, the process must have died mid-write before index
    /// entries landed. Rebuild them from the primary.
    fn rebuild_indexes_if_needed(&self) -> Result<()> {
        let indexes_empty =
            self.idx_author.is_empty() && self.idx_kind.is_empty() && self.idx_tag.is_empty();
        if !indexes_empty || self.events.is_empty() {
            return Ok(());
        }

        for entry in self.events.iter() {
            let (_, bytes) = entry?;
            let event: Event = serde_json::from_slice(&bytes)?;
            self.write_secondary_indexes(&event)?;
        }
        Ok(())
    }

    fn write_secondary_indexes(&self, event: &Event) -> Result<()> {
        let id = decode_id(&event.id)?;
        let pubkey = decode_pubkey(&event.pubkey)?;

        self.idx_author
            .insert(author_key(&pubkey, event.created_at, &id), &[])?;
        self.idx_kind
            .insert(kind_key(event.kind, event.created_at, &id), &[])?;

        for tag in &event.tags {
            let Some(name) = tag.first() else { continue };
            if name.len() != 1 {
                continue;
            }
            let Some(value) = tag.get(1) else { continue };
            let name_char = name.chars().next().unwrap();
            self.idx_tag
                .insert(tag_key(name_char, value, event.created_at, &id), &[])?;
        }
        Ok(())
    }

    /// Store an event. Idempotent on duplicate id: since `id` is a content
    /// hash, re-Put of the same id carries identical fields, so every
    /// secondary key it produces is byte-identical to the first Put's.
    pub fn put_event(&self, event: &Event) -> Result<()> {
        let id = decode_id(&event.id)?;
        let pubkey = decode_pubkey(&event.pubkey)?;
        let value = serde_json::to_vec(event)?;

        (&self.events, &self.idx_author, &self.idx_kind, &self.idx_tag)
            .transaction(|(events, idx_author, idx_kind, idx_tag)| -> sled::transaction::ConflictableTransactionResult<(), StorageError> {
                events.insert(&id, value.as_slice())?;

                idx_author.insert(author_key(&pubkey, event.created_at, &id), &[][..])?;
                idx_kind.insert(kind_key(event.kind, event.created_at, &id), &[][..])?;

                for tag in &event.tags {
                    let Some(name) = tag.first() else { continue };
                    if name.len() != 1 {
                        continue;
                    }
                    let Some(value) = tag.get(1) else { continue };
                    let name_char = name.chars().next().unwrap();
                    idx_tag.insert(tag_key(name_char, value, event.created_at, &id), &[][..])?;
                }

                Ok(())
            })
            .map_err(|e| match e {
                sled::transaction::TransactionError::Abort(err) => err,
                sled::transaction::TransactionError::Storage(err) => StorageError::Sled(err),
            })?;

        Ok(())
    }

    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let key = decode_id(id)?;
        match self.events.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn has_event(&self, id: &str) -> Result<bool> {
        Ok(self.events.contains_key(decode_id(id)?)?)
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    fn load_events(&self, keys: impl Iterator<Item = [u8; 32]>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for id in keys {
            if let Some(bytes) = self.events.get(id)? {
                events.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(events)
    }

    fn scan_index(
        &self,
        tree: &Tree,
        prefix: &[u8],
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
        after: Option<&Cursor>,
    ) -> Result<(Vec<[u8; 32]>, Option<Cursor>)> {
        let mut ids = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;

        let range = match after {
            Some(cursor) => tree.range(next_key(&cursor.0)..),
            None => tree.range(prefix.to_vec()..),
        };

        for entry in range {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            let created_at = decode_created_at_from_index_key(&key, prefix.len());
            if let Some(until) = until {
                if created_at > until {
                    continue;
                }
            }
            if let Some(since) = since {
                if created_at < since {
                    break;
                }
            }
            ids.push(id_from_index_key(&key));
            last_key = Some(key.to_vec());
            if ids.len() >= limit {
                break;
            }
        }

        Ok((ids, last_key.map(Cursor)))
    }

    pub fn range_by_author(
        &self,
        pubkey: &str,
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
        after: Option<&Cursor>,
    ) -> Result<(Vec<Event>, Option<Cursor>)> {
        let pubkey_bytes = decode_pubkey(pubkey)?;
        let (ids, cursor) =
            self.scan_index(&self.idx_author, &pubkey_bytes, since, until, limit, after)?;
        Ok((self.load_events(ids.into_iter())?, cursor))
    }

    pub fn range_by_kind(
        &self,
        kind: u32,
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
        after: Option<&Cursor>,
    ) -> Result<(Vec<Event>, Option<Cursor>)> {
        let prefix = kind.to_be_bytes();
        let (ids, cursor) =
            self.scan_index(&self.idx_kind, &prefix, since, until, limit, after)?;
        Ok((self.load_events(ids.into_iter())?, cursor))
    }

    pub fn range_by_tag(
        &self,
        name: char,
        value: &str,
        since: Option<i64>,
        until: Option<i64>,
        limit: usize,
        after: Option<&Cursor>,
    ) -> Result<(Vec<Event>, Option<Cursor>)> {
        let prefix = tag_prefix(name, value);
        let (ids, cursor) =
            self.scan_index(&self.idx_tag, &prefix, since, until, limit, after)?;
        Ok((self.load_events(ids.into_iter())?, cursor))
    }

    /// Remove every event whose `expires_at` tag has passed, atomically
    /// across the primary and all applicable secondary index entries.
    pub fn delete_if_expired(&self, now: i64) -> Result<usize> {
        let mut expired = Vec::new();
        for entry in self.events.iter() {
            let (_, bytes) = entry?;
            let event: Event = serde_json::from_slice(&bytes)?;
            if let Some(expires_at) = event.expires_at() {
                if expires_at <= now {
                    expired.push(event);
                }
            }
        }

        for event in &expired {
            self.remove_event_atomically(event)?;
        }

        Ok(expired.len())
    }

    /// Remove one event's primary entry and every secondary index entry it
    /// produced in a single transaction, mirroring `put_event`'s atomicity.
    fn remove_event_atomically(&self, event: &Event) -> Result<()> {
        let id = decode_id(&event.id)?;
        let pubkey = decode_pubkey(&event.pubkey)?;

        (&self.events, &self.idx_author, &self.idx_kind, &self.idx_tag)
            .transaction(|(events, idx_author, idx_kind, idx_tag)| -> sled::transaction::ConflictableTransactionResult<(), StorageError> {
                events.remove(&id)?;

                idx_author.remove(author_key(&pubkey, event.created_at, &id))?;
                idx_kind.remove(kind_key(event.kind, event.created_at, &id))?;

                for tag in &event.tags {
                    let Some(name) = tag.first() else { continue };
                    if name.len() != 1 {
                        continue;
                    }
                    let Some(value) = tag.get(1) else { continue };
                    let name_char = name.chars().next().unwrap();
                    idx_tag.remove(tag_key(name_char, value, event.created_at, &id))?;
                }

                Ok(())
            })
            .map_err(|e| match e {
                sled::transaction::TransactionError::Abort(err) => err,
                sled::transaction::TransactionError::Storage(err) => StorageError::Sled(err),
            })?;

        Ok(())
    }

    pub fn put_satellite_record(&self, pubkey: &str, value: &[u8]) -> Result<()> {
        let key = decode_pubkey(pubkey)?;
        self.satellites.insert(key, value)?;
        Ok(())
    }

    pub fn all_satellite_records(&self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        for entry in self.satellites.iter() {
            let (_, value) = entry?;
            records.push(value.to_vec());
        }
        Ok(records)
    }

    /// The relay's own signing identity, persisted so restarts keep
    /// producing reference events under the same pubkey.
    pub fn get_identity_seed(&self) -> Result<Option<[u8; 32]>> {
        match self.meta.get(IDENTITY_SEED_KEY)? {
            Some(bytes) => {
                let seed: [u8; 32] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::MalformedId("identity seed".into()))?;
                Ok(Some(seed))
            }
            None => Ok(None),
        }
    }

    pub fn put_identity_seed(&self, seed: &[u8; 32]) -> Result<()> {
        self.meta.insert(IDENTITY_SEED_KEY, seed.as_ref())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_created_at_from_index_key(key: &[u8], prefix_len: usize) -> i64 {
    let inverted = u64::from_be_bytes(key[prefix_len..prefix_len + 8].try_into().unwrap());
    (u64::MAX - inverted) as i64
}

/// The immediate successor of a byte sequence, for an exclusive-lower-bound
/// resumed scan.
fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use fitrelay_core::event::{sign_event, UnsignedEvent};
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn make_event(kind: u32, created_at: i64, tags: Vec<Vec<String>>) -> Event {
        let key = SigningKey::generate(&mut OsRng);
        let unsigned = UnsignedEvent {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at,
            kind,
            tags,
            content: String::new(),
        };
        sign_event(&unsigned, &key).unwrap()
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);

        storage.put_event(&event).unwrap();
        assert!(storage.has_event(&event.id).unwrap());
        assert_eq!(storage.get_event(&event.id).unwrap().unwrap().id, event.id);
    }

    #[test]
    fn put_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);

        storage.put_event(&event).unwrap();
        storage.put_event(&event).unwrap();
        assert_eq!(storage.event_count(), 1);

        let (by_kind, _) = storage
            .range_by_kind(33401, None, None, 10, None)
            .unwrap();
        assert_eq!(by_kind.len(), 1);
    }

    #[test]
    fn range_by_kind_orders_created_at_descending() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let older = make_event(33401, 1_700_000_000, vec![]);
        let newer = make_event(33401, 1_700_000_100, vec![]);
        storage.put_event(&older).unwrap();
        storage.put_event(&newer).unwrap();

        let (events, _) = storage
            .range_by_kind(33401, None, None, 10, None)
            .unwrap();
        assert_eq!(events[0].id, newer.id);
        assert_eq!(events[1].id, older.id);
    }

    #[test]
    fn range_by_tag_filters_on_exact_value() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let chest = make_event(
            33401,
            1_700_000_000,
            vec![vec!["t".to_string(), "chest".to_string()]],
        );
        let legs = make_event(
            33401,
            1_700_000_000,
            vec![vec!["t".to_string(), "legs".to_string()]],
        );
        storage.put_event(&chest).unwrap();
        storage.put_event(&legs).unwrap();

        let (events, _) = storage
            .range_by_tag('t', "chest", None, None, 10, None)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, chest.id);
    }

    #[test]
    fn delete_if_expired_removes_primary_and_secondary_entries() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let expired = make_event(
            33401,
            1_700_000_000,
            vec![vec!["expires_at".to_string(), "1700000500".to_string()]],
        );
        let fresh = make_event(33401, 1_700_000_000, vec![]);
        storage.put_event(&expired).unwrap();
        storage.put_event(&fresh).unwrap();

        let removed = storage.delete_if_expired(1_700_000_600).unwrap();
        assert_eq!(removed, 1);
        assert!(!storage.has_event(&expired.id).unwrap());
        assert!(storage.has_event(&fresh.id).unwrap());

        let (by_kind, _) = storage
            .range_by_kind(33401, None, None, 10, None)
            .unwrap();
        assert_eq!(by_kind.len(), 1);
        assert_eq!(by_kind[0].id, fresh.id);
    }

    #[test]
    fn identity_seed_round_trips_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let seed = [9u8; 32];
        {
            let storage = Storage::open(dir.path()).unwrap();
            assert!(storage.get_identity_seed().unwrap().is_none());
            storage.put_identity_seed(&seed).unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        assert_eq!(storage.get_identity_seed().unwrap(), Some(seed));
    }

    #[test]
    fn rebuild_indexes_after_reopen_with_empty_indexes() {
        let dir = tempdir().unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);
        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.put_event(&event).unwrap();
            storage.idx_kind.clear().unwrap();
            storage.idx_author.clear().unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        let (events, _) = storage
            .range_by_kind(33401, None, None, 10, None)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }
}
