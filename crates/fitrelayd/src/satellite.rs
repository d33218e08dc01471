//! Satellite Registry: the set of known satellite nodes willing to host
//! PRIVATE events, their supported kinds, and a 24h liveness window.
//!
//! The in-memory cache is read-mostly; every mutation is also persisted via
//! `Storage::put_satellite_record` so a restart can repopulate it before the
//! relay starts accepting PRIVATE-classified events again.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::storage::{Storage, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteRecord {
    pub pubkey: String,
    pub url: String,
    pub supported_kinds: Vec<u32>,
    pub last_seen: i64,
}

#[derive(Default)]
pub struct SatelliteRegistry {
    nodes: RwLock<HashMap<String, SatelliteRecord>>,
}

impl SatelliteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repopulate the in-memory cache from durable storage. Must be called
    /// before the relay accepts PRIVATE events so restarts don't silently
    /// forget every previously registered satellite.
    pub fn load_from_storage(&self, storage: &Storage) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write();
        for raw in storage.all_satellite_records()? {
            if let Ok(record) = serde_json::from_slice::<SatelliteRecord>(&raw) {
                nodes.insert(record.pubkey.clone(), record);
            }
        }
        Ok(())
    }

    pub fn register(
        &self,
        storage: &Storage,
        pubkey: String,
        url: String,
        supported_kinds: Vec<u32>,
        now: i64,
    ) -> Result<(), StorageError> {
        let record = SatelliteRecord {
            pubkey: pubkey.clone(),
            url,
            supported_kinds,
            last_seen: now,
        };
        storage.put_satellite_record(&pubkey, &serde_json::to_vec(&record)?)?;
        self.nodes.write().insert(pubkey, record);
        Ok(())
    }

    fn is_live(record: &SatelliteRecord, now: i64, liveness_seconds: u64) -> bool {
        now.saturating_sub(record.last_seen) <= liveness_seconds as i64
    }

    /// Blossom-tag pinned routing takes priority; otherwise the first live
    /// node advertising support for `kind` is chosen.
    pub fn route(
        &self,
        kind: u32,
        pinned_pubkey: Option<&str>,
        now: i64,
        liveness_seconds: u64,
    ) -> Option<SatelliteRecord> {
        let nodes = self.nodes.read();

        if let Some(pinned) = pinned_pubkey {
            if let Some(record) = nodes.get(pinned) {
                if Self::is_live(record, now, liveness_seconds) {
                    return Some(record.clone());
                }
            }
            return None;
        }

        nodes
            .values()
            .find(|record| {
                Self::is_live(record, now, liveness_seconds)
                    && record.supported_kinds.contains(&kind)
            })
            .cloned()
    }

    pub fn list(&self, now: i64, liveness_seconds: u64) -> Vec<SatelliteRecord> {
        self.nodes
            .read()
            .values()
            .filter(|record| Self::is_live(record, now, liveness_seconds))
            .cloned()
            .collect()
    }
}
