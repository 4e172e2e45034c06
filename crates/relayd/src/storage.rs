//! Log storage backings
//!
//! The store is a passive sink over per-guild append-only logs. It does
//! not re-check the chain; callers append events whose seq is exactly
//! the next expected. `delete_event` may leave seq gaps (retention).

use guildlog_core::event::Event;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt record at {0}")]
    Corrupt(String),
}

/// Abstract append-only log keyed by guild
pub trait LogStore: Send + Sync {
    /// Append an event; the caller guarantees seq is the next expected
    fn append(&self, guild_id: &str, event: &Event) -> Result<(), StorageError>;
    /// Full log in ascending seq order (may contain gaps after pruning)
    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>, StorageError>;
    /// Most recent event, if any
    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>, StorageError>;
    /// All guilds with at least one stored event
    fn get_guild_ids(&self) -> Result<Vec<String>, StorageError>;
    /// Remove one event by seq, leaving a gap
    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<(), StorageError>;
    /// Flush and release resources
    fn close(&self) -> Result<(), StorageError>;
}

/// Process-memory backing: guild id -> ordered seq map
#[derive(Default)]
pub struct MemoryLogStore {
    logs: RwLock<HashMap<String, BTreeMap<u64, Event>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryLogStore {
    fn append(&self, guild_id: &str, event: &Event) -> Result<(), StorageError> {
        self.logs
            .write()
            .entry(guild_id.to_string())
            .or_default()
            .insert(event.seq, event.clone());
        Ok(())
    }

    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>, StorageError> {
        Ok(self
            .logs
            .read()
            .get(guild_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>, StorageError> {
        Ok(self
            .logs
            .read()
            .get(guild_id)
            .and_then(|log| log.values().next_back().cloned()))
    }

    fn get_guild_ids(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.logs.read().keys().cloned().collect())
    }

    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<(), StorageError> {
        if let Some(log) = self.logs.write().get_mut(guild_id) {
            log.remove(&seq);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Persistent backing over sled.
///
/// Events live under `guild:<hex>:seq:<10-digit zero-padded>` in the
/// events tree; a `guild:<hex>:head` pointer in the heads tree records
/// the last assigned seq. The metadata tree persists the relay identity.
pub struct SledLogStore {
    db: sled::Db,
    events: sled::Tree,
    heads: sled::Tree,
    metadata: sled::Tree,
}

fn event_key(guild_id: &str, seq: u64) -> String {
    format!("guild:{guild_id}:seq:{seq:010}")
}

fn event_prefix(guild_id: &str) -> String {
    format!("guild:{guild_id}:seq:")
}

fn head_key(guild_id: &str) -> String {
    format!("guild:{guild_id}:head")
}

impl SledLogStore {
    /// Open (or create) storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let heads = db.open_tree("heads")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self { db, events, heads, metadata })
    }

    /// Store a metadata value (relay identity seed and the like)
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Fetch a metadata value
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }
}

impl LogStore for SledLogStore {
    fn append(&self, guild_id: &str, event: &Event) -> Result<(), StorageError> {
        let value = serde_json::to_vec(event)?;
        self.events.insert(event_key(guild_id, event.seq), value)?;
        self.heads
            .insert(head_key(guild_id), event.seq.to_string().as_bytes())?;
        Ok(())
    }

    fn get_log(&self, guild_id: &str) -> Result<Vec<Event>, StorageError> {
        let mut events = Vec::new();
        for item in self.events.scan_prefix(event_prefix(guild_id)) {
            let (key, value) = item?;
            let event: Event = serde_json::from_slice(&value).map_err(|_| {
                StorageError::Corrupt(String::from_utf8_lossy(&key).into_owned())
            })?;
            events.push(event);
        }
        Ok(events)
    }

    fn get_last_event(&self, guild_id: &str) -> Result<Option<Event>, StorageError> {
        // The head pointer may reference a pruned MESSAGE, so read the
        // last surviving record instead of trusting it blindly.
        match self.events.scan_prefix(event_prefix(guild_id)).next_back() {
            Some(item) => {
                let (key, value) = item?;
                let event: Event = serde_json::from_slice(&value).map_err(|_| {
                    StorageError::Corrupt(String::from_utf8_lossy(&key).into_owned())
                })?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn get_guild_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for item in self.heads.iter() {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(id) = key
                .strip_prefix("guild:")
                .and_then(|rest| rest.strip_suffix(":head"))
            {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn delete_event(&self, guild_id: &str, seq: u64) -> Result<(), StorageError> {
        self.events.remove(event_key(guild_id, seq))?;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildlog_core::crypto::KeyPair;
    use guildlog_core::event::{
        build_genesis, compute_event_id, signing_digest, ChannelKind, EventBody, GuildAccess,
    };
    use tempfile::tempdir;

    fn sample_events(kp: &KeyPair) -> (Vec<Event>, String) {
        let (guild_id, body, signature) =
            build_genesis(kp, "g", None, GuildAccess::Public, 1_000).unwrap();
        let genesis = Event {
            id: guild_id.clone(),
            seq: 0,
            prev_hash: None,
            created_at: 1_000,
            author: kp.user_id(),
            body,
            signature,
        };
        let body = EventBody::ChannelCreate {
            guild_id: guild_id.clone(),
            channel_id: "c1".into(),
            name: "general".into(),
            kind: ChannelKind::Text,
            retention: None,
        };
        let author = kp.user_id();
        let digest = signing_digest(&body, &author, 2_000).unwrap();
        let signature = kp.sign_digest(&digest).unwrap();
        let id = compute_event_id(1, Some(&genesis.id), 2_000, &author, &body).unwrap();
        let channel = Event {
            id,
            seq: 1,
            prev_hash: Some(genesis.id.clone()),
            created_at: 2_000,
            author,
            body,
            signature,
        };
        (vec![genesis, channel], guild_id)
    }

    fn exercise_store(store: &dyn LogStore) {
        let kp = KeyPair::generate();
        let (events, guild_id) = sample_events(&kp);

        assert!(store.get_last_event(&guild_id).unwrap().is_none());
        assert!(store.get_log(&guild_id).unwrap().is_empty());

        for event in &events {
            store.append(&guild_id, event).unwrap();
        }

        let log = store.get_log(&guild_id).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);

        let last = store.get_last_event(&guild_id).unwrap().unwrap();
        assert_eq!(last.seq, 1);

        assert_eq!(store.get_guild_ids().unwrap(), vec![guild_id.clone()]);

        store.delete_event(&guild_id, 1).unwrap();
        let log = store.get_log(&guild_id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].seq, 0);
        let last = store.get_last_event(&guild_id).unwrap().unwrap();
        assert_eq!(last.seq, 0);
    }

    #[test]
    fn memory_store_contract() {
        exercise_store(&MemoryLogStore::new());
    }

    #[test]
    fn sled_store_contract() {
        let dir = tempdir().unwrap();
        let store = SledLogStore::open(dir.path()).unwrap();
        exercise_store(&store);
        store.close().unwrap();
    }

    #[test]
    fn sled_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let kp = KeyPair::generate();
        let (events, guild_id) = sample_events(&kp);
        {
            let store = SledLogStore::open(dir.path()).unwrap();
            for event in &events {
                store.append(&guild_id, event).unwrap();
            }
            store.put_metadata("relay-seed", &[7u8; 32]).unwrap();
            store.close().unwrap();
        }
        let store = SledLogStore::open(dir.path()).unwrap();
        assert_eq!(store.get_log(&guild_id).unwrap().len(), 2);
        assert_eq!(
            store.get_metadata("relay-seed").unwrap().unwrap(),
            vec![7u8; 32]
        );
    }

    #[test]
    fn zero_padded_keys_sort_numerically() {
        assert!(event_key("g", 2) < event_key("g", 10));
        assert!(event_key("g", 999_999_999) < event_key("g", 1_000_000_000));
    }
}
