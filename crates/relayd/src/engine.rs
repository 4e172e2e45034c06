//! Sequencing engine
//!
//! Processes publishes for many guilds concurrently while guaranteeing
//! strict per-guild serializability. Every ingest step for one event —
//! head read, seq/prevHash assignment, id computation, signature
//! verification, state lookup or rebuild, validation, append, cache
//! update, broadcast enqueue — runs inside that guild's lock. At most
//! one guild lock is held per task, for the duration of one event.
//!
//! The state cache is a correctness shortcut, not an authority: any
//! doubt (cold, behind, storage failure) forces a rebuild from the log.

use crate::storage::LogStore;
use crate::subscriptions::SubscriptionRegistry;
use guildlog_core::crypto::verify_digest;
use guildlog_core::event::{compute_event_id, signing_digest, Event, EventBody};
use guildlog_core::state::{apply_event, create_initial_state, reduce_log, GuildState};
use guildlog_core::validate::validate_event;
use guildlog_net::frame::{ErrorCode, Frame, Publish};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Ingest rejections, mapped onto wire error codes
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("{0}")]
    Validation(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PublishError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PublishError::InvalidSignature => ErrorCode::InvalidSignature,
            PublishError::Validation(_) => ErrorCode::ValidationFailed,
            PublishError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub active_guilds: usize,
    pub cached_states: usize,
}

/// Per-guild serialized ingest over a shared log store
pub struct SequencingEngine {
    store: Arc<dyn LogStore>,
    subs: Arc<SubscriptionRegistry>,
    /// Lazily created, never removed; one lock per live guild
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// State at headSeq per guild; mutated only under the guild lock
    states: SyncMutex<HashMap<String, GuildState>>,
}

impl SequencingEngine {
    pub fn new(store: Arc<dyn LogStore>, subs: Arc<SubscriptionRegistry>) -> Self {
        Self {
            store,
            subs,
            locks: SyncMutex::new(HashMap::new()),
            states: SyncMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// The lock serializing all ingest for one guild
    pub fn guild_lock(&self, guild_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(guild_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            active_guilds: self.locks.lock().len(),
            cached_states: self.states.lock().len(),
        }
    }

    /// Ingest one publish: assign seq/prevHash, verify, validate,
    /// append, broadcast. Returns the sequenced event.
    pub async fn publish(&self, publish: Publish) -> Result<Event, PublishError> {
        let guild_id = publish.body.guild_id().to_string();
        let lock = self.guild_lock(&guild_id);
        let _guard = lock.lock().await;
        self.ingest_locked(&guild_id, publish)
    }

    /// Ingest one publish with the guild lock already held by the
    /// caller. The checkpoint path uses this so a state capture and the
    /// append that follows stay under one continuous lock acquisition.
    pub(crate) fn ingest_locked(
        &self,
        guild_id: &str,
        publish: Publish,
    ) -> Result<Event, PublishError> {
        let last = self
            .store
            .get_last_event(guild_id)
            .map_err(|e| self.internal(guild_id, "head read failed", e))?;

        let (seq, prev_hash) = match &last {
            Some(last) => (last.seq + 1, Some(last.id.clone())),
            None => (0, None),
        };

        let id = compute_event_id(
            seq,
            prev_hash.as_deref(),
            publish.created_at,
            &publish.author,
            &publish.body,
        )
        .map_err(|e| PublishError::Internal(format!("id computation failed: {e}")))?;

        let event = Event {
            id,
            seq,
            prev_hash,
            created_at: publish.created_at,
            author: publish.author,
            body: publish.body,
            signature: publish.signature,
        };

        let digest = signing_digest(&event.body, &event.author, event.created_at)
            .map_err(|e| PublishError::Internal(format!("digest failed: {e}")))?;
        verify_digest(&event.author, &digest, &event.signature)
            .map_err(|_| PublishError::InvalidSignature)?;

        let new_state = if seq == 0 {
            let EventBody::GuildCreate { guild_id: body_guild, .. } = &event.body else {
                return Err(PublishError::Validation(
                    "first event of a guild must be GUILD_CREATE".into(),
                ));
            };
            if body_guild != &event.id {
                return Err(PublishError::Validation(
                    "genesis guildId must equal the genesis event id".into(),
                ));
            }
            create_initial_state(&event)
                .map_err(|e| PublishError::Validation(e.to_string()))?
        } else {
            if matches!(event.body, EventBody::GuildCreate { .. }) {
                return Err(PublishError::Validation(
                    "guild already exists; GUILD_CREATE only valid at seq 0".into(),
                ));
            }
            let state = self.state_for(guild_id, seq)?;
            validate_event(&state, &event)
                .map_err(|e| PublishError::Validation(e.to_string()))?;
            apply_event(state, &event)
        };

        if let Err(e) = self.store.append(guild_id, &event) {
            return Err(self.internal(guild_id, "append failed", e));
        }
        self.states.lock().insert(guild_id.to_string(), new_state);

        match Frame::Event(Box::new(event.clone())).to_text() {
            Ok(text) => {
                let reached = self.subs.broadcast(guild_id, &text);
                debug!(guild = guild_id, seq = event.seq, reached, "event broadcast");
            }
            Err(e) => warn!(guild = guild_id, "broadcast encode failed: {e}"),
        }

        Ok(event)
    }

    /// State at `next_seq - 1`: the cache when it is exactly at the
    /// predecessor, otherwise a rebuild from the full log (rebuild wins
    /// over any cached value).
    fn state_for(&self, guild_id: &str, next_seq: u64) -> Result<GuildState, PublishError> {
        if let Some(state) = self.states.lock().remove(guild_id) {
            if state.head_seq == next_seq - 1 {
                return Ok(state);
            }
            // stale; fall through to a rebuild, which wins
        }
        debug!(guild = guild_id, "state cache miss, rebuilding from log");
        let log = self
            .store
            .get_log(guild_id)
            .map_err(|e| self.internal(guild_id, "log read failed", e))?;
        reduce_log(&log)
            .map_err(|e| PublishError::Internal(format!("state rebuild failed: {e}")))
    }

    /// Current state of a guild (for retention/checkpoint work that
    /// already holds the guild lock): cache if present, else rebuild.
    pub fn current_state(&self, guild_id: &str) -> Result<GuildState, PublishError> {
        if let Some(state) = self.states.lock().get(guild_id) {
            return Ok(state.clone());
        }
        let log = self
            .store
            .get_log(guild_id)
            .map_err(|e| self.internal(guild_id, "log read failed", e))?;
        reduce_log(&log)
            .map_err(|e| PublishError::Internal(format!("state rebuild failed: {e}")))
    }

    fn internal(
        &self,
        guild_id: &str,
        what: &str,
        err: crate::storage::StorageError,
    ) -> PublishError {
        // Evict the cached state so the next ingest rebuilds from the
        // log instead of trusting a tentatively advanced cache.
        self.states.lock().remove(guild_id);
        warn!(guild = guild_id, "{what}: {err}");
        PublishError::Internal(format!("{what}: {err}"))
    }
}
