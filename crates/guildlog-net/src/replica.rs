//! Client-side replica of guild state
//!
//! The replica mirrors the relay's reducer: it deduplicates inbound
//! events against a bounded FIFO, verifies signatures, applies events
//! that extend the local head, and flags everything else as a gap to be
//! healed by the next snapshot. Snapshots fold from genesis and fully
//! replace a guild's state, but may never contradict a pinned head.
//!
//! Replayed PUBLISH frames produce distinct events (fresh seq, fresh id)
//! and are not deduplicated here; application-level nonces are the
//! caller's concern.

use guildlog_core::crypto::verify_digest;
use guildlog_core::event::{event_id, signing_digest, Event, EventBody};
use guildlog_core::state::{
    apply_event, create_initial_state, reduce_log, state_from_checkpoint, verify_checkpoint,
    GuildState,
};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Dedup FIFO capacity
pub const SEEN_CAP: usize = 1000;
/// Size the FIFO is trimmed to when it overflows
pub const SEEN_LOW: usize = 900;

/// Replica errors (snapshot handling only; inbound events never error)
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("snapshot does not start at a valid genesis: {0}")]
    BadSnapshot(guildlog_core::state::StateError),
    #[error("checkpoint rejected: {0}")]
    BadCheckpoint(guildlog_core::state::StateError),
    #[error("snapshot contradicts pinned head at seq {seq}")]
    PinViolation { seq: u64 },
}

/// Outcome of feeding one inbound event
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Applied to local state and emitted to listeners
    Applied,
    /// Already seen; ignored
    Duplicate,
    /// Does not extend the local head; awaiting a snapshot
    Gap { expected_seq: u64, got: u64 },
    /// Bad signature or id; silently dropped
    Dropped,
}

/// Bounded dedup FIFO over event ids
struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    cap: usize,
    low: usize,
}

impl SeenIds {
    fn new(cap: usize, low: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap + 1),
            set: HashSet::with_capacity(cap + 1),
            cap,
            low,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.set.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.cap {
            while self.order.len() > self.low {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Replica statistics
#[derive(Debug, Clone)]
pub struct ReplicaStats {
    pub guild_count: usize,
    pub seen_len: usize,
    pub gap_count: u64,
    pub dropped_count: u64,
}

/// Mirror of guild state on the client side
pub struct Replica {
    states: HashMap<String, GuildState>,
    /// Highest observed (seq, id) per guild; snapshots may not contradict it
    pins: HashMap<String, (u64, String)>,
    seen: SeenIds,
    events_tx: broadcast::Sender<Event>,
    gap_count: u64,
    dropped_count: u64,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        Self::with_capacity(SEEN_CAP, SEEN_LOW)
    }

    pub fn with_capacity(cap: usize, low: usize) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            states: HashMap::new(),
            pins: HashMap::new(),
            seen: SeenIds::new(cap, low),
            events_tx,
            gap_count: 0,
            dropped_count: 0,
        }
    }

    /// Subscribe to the domain `"event"` stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Current state of one guild
    pub fn state(&self, guild_id: &str) -> Option<&GuildState> {
        self.states.get(guild_id)
    }

    pub fn stats(&self) -> ReplicaStats {
        ReplicaStats {
            guild_count: self.states.len(),
            seen_len: self.seen.len(),
            gap_count: self.gap_count,
            dropped_count: self.dropped_count,
        }
    }

    /// Feed one inbound EVENT frame
    pub fn handle_event(&mut self, event: Event) -> Inbound {
        if self.seen.contains(&event.id) {
            return Inbound::Duplicate;
        }

        // A bad signature or id may indicate a relay bug or malicious
        // peer; drop without surfacing to the application.
        let digest = match signing_digest(&event.body, &event.author, event.created_at) {
            Ok(d) => d,
            Err(e) => {
                warn!(id = %event.id, "undigestable event: {e}");
                self.dropped_count += 1;
                return Inbound::Dropped;
            }
        };
        if verify_digest(&event.author, &digest, &event.signature).is_err() {
            warn!(id = %event.id, author = %event.author, "dropping event with bad signature");
            self.dropped_count += 1;
            return Inbound::Dropped;
        }
        match event_id(&event) {
            Ok(computed) if computed == event.id => {}
            _ => {
                warn!(id = %event.id, "dropping event with mismatched id");
                self.dropped_count += 1;
                return Inbound::Dropped;
            }
        }

        self.seen.insert(event.id.clone());
        let guild_id = event.body.guild_id().to_string();

        match self.states.get_mut(&guild_id) {
            None => {
                if event.seq == 0 && matches!(event.body, EventBody::GuildCreate { .. }) {
                    match create_initial_state(&event) {
                        Ok(state) => {
                            self.pin(&guild_id, &event);
                            self.states.insert(guild_id, state);
                            let _ = self.events_tx.send(event);
                            Inbound::Applied
                        }
                        Err(e) => {
                            warn!(guild = %guild_id, "bad genesis event: {e}");
                            self.dropped_count += 1;
                            Inbound::Dropped
                        }
                    }
                } else {
                    debug!(guild = %guild_id, seq = event.seq, "event for unknown guild, awaiting snapshot");
                    self.gap_count += 1;
                    Inbound::Gap { expected_seq: 0, got: event.seq }
                }
            }
            Some(state) => {
                let expected_seq = state.head_seq + 1;
                if event.seq == expected_seq
                    && event.prev_hash.as_deref() == Some(state.head_hash.as_str())
                {
                    let next = apply_event(state.clone(), &event);
                    *state = next;
                    self.pin(&guild_id, &event);
                    let _ = self.events_tx.send(event);
                    Inbound::Applied
                } else {
                    debug!(
                        guild = %guild_id,
                        expected = expected_seq,
                        got = event.seq,
                        "gap detected, awaiting snapshot"
                    );
                    self.gap_count += 1;
                    Inbound::Gap { expected_seq, got: event.seq }
                }
            }
        }
    }

    /// Replace a guild's state by folding a snapshot from genesis.
    ///
    /// An empty snapshot leaves local state untouched (the relay does not
    /// know the guild yet). A snapshot that contradicts the pinned head is
    /// rejected wholesale.
    pub fn handle_snapshot(
        &mut self,
        guild_id: &str,
        events: &[Event],
    ) -> Result<(), ReplicaError> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some((pinned_seq, pinned_id)) = self.pins.get(guild_id) {
            if let Some(at_pin) = events.iter().find(|e| e.seq == *pinned_seq) {
                if at_pin.id != *pinned_id {
                    warn!(guild = %guild_id, seq = pinned_seq, "snapshot contradicts pinned head");
                    return Err(ReplicaError::PinViolation { seq: *pinned_seq });
                }
            }
        }
        let state = reduce_log(events).map_err(ReplicaError::BadSnapshot)?;
        for event in events {
            self.seen.insert(event.id.clone());
        }
        if let Some(last) = events.last() {
            self.pin(guild_id, last);
        }
        self.states.insert(guild_id.to_string(), state);
        Ok(())
    }

    /// Bootstrap a guild from a relay checkpoint instead of a full
    /// snapshot fold. The checkpoint must be authored by the trusted
    /// relay key and carry a matching rootHash.
    pub fn bootstrap_from_checkpoint(
        &mut self,
        event: &Event,
        relay_user_id: &str,
    ) -> Result<(), ReplicaError> {
        verify_checkpoint(event, relay_user_id).map_err(ReplicaError::BadCheckpoint)?;
        let state = state_from_checkpoint(event).map_err(ReplicaError::BadCheckpoint)?;
        let guild_id = event.body.guild_id().to_string();
        self.seen.insert(event.id.clone());
        self.pin(&guild_id, event);
        self.states.insert(guild_id, state);
        Ok(())
    }

    fn pin(&mut self, guild_id: &str, event: &Event) {
        let entry = self
            .pins
            .entry(guild_id.to_string())
            .or_insert_with(|| (event.seq, event.id.clone()));
        if event.seq >= entry.0 {
            *entry = (event.seq, event.id.clone());
        }
    }
}
