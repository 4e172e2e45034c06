//! Guild state and the deterministic reducer
//!
//! State is the structural view of a guild derived by folding its log.
//! The reducer is pure: given the same ordered log, two implementations
//! must produce byte-identical serialized states. Message events and
//! FORK_FROM touch only the head pointer; rendering message history is a
//! log scan, not a state concern.

use crate::canonical::{canonical_string, sha256};
use crate::event::{Event, EventBody, GuildAccess, Retention, OWNER_ROLE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Reducer errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("initial state requires a GUILD_CREATE at seq 0")]
    NotGenesis,
    #[error("not a CHECKPOINT event")]
    NotCheckpoint,
    #[error("checkpoint author {author} is not the trusted relay key")]
    UntrustedCheckpoint { author: String },
    #[error("checkpoint rootHash does not match its state")]
    RootHashMismatch,
    #[error("state serialization failed: {0}")]
    Serialization(#[from] crate::error::Error),
    #[error("state deserialization failed: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// A channel as seen by the reducer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEntry {
    pub name: String,
    pub kind: crate::event::ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
}

/// A role definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleEntry {
    pub name: String,
    pub permissions: Vec<String>,
}

/// A member record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub joined_at: u64,
}

/// A ban record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub banned_at: u64,
}

/// Reduced structural view of one guild at some head
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuildState {
    pub guild_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub access: GuildAccess,
    pub owner_id: String,
    pub created_at: u64,
    pub head_seq: u64,
    pub head_hash: String,
    pub channels: BTreeMap<String, ChannelEntry>,
    pub roles: BTreeMap<String, RoleEntry>,
    pub members: BTreeMap<String, MemberEntry>,
    pub bans: BTreeMap<String, BanEntry>,
}

/// Seed state from a genesis event. The author becomes the permanent
/// owner with a single `owner` role.
pub fn create_initial_state(genesis: &Event) -> Result<GuildState, StateError> {
    let EventBody::GuildCreate { guild_id, name, description, access } = &genesis.body else {
        return Err(StateError::NotGenesis);
    };
    if genesis.seq != 0 {
        return Err(StateError::NotGenesis);
    }
    let mut members = BTreeMap::new();
    members.insert(
        genesis.author.clone(),
        MemberEntry {
            roles: BTreeSet::from([OWNER_ROLE.to_string()]),
            nickname: None,
            joined_at: genesis.created_at,
        },
    );
    Ok(GuildState {
        guild_id: guild_id.clone(),
        name: name.clone(),
        description: description.clone(),
        access: *access,
        owner_id: genesis.author.clone(),
        created_at: genesis.created_at,
        head_seq: 0,
        head_hash: genesis.id.clone(),
        channels: BTreeMap::new(),
        roles: BTreeMap::new(),
        members,
        bans: BTreeMap::new(),
    })
}

/// Apply one event to a state, producing the successor state.
///
/// Pure and total: event types without structural semantics advance only
/// the head pointer. The state is taken by value so a fold over a long
/// log moves the untouched mappings through unchanged.
pub fn apply_event(mut state: GuildState, event: &Event) -> GuildState {
    match &event.body {
        EventBody::ChannelCreate { channel_id, name, kind, retention, .. } => {
            state.channels.insert(
                channel_id.clone(),
                ChannelEntry {
                    name: name.clone(),
                    kind: *kind,
                    retention: retention.clone(),
                },
            );
        }
        EventBody::EphemeralPolicyUpdate { channel_id, retention, .. } => {
            if let Some(channel) = state.channels.get_mut(channel_id) {
                channel.retention = Some(retention.clone());
            }
        }
        EventBody::RoleAssign { user_id, role_id, .. } => {
            state
                .members
                .entry(user_id.clone())
                .or_insert_with(|| MemberEntry {
                    roles: BTreeSet::new(),
                    nickname: None,
                    joined_at: event.created_at,
                })
                .roles
                .insert(role_id.clone());
        }
        EventBody::RoleRevoke { user_id, role_id, .. } => {
            if let Some(member) = state.members.get_mut(user_id) {
                member.roles.remove(role_id);
            }
        }
        EventBody::BanUser { user_id, reason, .. } => {
            state.bans.insert(
                user_id.clone(),
                BanEntry {
                    reason: reason.clone(),
                    banned_at: event.created_at,
                },
            );
            state.members.remove(user_id);
        }
        EventBody::UnbanUser { user_id, .. } => {
            state.bans.remove(user_id);
        }
        // Message history is a log concern, not a state concern.
        EventBody::Message { .. }
        | EventBody::EditMessage { .. }
        | EventBody::DeleteMessage { .. }
        | EventBody::ForkFrom { .. }
        | EventBody::Checkpoint { .. }
        | EventBody::GuildCreate { .. } => {}
    }
    state.head_seq = event.seq;
    state.head_hash = event.id.clone();
    state
}

/// Fold an ordered log into a state. The first event must be genesis.
pub fn reduce_log(events: &[Event]) -> Result<GuildState, StateError> {
    let genesis = events.first().ok_or(StateError::NotGenesis)?;
    let mut state = create_initial_state(genesis)?;
    for event in &events[1..] {
        state = apply_event(state, event);
    }
    Ok(state)
}

/// Canonical serialization of a state (the checkpoint payload format)
pub fn serialize_state(state: &GuildState) -> Result<String, StateError> {
    Ok(canonical_string(state)?)
}

/// Parse a serialized state
pub fn deserialize_state(serialized: &str) -> Result<GuildState, StateError> {
    Ok(serde_json::from_str(serialized)?)
}

/// Root hash of a state: `SHA256(canonical(state))`, hex
pub fn state_root_hash(state: &GuildState) -> Result<String, StateError> {
    Ok(hex::encode(sha256(serialize_state(state)?.as_bytes())))
}

/// Alternative bootstrap: seed a state from a CHECKPOINT event.
///
/// The embedded snapshot is the state at `seq - 1`; applying the
/// checkpoint event itself brings the head up to the checkpoint.
pub fn state_from_checkpoint(event: &Event) -> Result<GuildState, StateError> {
    let EventBody::Checkpoint { state, .. } = &event.body else {
        return Err(StateError::NotCheckpoint);
    };
    let state = deserialize_state(state)?;
    Ok(apply_event(state, event))
}

/// Verify a CHECKPOINT against the relay key the verifier trusts:
/// correct author, and `rootHash == SHA256(canonical(state))`.
pub fn verify_checkpoint(event: &Event, relay_user_id: &str) -> Result<(), StateError> {
    let EventBody::Checkpoint { root_hash, state, .. } = &event.body else {
        return Err(StateError::NotCheckpoint);
    };
    if event.author != relay_user_id {
        return Err(StateError::UntrustedCheckpoint { author: event.author.clone() });
    }
    let parsed = deserialize_state(state)?;
    if state_root_hash(&parsed)? != *root_hash {
        return Err(StateError::RootHashMismatch);
    }
    Ok(())
}
