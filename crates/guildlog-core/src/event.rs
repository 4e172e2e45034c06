//! Event model and chain rules for the guild log protocol
//!
//! An event's identity is the SHA-256 of its canonical unsigned form
//! (`id` and `signature` stripped). The signature covers only
//! `{body, author, createdAt}` so a relay can assign `seq`/`prevHash`
//! on the sender's behalf; tampering with seq/prevHash is still caught
//! by the id hash.

use crate::canonical::{hash_hex, sha256};
use crate::crypto::{verify_digest, KeyPair};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role id that always carries full privileges
pub const OWNER_ROLE: &str = "owner";
/// Role id that carries structural-change privileges
pub const ADMIN_ROLE: &str = "admin";

/// Guild visibility
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuildAccess {
    Public,
    Private,
}

/// Channel kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Text,
    Voice,
    EphemeralText,
}

/// Retention policy mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionMode {
    Infinite,
    RollingWindow,
    Ttl,
}

/// Channel retention policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Retention {
    pub mode: RetentionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
}

impl Retention {
    /// Retention window in milliseconds, or None for infinite
    pub fn window_ms(&self) -> Option<u64> {
        match self.mode {
            RetentionMode::Infinite => None,
            RetentionMode::Ttl => self.seconds.map(|s| s.saturating_mul(1_000)),
            RetentionMode::RollingWindow => {
                self.days.map(|d| u64::from(d).saturating_mul(86_400_000))
            }
        }
    }
}

/// Union of all event bodies, tagged by `type`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum EventBody {
    GuildCreate {
        guild_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        access: GuildAccess,
    },
    ChannelCreate {
        guild_id: String,
        channel_id: String,
        name: String,
        kind: ChannelKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retention: Option<Retention>,
    },
    EphemeralPolicyUpdate {
        guild_id: String,
        channel_id: String,
        retention: Retention,
    },
    RoleAssign {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    RoleRevoke {
        guild_id: String,
        user_id: String,
        role_id: String,
    },
    BanUser {
        guild_id: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    UnbanUser {
        guild_id: String,
        user_id: String,
    },
    Message {
        guild_id: String,
        channel_id: String,
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    EditMessage {
        guild_id: String,
        channel_id: String,
        message_id: String,
        new_content: String,
    },
    DeleteMessage {
        guild_id: String,
        channel_id: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ForkFrom {
        guild_id: String,
        parent_guild_id: String,
        parent_seq: u64,
        parent_root_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Checkpoint {
        guild_id: String,
        seq: u64,
        root_hash: String,
        state: String,
    },
}

impl EventBody {
    /// The guild this body belongs to
    pub fn guild_id(&self) -> &str {
        match self {
            EventBody::GuildCreate { guild_id, .. }
            | EventBody::ChannelCreate { guild_id, .. }
            | EventBody::EphemeralPolicyUpdate { guild_id, .. }
            | EventBody::RoleAssign { guild_id, .. }
            | EventBody::RoleRevoke { guild_id, .. }
            | EventBody::BanUser { guild_id, .. }
            | EventBody::UnbanUser { guild_id, .. }
            | EventBody::Message { guild_id, .. }
            | EventBody::EditMessage { guild_id, .. }
            | EventBody::DeleteMessage { guild_id, .. }
            | EventBody::ForkFrom { guild_id, .. }
            | EventBody::Checkpoint { guild_id, .. } => guild_id,
        }
    }

    /// Wire tag for this body
    pub fn type_name(&self) -> &'static str {
        match self {
            EventBody::GuildCreate { .. } => "GUILD_CREATE",
            EventBody::ChannelCreate { .. } => "CHANNEL_CREATE",
            EventBody::EphemeralPolicyUpdate { .. } => "EPHEMERAL_POLICY_UPDATE",
            EventBody::RoleAssign { .. } => "ROLE_ASSIGN",
            EventBody::RoleRevoke { .. } => "ROLE_REVOKE",
            EventBody::BanUser { .. } => "BAN_USER",
            EventBody::UnbanUser { .. } => "UNBAN_USER",
            EventBody::Message { .. } => "MESSAGE",
            EventBody::EditMessage { .. } => "EDIT_MESSAGE",
            EventBody::DeleteMessage { .. } => "DELETE_MESSAGE",
            EventBody::ForkFrom { .. } => "FORK_FROM",
            EventBody::Checkpoint { .. } => "CHECKPOINT",
        }
    }
}

/// A single record in a guild log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hex SHA-256 of the canonical unsigned form
    pub id: String,
    /// Dense per-guild sequence number, starting at 0
    pub seq: u64,
    /// Id of the previous event; null only at genesis
    pub prev_hash: Option<String>,
    /// Milliseconds since epoch, informational only
    pub created_at: u64,
    /// Author user id (compressed secp256k1 pubkey hex)
    pub author: String,
    pub body: EventBody,
    /// Compact ECDSA signature over `{body, author, createdAt}`, hex
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsignedEvent<'a> {
    seq: u64,
    prev_hash: Option<&'a str>,
    created_at: u64,
    author: &'a str,
    body: &'a EventBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    body: &'a EventBody,
    author: &'a str,
    created_at: u64,
}

/// Compute an event id from its unsigned fields.
///
/// The genesis body carries its own event id in `guildId`; to keep the
/// hash well-defined that field is blanked in the hashed form, which lets
/// clients compute the genesis id locally (seq 0, prevHash null).
pub fn compute_event_id(
    seq: u64,
    prev_hash: Option<&str>,
    created_at: u64,
    author: &str,
    body: &EventBody,
) -> Result<String> {
    let blanked;
    let body = if let EventBody::GuildCreate { name, description, access, .. } = body {
        blanked = EventBody::GuildCreate {
            guild_id: String::new(),
            name: name.clone(),
            description: description.clone(),
            access: *access,
        };
        &blanked
    } else {
        body
    };
    hash_hex(&UnsignedEvent { seq, prev_hash, created_at, author, body })
}

/// Recompute the id of a full event
pub fn event_id(event: &Event) -> Result<String> {
    compute_event_id(
        event.seq,
        event.prev_hash.as_deref(),
        event.created_at,
        &event.author,
        &event.body,
    )
}

/// Digest signed by the author: `SHA256(canonical({body, author, createdAt}))`
pub fn signing_digest(body: &EventBody, author: &str, created_at: u64) -> Result<[u8; 32]> {
    let bytes = crate::canonical::canonical_bytes(&SigningPayload {
        body,
        author,
        created_at,
    })?;
    Ok(sha256(&bytes))
}

/// Build a signed GUILD_CREATE body and its guild id.
///
/// Returns `(guild_id, body, signature_hex)`; the guild id doubles as the
/// genesis event id once the relay sequences it.
pub fn build_genesis(
    keypair: &KeyPair,
    name: &str,
    description: Option<String>,
    access: GuildAccess,
    created_at: u64,
) -> Result<(String, EventBody, String)> {
    let author = keypair.user_id();
    let unsigned_body = EventBody::GuildCreate {
        guild_id: String::new(),
        name: name.to_string(),
        description: description.clone(),
        access,
    };
    let guild_id = compute_event_id(0, None, created_at, &author, &unsigned_body)?;
    let body = EventBody::GuildCreate {
        guild_id: guild_id.clone(),
        name: name.to_string(),
        description,
        access,
    };
    let digest = signing_digest(&body, &author, created_at)?;
    let signature = keypair.sign_digest(&digest)?;
    Ok((guild_id, body, signature))
}

/// Derive a channel id from its creation record
pub fn derive_channel_id(
    guild_id: &str,
    name: &str,
    kind: ChannelKind,
    salt: &str,
) -> Result<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ChannelIdInput<'a> {
        guild_id: &'a str,
        name: &'a str,
        kind: ChannelKind,
        salt: &'a str,
    }
    hash_hex(&ChannelIdInput { guild_id, name, kind, salt })
}

/// Chain validation errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("empty log")]
    Empty,
    #[error("event {index}: expected seq {expected}, got {got}")]
    BadSeq { index: usize, expected: u64, got: u64 },
    #[error("event at seq {seq}: prevHash does not match predecessor id")]
    BrokenLink { seq: u64 },
    #[error("event at seq {seq}: id mismatch (computed {computed})")]
    IdMismatch { seq: u64, computed: String },
    #[error("event at seq {seq}: invalid signature")]
    BadSignature { seq: u64 },
    #[error("genesis guildId does not equal genesis event id")]
    GenesisGuildId,
    #[error("event at seq {seq}: guildId does not match the guild")]
    GuildMismatch { seq: u64 },
    #[error("event at seq {seq}: GUILD_CREATE only valid at seq 0")]
    MisplacedGenesis { seq: u64 },
    #[error("first event must be GUILD_CREATE at seq 0")]
    MissingGenesis,
    #[error("hashing failed: {0}")]
    Hash(#[from] crate::error::Error),
}

fn check_event_integrity(event: &Event) -> std::result::Result<(), ChainError> {
    let computed = event_id(event)?;
    if computed != event.id {
        return Err(ChainError::IdMismatch { seq: event.seq, computed });
    }
    let digest = signing_digest(&event.body, &event.author, event.created_at)?;
    verify_digest(&event.author, &digest, &event.signature)
        .map_err(|_| ChainError::BadSignature { seq: event.seq })
}

fn check_genesis(event: &Event) -> std::result::Result<(), ChainError> {
    if event.seq != 0 || !matches!(event.body, EventBody::GuildCreate { .. }) {
        return Err(ChainError::MissingGenesis);
    }
    if event.body.guild_id() != event.id {
        return Err(ChainError::GenesisGuildId);
    }
    Ok(())
}

/// Strict chain-integrity predicate: seqs dense from 0, prevHash links,
/// ids and signatures valid, guildId consistent, exactly one genesis.
pub fn validate_chain(events: &[Event]) -> std::result::Result<(), ChainError> {
    let genesis = events.first().ok_or(ChainError::Empty)?;
    check_genesis(genesis)?;
    let guild_id = genesis.id.clone();

    for (index, event) in events.iter().enumerate() {
        if event.seq != index as u64 {
            return Err(ChainError::BadSeq {
                index,
                expected: index as u64,
                got: event.seq,
            });
        }
        if index == 0 {
            if event.prev_hash.is_some() {
                return Err(ChainError::BrokenLink { seq: 0 });
            }
        } else {
            if matches!(event.body, EventBody::GuildCreate { .. }) {
                return Err(ChainError::MisplacedGenesis { seq: event.seq });
            }
            if event.prev_hash.as_deref() != Some(events[index - 1].id.as_str()) {
                return Err(ChainError::BrokenLink { seq: event.seq });
            }
            if event.body.guild_id() != guild_id {
                return Err(ChainError::GuildMismatch { seq: event.seq });
            }
        }
        check_event_integrity(event)?;
    }
    Ok(())
}

/// Relaxed chain predicate for logs that have been retention-pruned.
///
/// Seqs must be strictly increasing; the prevHash link is only checked
/// between surviving events with adjacent seqs. Ids and signatures are
/// always checked. MESSAGE absence is retention, not tampering.
pub fn validate_chain_pruned(events: &[Event]) -> std::result::Result<(), ChainError> {
    let genesis = events.first().ok_or(ChainError::Empty)?;
    check_genesis(genesis)?;
    let guild_id = genesis.id.clone();

    let mut prev: Option<&Event> = None;
    for event in events {
        if let Some(p) = prev {
            if event.seq <= p.seq {
                return Err(ChainError::BadSeq {
                    index: event.seq as usize,
                    expected: p.seq + 1,
                    got: event.seq,
                });
            }
            if matches!(event.body, EventBody::GuildCreate { .. }) {
                return Err(ChainError::MisplacedGenesis { seq: event.seq });
            }
            if event.seq == p.seq + 1 && event.prev_hash.as_deref() != Some(p.id.as_str()) {
                return Err(ChainError::BrokenLink { seq: event.seq });
            }
            if event.body.guild_id() != guild_id {
                return Err(ChainError::GuildMismatch { seq: event.seq });
            }
        }
        check_event_integrity(event)?;
        prev = Some(event);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Build a correctly chained, signed event for tests.
    pub fn signed_event(
        keypair: &KeyPair,
        seq: u64,
        prev_hash: Option<&str>,
        created_at: u64,
        body: EventBody,
    ) -> Event {
        let author = keypair.user_id();
        let digest = signing_digest(&body, &author, created_at).unwrap();
        let signature = keypair.sign_digest(&digest).unwrap();
        let id = compute_event_id(seq, prev_hash, created_at, &author, &body).unwrap();
        Event {
            id,
            seq,
            prev_hash: prev_hash.map(String::from),
            created_at,
            author,
            body,
            signature,
        }
    }

    /// Genesis plus a channel, returning (events, guild_id, channel_id).
    pub fn guild_with_channel(keypair: &KeyPair) -> (Vec<Event>, String, String) {
        let (guild_id, body, signature) =
            build_genesis(keypair, "testers", None, GuildAccess::Public, 1_000).unwrap();
        let author = keypair.user_id();
        let genesis = Event {
            id: guild_id.clone(),
            seq: 0,
            prev_hash: None,
            created_at: 1_000,
            author,
            body,
            signature,
        };
        let channel_id =
            derive_channel_id(&guild_id, "general", ChannelKind::Text, "salt-1").unwrap();
        let channel = signed_event(
            keypair,
            1,
            Some(&genesis.id),
            2_000,
            EventBody::ChannelCreate {
                guild_id: guild_id.clone(),
                channel_id: channel_id.clone(),
                name: "general".into(),
                kind: ChannelKind::Text,
                retention: None,
            },
        );
        (vec![genesis, channel], guild_id, channel_id)
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn body_serializes_with_wire_tags() {
        let body = EventBody::BanUser {
            guild_id: "g".into(),
            user_id: "u".into(),
            reason: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "BAN_USER");
        assert_eq!(json["guildId"], "g");
        assert_eq!(json["userId"], "u");
        // absent, not null
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn prev_hash_null_at_genesis() {
        let kp = KeyPair::generate();
        let (events, _, _) = guild_with_channel(&kp);
        let json = serde_json::to_value(&events[0]).unwrap();
        assert!(json["prevHash"].is_null());
        let json = serde_json::to_value(&events[1]).unwrap();
        assert!(json["prevHash"].is_string());
    }

    #[test]
    fn genesis_guild_id_equals_event_id() {
        let kp = KeyPair::generate();
        let (events, guild_id, _) = guild_with_channel(&kp);
        assert_eq!(events[0].id, guild_id);
        assert_eq!(events[0].body.guild_id(), guild_id);
        assert_eq!(event_id(&events[0]).unwrap(), guild_id);
    }

    #[test]
    fn id_covers_seq_and_prev_hash() {
        let kp = KeyPair::generate();
        let (mut events, _, _) = guild_with_channel(&kp);
        events[1].seq = 5;
        assert_ne!(event_id(&events[1]).unwrap(), events[1].id);
    }

    #[test]
    fn signature_does_not_cover_seq() {
        let kp = KeyPair::generate();
        let (mut events, _, _) = guild_with_channel(&kp);
        events[1].seq = 5;
        let digest =
            signing_digest(&events[1].body, &events[1].author, events[1].created_at).unwrap();
        assert!(verify_digest(&events[1].author, &digest, &events[1].signature).is_ok());
    }

    #[test]
    fn valid_chain_passes() {
        let kp = KeyPair::generate();
        let (events, _, _) = guild_with_channel(&kp);
        validate_chain(&events).unwrap();
    }

    #[test]
    fn chain_rejects_broken_link() {
        let kp = KeyPair::generate();
        let (mut events, _, _) = guild_with_channel(&kp);
        events[1].prev_hash = Some("00".repeat(32));
        assert!(matches!(
            validate_chain(&events),
            Err(ChainError::BrokenLink { seq: 1 })
        ));
    }

    #[test]
    fn chain_rejects_tampered_body() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, _) = guild_with_channel(&kp);
        events[1].body = EventBody::ChannelCreate {
            guild_id,
            channel_id: "other".into(),
            name: "other".into(),
            kind: ChannelKind::Text,
            retention: None,
        };
        assert!(matches!(
            validate_chain(&events),
            Err(ChainError::IdMismatch { seq: 1, .. })
        ));
    }

    #[test]
    fn chain_rejects_forged_signature() {
        let kp = KeyPair::generate();
        let forger = KeyPair::generate();
        let (mut events, _, _) = guild_with_channel(&kp);
        let digest =
            signing_digest(&events[1].body, &events[1].author, events[1].created_at).unwrap();
        events[1].signature = forger.sign_digest(&digest).unwrap();
        assert!(matches!(
            validate_chain(&events),
            Err(ChainError::BadSignature { seq: 1 })
        ));
    }

    #[test]
    fn pruned_chain_tolerates_gaps() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, channel_id) = guild_with_channel(&kp);
        for seq in 2..5u64 {
            let prev = events.last().unwrap().id.clone();
            events.push(signed_event(
                &kp,
                seq,
                Some(&prev),
                2_000 + seq,
                EventBody::Message {
                    guild_id: guild_id.clone(),
                    channel_id: channel_id.clone(),
                    message_id: format!("m{seq}"),
                    content: "hi".into(),
                    reply_to: None,
                },
            ));
        }
        validate_chain(&events).unwrap();
        // prune the middle message
        events.remove(3);
        assert!(validate_chain(&events).is_err());
        validate_chain_pruned(&events).unwrap();
    }

    #[test]
    fn pruned_chain_still_rejects_tampering() {
        let kp = KeyPair::generate();
        let (mut events, _, _) = guild_with_channel(&kp);
        events[1].created_at += 1;
        assert!(validate_chain_pruned(&events).is_err());
    }

    #[test]
    fn channel_id_depends_on_all_inputs() {
        let a = derive_channel_id("g", "general", ChannelKind::Text, "s1").unwrap();
        let b = derive_channel_id("g", "general", ChannelKind::Text, "s2").unwrap();
        let c = derive_channel_id("g", "general", ChannelKind::Voice, "s1").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
