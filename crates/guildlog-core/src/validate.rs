//! Permission/eligibility predicate
//!
//! Invoked by the relay between signature verification and append.
//! Structural changes require owner or admin standing; messages require a
//! known channel, no ban, and membership when the guild is private.

use crate::event::{Event, EventBody, GuildAccess, ADMIN_ROLE, OWNER_ROLE};
use crate::state::GuildState;
use thiserror::Error;

/// Validation rejections
#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("author {author} lacks permission for {event_type}")]
    Permission { author: String, event_type: &'static str },
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("author {0} is banned")]
    Banned(String),
    #[error("author {0} is not a member of this private guild")]
    NotMember(String),
    #[error("event guildId {event} does not match guild {state}")]
    GuildMismatch { event: String, state: String },
}

fn is_privileged(state: &GuildState, author: &str) -> bool {
    if author == state.owner_id {
        return true;
    }
    state
        .members
        .get(author)
        .map(|m| m.roles.contains(OWNER_ROLE) || m.roles.contains(ADMIN_ROLE))
        .unwrap_or(false)
}

/// Predicate over an event against the authoritative state at its
/// predecessor. Chain integrity is checked elsewhere.
pub fn validate_event(state: &GuildState, event: &Event) -> Result<(), ValidateError> {
    if event.body.guild_id() != state.guild_id {
        return Err(ValidateError::GuildMismatch {
            event: event.body.guild_id().to_string(),
            state: state.guild_id.clone(),
        });
    }
    match &event.body {
        EventBody::ChannelCreate { .. }
        | EventBody::EphemeralPolicyUpdate { .. }
        | EventBody::RoleAssign { .. }
        | EventBody::RoleRevoke { .. }
        | EventBody::BanUser { .. }
        | EventBody::UnbanUser { .. } => {
            if !is_privileged(state, &event.author) {
                return Err(ValidateError::Permission {
                    author: event.author.clone(),
                    event_type: event.body.type_name(),
                });
            }
            Ok(())
        }
        EventBody::Message { channel_id, .. } => {
            if !state.channels.contains_key(channel_id) {
                return Err(ValidateError::UnknownChannel(channel_id.clone()));
            }
            if state.bans.contains_key(&event.author) {
                return Err(ValidateError::Banned(event.author.clone()));
            }
            if state.access == GuildAccess::Private
                && !state.members.contains_key(&event.author)
            {
                return Err(ValidateError::NotMember(event.author.clone()));
            }
            Ok(())
        }
        // Everything else is unrestricted beyond chain rules.
        _ => Ok(()),
    }
}
