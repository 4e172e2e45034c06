//! Message history rendering
//!
//! Messages never enter structural state; clients render a channel's
//! history by scanning the log. A message is live when no later
//! DELETE_MESSAGE names it and it is still inside the channel's
//! retention window; its rendered content is the last EDIT_MESSAGE's
//! newContent, if any.

use crate::event::{Event, EventBody};
use crate::state::GuildState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One renderable message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedMessage {
    pub message_id: String,
    pub author: String,
    pub created_at: u64,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub edited: bool,
}

/// Render the live messages of one channel from an ordered log.
///
/// Pruned logs work too: retention already removed what this scan would
/// have filtered by window, and deletes of pruned messages are no-ops.
pub fn channel_history(
    state: &GuildState,
    events: &[Event],
    channel_id: &str,
    now_ms: u64,
) -> Vec<RenderedMessage> {
    let window_ms = state
        .channels
        .get(channel_id)
        .and_then(|c| c.retention.as_ref())
        .and_then(|r| r.window_ms());

    // One ordered pass: a delete only tombstones messages that precede
    // it, and an edit only lands on a message that is still live.
    let mut order: Vec<String> = Vec::new();
    let mut live: HashMap<String, RenderedMessage> = HashMap::new();
    let mut tombstones: HashSet<String> = HashSet::new();
    for event in events {
        match &event.body {
            EventBody::Message { channel_id: c, message_id, content, reply_to, .. }
                if c == channel_id =>
            {
                if !live.contains_key(message_id) && !tombstones.contains(message_id) {
                    order.push(message_id.clone());
                }
                tombstones.remove(message_id);
                live.insert(
                    message_id.clone(),
                    RenderedMessage {
                        message_id: message_id.clone(),
                        author: event.author.clone(),
                        created_at: event.created_at,
                        content: content.clone(),
                        reply_to: reply_to.clone(),
                        edited: false,
                    },
                );
            }
            EventBody::EditMessage { channel_id: c, message_id, new_content, .. }
                if c == channel_id =>
            {
                if let Some(message) = live.get_mut(message_id) {
                    message.content = new_content.clone();
                    message.edited = true;
                }
            }
            EventBody::DeleteMessage { channel_id: c, message_id, .. }
                if c == channel_id =>
            {
                if live.remove(message_id).is_some() {
                    tombstones.insert(message_id.clone());
                }
            }
            _ => {}
        }
    }

    order
        .into_iter()
        .filter_map(|message_id| live.remove(&message_id))
        .filter(|message| match window_ms {
            Some(window_ms) => now_ms.saturating_sub(message.created_at) <= window_ms,
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::event::testutil::{guild_with_channel, signed_event};
    use crate::event::{Retention, RetentionMode};
    use crate::state::reduce_log;

    fn extend(events: &mut Vec<Event>, kp: &KeyPair, created_at: u64, body: EventBody) {
        let prev = events.last().unwrap();
        let seq = prev.seq + 1;
        let prev_id = prev.id.clone();
        events.push(signed_event(kp, seq, Some(&prev_id), created_at, body));
    }

    fn message(guild: &str, channel: &str, id: &str, content: &str) -> EventBody {
        EventBody::Message {
            guild_id: guild.into(),
            channel_id: channel.into(),
            message_id: id.into(),
            content: content.into(),
            reply_to: None,
        }
    }

    #[test]
    fn deleted_messages_disappear() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, channel_id) = guild_with_channel(&kp);
        extend(&mut events, &kp, 3_000, message(&guild_id, &channel_id, "m1", "one"));
        extend(&mut events, &kp, 3_100, message(&guild_id, &channel_id, "m2", "two"));
        extend(
            &mut events,
            &kp,
            3_200,
            EventBody::DeleteMessage {
                guild_id: guild_id.clone(),
                channel_id: channel_id.clone(),
                message_id: "m1".into(),
                reason: None,
            },
        );
        let state = reduce_log(&events).unwrap();
        let history = channel_history(&state, &events, &channel_id, 5_000);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_id, "m2");
    }

    #[test]
    fn last_edit_wins() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, channel_id) = guild_with_channel(&kp);
        extend(&mut events, &kp, 3_000, message(&guild_id, &channel_id, "m1", "first"));
        for (at, text) in [(3_100, "second"), (3_200, "third")] {
            extend(
                &mut events,
                &kp,
                at,
                EventBody::EditMessage {
                    guild_id: guild_id.clone(),
                    channel_id: channel_id.clone(),
                    message_id: "m1".into(),
                    new_content: text.into(),
                },
            );
        }
        let state = reduce_log(&events).unwrap();
        let history = channel_history(&state, &events, &channel_id, 5_000);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "third");
        assert!(history[0].edited);
    }

    #[test]
    fn retention_window_filters_old_messages() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, channel_id) = guild_with_channel(&kp);
        extend(
            &mut events,
            &kp,
            2_500,
            EventBody::EphemeralPolicyUpdate {
                guild_id: guild_id.clone(),
                channel_id: channel_id.clone(),
                retention: Retention {
                    mode: RetentionMode::Ttl,
                    days: None,
                    seconds: Some(10),
                },
            },
        );
        extend(&mut events, &kp, 3_000, message(&guild_id, &channel_id, "old", "old"));
        extend(&mut events, &kp, 12_000, message(&guild_id, &channel_id, "new", "new"));
        let state = reduce_log(&events).unwrap();
        // 14s: "old" (3s) is 11s old, past the 10s ttl; "new" is 2s old
        let history = channel_history(&state, &events, &channel_id, 14_000);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_id, "new");
    }

    #[test]
    fn other_channels_are_invisible() {
        let kp = KeyPair::generate();
        let (mut events, guild_id, channel_id) = guild_with_channel(&kp);
        extend(&mut events, &kp, 3_000, message(&guild_id, "elsewhere", "mx", "hidden"));
        extend(&mut events, &kp, 3_100, message(&guild_id, &channel_id, "m1", "visible"));
        let state = reduce_log(&events).unwrap();
        let history = channel_history(&state, &events, &channel_id, 5_000);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message_id, "m1");
    }
}
