//! Retention pruning and state checkpoints
//!
//! Two periodic tasks per relay instance, both on 60 s timers. Prune
//! deletes MESSAGE events that have outlived their channel's ttl or
//! rolling-window retention; nothing else is ever deleted. Checkpoint
//! publishes a signed state snapshot through the normal sequencing path
//! for every guild whose log does not already end in one. Individual
//! guild failures are logged and skipped.

use crate::engine::SequencingEngine;
use crate::storage::LogStore;
use guildlog_core::crypto::KeyPair;
use guildlog_core::event::{EventBody, Retention};
use guildlog_core::state::{serialize_state, state_root_hash, GuildState};
use guildlog_net::frame::Publish;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Timer period for both loops
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(60);

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn retention_window(retention: Option<&Retention>) -> Option<u64> {
    retention.and_then(Retention::window_ms)
}

/// One prune pass over a single guild. Returns the number of deleted
/// events. Caller holds the guild lock.
pub fn prune_guild(
    engine: &SequencingEngine,
    guild_id: &str,
    now_ms: u64,
) -> anyhow::Result<usize> {
    let store = engine.store();
    let log = store.get_log(guild_id)?;
    if log.is_empty() {
        return Ok(0);
    }
    let state = engine.current_state(guild_id).map_err(anyhow::Error::new)?;

    let mut deleted = 0;
    for event in &log {
        let EventBody::Message { channel_id, .. } = &event.body else {
            continue;
        };
        let Some(channel) = state.channels.get(channel_id) else {
            continue;
        };
        let Some(window_ms) = retention_window(channel.retention.as_ref()) else {
            continue;
        };
        if now_ms.saturating_sub(event.created_at) > window_ms {
            store.delete_event(guild_id, event.seq)?;
            deleted += 1;
        }
    }
    if deleted > 0 {
        debug!(guild = guild_id, deleted, "pruned expired messages");
    }
    Ok(deleted)
}

/// One prune pass over every known guild
pub async fn run_prune(engine: &SequencingEngine, now_ms: u64) {
    let guild_ids = match engine.store().get_guild_ids() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("prune: guild enumeration failed: {e}");
            return;
        }
    };
    for guild_id in guild_ids {
        let lock = engine.guild_lock(&guild_id);
        let _guard = lock.lock().await;
        if let Err(e) = prune_guild(engine, &guild_id, now_ms) {
            warn!(guild = %guild_id, "prune failed: {e}");
        }
    }
}

/// Build the checkpoint publish for a state snapshot
fn checkpoint_publish(
    relay: &KeyPair,
    state: &GuildState,
    next_seq: u64,
    created_at: u64,
) -> anyhow::Result<Publish> {
    let serialized = serialize_state(state)?;
    let root_hash = state_root_hash(state)?;
    let body = EventBody::Checkpoint {
        guild_id: state.guild_id.clone(),
        seq: next_seq,
        root_hash,
        state: serialized,
    };
    Ok(Publish::signed(relay, body, created_at)?)
}

/// One checkpoint pass over a single guild. Skips guilds with no events
/// and guilds whose last event is already a checkpoint.
///
/// Head read, state capture, and the append all happen under one
/// continuous guild lock acquisition: no publish can interleave, so the
/// embedded state is exactly the log prefix below the checkpoint's seq.
pub async fn checkpoint_guild(
    engine: &SequencingEngine,
    relay: &KeyPair,
    guild_id: &str,
    now_ms: u64,
) -> anyhow::Result<bool> {
    let lock = engine.guild_lock(guild_id);
    let _guard = lock.lock().await;

    let Some(last) = engine.store().get_last_event(guild_id)? else {
        return Ok(false);
    };
    if matches!(last.body, EventBody::Checkpoint { .. }) {
        return Ok(false);
    }
    let state = engine.current_state(guild_id).map_err(anyhow::Error::new)?;
    // The relay is itself an author: the checkpoint goes through the
    // same ingest path and is broadcast like any other event.
    let publish = checkpoint_publish(relay, &state, last.seq + 1, now_ms)?;
    let event = engine
        .ingest_locked(guild_id, publish)
        .map_err(anyhow::Error::new)?;
    info!(guild = guild_id, seq = event.seq, "checkpoint published");
    Ok(true)
}

/// One checkpoint pass over every known guild
pub async fn run_checkpoints(engine: &SequencingEngine, relay: &KeyPair, now_ms: u64) {
    let guild_ids = match engine.store().get_guild_ids() {
        Ok(ids) => ids,
        Err(e) => {
            warn!("checkpoint: guild enumeration failed: {e}");
            return;
        }
    };
    for guild_id in guild_ids {
        if let Err(e) = checkpoint_guild(engine, relay, &guild_id, now_ms).await {
            warn!(guild = %guild_id, "checkpoint failed: {e}");
        }
    }
}

/// Spawn both periodic loops; they stop on the shutdown signal
pub fn spawn_retention_tasks(
    engine: Arc<SequencingEngine>,
    relay: Arc<KeyPair>,
    shutdown_tx: &broadcast::Sender<()>,
) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
    let prune_engine = engine.clone();
    let mut prune_shutdown = shutdown_tx.subscribe();
    let prune = tokio::spawn(async move {
        let mut ticker = interval(RETENTION_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => run_prune(&prune_engine, now_ms()).await,
                _ = prune_shutdown.recv() => break,
            }
        }
    });

    let mut checkpoint_shutdown = shutdown_tx.subscribe();
    let checkpoint = tokio::spawn(async move {
        let mut ticker = interval(RETENTION_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => run_checkpoints(&engine, &relay, now_ms()).await,
                _ = checkpoint_shutdown.recv() => break,
            }
        }
    });

    (prune, checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;
    use crate::subscriptions::SubscriptionRegistry;
    use guildlog_core::event::{
        build_genesis, derive_channel_id, validate_chain_pruned, ChannelKind, GuildAccess,
        RetentionMode,
    };
    use guildlog_core::state::{reduce_log, state_from_checkpoint, verify_checkpoint};

    fn engine() -> Arc<SequencingEngine> {
        Arc::new(SequencingEngine::new(
            Arc::new(MemoryLogStore::new()),
            Arc::new(SubscriptionRegistry::new()),
        ))
    }

    async fn guild_with_ttl_channel(
        engine: &SequencingEngine,
        kp: &KeyPair,
        retention: Option<Retention>,
    ) -> (String, String) {
        let (guild_id, body, signature) =
            build_genesis(kp, "g", None, GuildAccess::Public, 1_000).unwrap();
        engine
            .publish(Publish { body, author: kp.user_id(), signature, created_at: 1_000 })
            .await
            .unwrap();
        let channel_id =
            derive_channel_id(&guild_id, "general", ChannelKind::EphemeralText, "s").unwrap();
        let body = EventBody::ChannelCreate {
            guild_id: guild_id.clone(),
            channel_id: channel_id.clone(),
            name: "general".into(),
            kind: ChannelKind::EphemeralText,
            retention,
        };
        engine
            .publish(Publish::signed(kp, body, 1_100).unwrap())
            .await
            .unwrap();
        (guild_id, channel_id)
    }

    async fn post_message(
        engine: &SequencingEngine,
        kp: &KeyPair,
        guild_id: &str,
        channel_id: &str,
        message_id: &str,
        created_at: u64,
    ) {
        let body = EventBody::Message {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            message_id: message_id.into(),
            content: "hello".into(),
            reply_to: None,
        };
        engine
            .publish(Publish::signed(kp, body, created_at).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ttl_prune_removes_only_expired_messages() {
        let engine = engine();
        let kp = KeyPair::generate();
        let retention = Retention {
            mode: RetentionMode::Ttl,
            days: None,
            seconds: Some(1),
        };
        let (guild_id, channel_id) =
            guild_with_ttl_channel(&engine, &kp, Some(retention)).await;

        post_message(&engine, &kp, &guild_id, &channel_id, "old", 2_000).await;
        post_message(&engine, &kp, &guild_id, &channel_id, "fresh", 10_000).await;

        // 1.5s after the first message: past its 1s ttl, fresh survives
        let deleted = prune_guild(&engine, &guild_id, 3_500).unwrap();
        assert_eq!(deleted, 1);

        let log = engine.store().get_log(&guild_id).unwrap();
        assert_eq!(log.len(), 3);
        assert!(log.iter().any(|e| matches!(
            &e.body,
            EventBody::Message { message_id, .. } if message_id == "fresh"
        )));
        // GUILD_CREATE and CHANNEL_CREATE remain
        assert!(matches!(log[0].body, EventBody::GuildCreate { .. }));
        assert!(matches!(log[1].body, EventBody::ChannelCreate { .. }));
        validate_chain_pruned(&log).unwrap();
    }

    #[tokio::test]
    async fn rolling_window_uses_days() {
        let engine = engine();
        let kp = KeyPair::generate();
        let retention = Retention {
            mode: RetentionMode::RollingWindow,
            days: Some(1),
            seconds: None,
        };
        let (guild_id, channel_id) =
            guild_with_ttl_channel(&engine, &kp, Some(retention)).await;

        post_message(&engine, &kp, &guild_id, &channel_id, "m", 2_000).await;

        // within the window
        assert_eq!(prune_guild(&engine, &guild_id, 86_400_000).unwrap(), 0);
        // one day plus a bit later
        assert_eq!(prune_guild(&engine, &guild_id, 86_500_000 + 2_000).unwrap(), 1);
    }

    #[tokio::test]
    async fn infinite_retention_never_prunes() {
        let engine = engine();
        let kp = KeyPair::generate();
        let (guild_id, channel_id) = guild_with_ttl_channel(&engine, &kp, None).await;
        post_message(&engine, &kp, &guild_id, &channel_id, "m", 2_000).await;
        assert_eq!(prune_guild(&engine, &guild_id, u64::MAX / 2).unwrap(), 0);
        assert_eq!(engine.store().get_log(&guild_id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn checkpoint_roundtrips_through_reducer() {
        let engine = engine();
        let relay = KeyPair::generate();
        let kp = KeyPair::generate();
        let (guild_id, channel_id) = guild_with_ttl_channel(&engine, &kp, None).await;
        post_message(&engine, &kp, &guild_id, &channel_id, "m1", 2_000).await;

        let emitted = checkpoint_guild(&engine, &relay, &guild_id, 9_000)
            .await
            .unwrap();
        assert!(emitted);

        let log = engine.store().get_log(&guild_id).unwrap();
        let checkpoint = log.last().unwrap();
        assert!(matches!(checkpoint.body, EventBody::Checkpoint { .. }));
        verify_checkpoint(checkpoint, &relay.user_id()).unwrap();

        // a fresh reducer seeded from the snapshot equals the full fold
        let seeded = state_from_checkpoint(checkpoint).unwrap();
        let folded = reduce_log(&log).unwrap();
        assert_eq!(seeded, folded);

        // a second pass is a no-op: the log already ends in a checkpoint
        let emitted = checkpoint_guild(&engine, &relay, &guild_id, 9_100)
            .await
            .unwrap();
        assert!(!emitted);
    }

    #[tokio::test]
    async fn checkpoint_skips_empty_guilds() {
        let engine = engine();
        let relay = KeyPair::generate();
        assert!(!checkpoint_guild(&engine, &relay, "unknown", 1_000)
            .await
            .unwrap());
    }
}
