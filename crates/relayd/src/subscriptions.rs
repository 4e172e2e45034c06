//! Subscription registry
//!
//! Maps each open socket to its subscriptions (`subId -> {guildId,
//! channels?}`) and the socket's outbound queue. Mutated on
//! SUB/UNSUB/close, read by broadcast. Delivery is best-effort: a full
//! or closed queue drops the frame, and the client resynchronizes via
//! SUB when it notices the gap.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Identifier for one connected socket
pub type SocketId = u64;

/// One subscription entry
#[derive(Clone, Debug)]
pub struct SubEntry {
    pub guild_id: String,
    pub channels: Option<Vec<String>>,
}

struct SocketSubs {
    sender: mpsc::Sender<String>,
    subs: HashMap<String, SubEntry>,
}

/// Shared registry of sockets and their subscriptions
#[derive(Default)]
pub struct SubscriptionRegistry {
    sockets: RwLock<HashMap<SocketId, SocketSubs>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket's outbound queue, returning its id
    pub fn register(&self, sender: mpsc::Sender<String>) -> SocketId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets
            .write()
            .insert(id, SocketSubs { sender, subs: HashMap::new() });
        id
    }

    /// Drop a socket and all its subscriptions
    pub fn unregister(&self, socket: SocketId) {
        self.sockets.write().remove(&socket);
    }

    pub fn subscribe(&self, socket: SocketId, sub_id: String, entry: SubEntry) {
        if let Some(subs) = self.sockets.write().get_mut(&socket) {
            subs.subs.insert(sub_id, entry);
        }
    }

    pub fn unsubscribe(&self, socket: SocketId, sub_id: &str) {
        if let Some(subs) = self.sockets.write().get_mut(&socket) {
            subs.subs.remove(sub_id);
        }
    }

    /// Whether a socket has any subscription for the guild
    pub fn has_guild_sub(&self, socket: SocketId, guild_id: &str) -> bool {
        self.sockets
            .read()
            .get(&socket)
            .map(|s| s.subs.values().any(|e| e.guild_id == guild_id))
            .unwrap_or(false)
    }

    /// Enqueue a frame to every socket subscribed to the guild.
    /// Returns the number of sockets reached.
    pub fn broadcast(&self, guild_id: &str, text: &str) -> usize {
        let sockets = self.sockets.read();
        let mut reached = 0;
        for (id, socket) in sockets.iter() {
            if !socket.subs.values().any(|e| e.guild_id == guild_id) {
                continue;
            }
            if socket.sender.try_send(text.to_string()).is_ok() {
                reached += 1;
            } else {
                debug!(socket = id, guild = guild_id, "broadcast frame dropped");
            }
        }
        reached
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().len()
    }
}
