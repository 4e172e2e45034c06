//! Relay client transport
//!
//! One WebSocket connection per configured relay, with exponential
//! backoff on reconnect (base 1 s, cap 30 s, doubled per failure).
//! Inbound frames feed the shared [`Replica`]; applied events are
//! gossip-forwarded to every registered peer socket except the sender.

use crate::frame::{Frame, Hello, Publish, Sub, PROTOCOL};
use crate::replica::{Inbound, Replica};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Client transport errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("frame error: {0}")]
    Frame(#[from] crate::frame::FrameError),
    #[error("connection closed")]
    Closed,
}

/// Reconnect backoff: base 1 s, cap 30 s, doubled per failure
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub const BASE: Duration = Duration::from_secs(1);
    pub const CAP: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self { current: Self::BASE }
    }

    /// Delay to sleep before the next attempt; doubles for the one after
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::CAP);
        delay
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.current = Self::BASE;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifier for a registered peer socket
pub type PeerId = u64;

/// Registry of peer sockets for gossip fan-out
#[derive(Default)]
pub struct PeerGossip {
    peers: SyncMutex<HashMap<PeerId, mpsc::Sender<String>>>,
    next_id: SyncMutex<PeerId>,
}

impl PeerGossip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer's outbound queue
    pub fn register(&self, sender: mpsc::Sender<String>) -> PeerId {
        let mut next = self.next_id.lock();
        let id = *next;
        *next += 1;
        self.peers.lock().insert(id, sender);
        id
    }

    pub fn unregister(&self, id: PeerId) {
        self.peers.lock().remove(&id);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Forward a raw frame to every open peer except the sender.
    /// Delivery is best-effort; full or closed queues drop the frame.
    pub fn forward(&self, from: Option<PeerId>, text: &str) {
        let peers = self.peers.lock();
        for (id, sender) in peers.iter() {
            if Some(*id) == from {
                continue;
            }
            if sender.try_send(text.to_string()).is_err() {
                debug!(peer = id, "gossip frame dropped");
            }
        }
    }
}

/// A relay connection manager for one client identity
pub struct RelayClient {
    url: String,
    replica: Arc<Mutex<Replica>>,
    gossip: Arc<PeerGossip>,
    guilds: Vec<String>,
    client_name: Option<String>,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, replica: Arc<Mutex<Replica>>) -> Self {
        Self {
            url: url.into(),
            replica,
            gossip: Arc::new(PeerGossip::new()),
            guilds: Vec::new(),
            client_name: None,
        }
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Gossip registry shared with peer-serving code
    pub fn gossip(&self) -> Arc<PeerGossip> {
        self.gossip.clone()
    }

    /// Add a guild to subscribe to on every (re)connect
    pub fn subscribe_guild(&mut self, guild_id: impl Into<String>) {
        self.guilds.push(guild_id.into());
    }

    /// Run the connection loop until the task is dropped. Each session
    /// sends HELLO, re-subscribes, then feeds inbound frames into the
    /// replica. Transport failures retransmit nothing; publishing is the
    /// caller's responsibility to retry.
    pub async fn run(self, mut outbound: mpsc::Receiver<Publish>) {
        let mut backoff = Backoff::new();
        loop {
            match connect_async(&self.url).await {
                Ok((stream, _)) => {
                    backoff.reset();
                    info!(url = %self.url, "connected to relay");
                    if let Err(e) = self.session(stream, &mut outbound).await {
                        warn!(url = %self.url, "relay session ended: {e}");
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, "relay connect failed: {e}");
                }
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        outbound: &mut mpsc::Receiver<Publish>,
    ) -> Result<(), ClientError> {
        let (mut sink, mut read) = stream.split();

        let hello = Frame::Hello(Hello {
            protocol: PROTOCOL.into(),
            client_name: self.client_name.clone(),
            client_version: Some(env!("CARGO_PKG_VERSION").into()),
        });
        sink.send(Message::Text(hello.to_text()?))
            .await
            .map_err(|_| ClientError::Closed)?;

        for (i, guild_id) in self.guilds.iter().enumerate() {
            let sub = Frame::Sub(Sub {
                sub_id: format!("sub-{i}"),
                guild_id: guild_id.clone(),
                channels: None,
                from_seq: None,
                limit: None,
            });
            sink.send(Message::Text(sub.to_text()?))
                .await
                .map_err(|_| ClientError::Closed)?;
        }

        loop {
            tokio::select! {
                publish = outbound.recv() => {
                    let Some(publish) = publish else { return Ok(()) };
                    let text = Frame::Publish(publish).to_text()?;
                    sink.send(Message::Text(text)).await.map_err(|_| ClientError::Closed)?;
                }
                message = read.next() => {
                    let Some(message) = message else { return Err(ClientError::Closed) };
                    match message {
                        Ok(Message::Text(text)) => self.handle_text(&text).await,
                        Ok(Message::Close(_)) => return Err(ClientError::Closed),
                        Ok(_) => {}
                        Err(_) => return Err(ClientError::Closed),
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        let frame = match Frame::from_text(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("unparseable frame from relay: {e}");
                return;
            }
        };
        match frame {
            Frame::Event(event) => {
                let outcome = self.replica.lock().await.handle_event(*event);
                if outcome == Inbound::Applied {
                    self.gossip.forward(None, text);
                }
            }
            Frame::Snapshot(snapshot) => {
                let mut replica = self.replica.lock().await;
                if let Err(e) =
                    replica.handle_snapshot(&snapshot.guild_id, &snapshot.events)
                {
                    warn!(guild = %snapshot.guild_id, "snapshot rejected: {e}");
                }
            }
            Frame::HelloOk(ok) => {
                debug!(relay = ?ok.relay_name, protocol = %ok.protocol, "relay greeted");
            }
            Frame::Error(err) => {
                warn!(code = ?err.code, "relay error: {}", err.message);
            }
            other => {
                debug!(kind = other.kind(), "ignoring unexpected frame from relay");
            }
        }
    }
}

/// Drive one peer WebSocket in P2P mode: inbound EVENT frames feed the
/// replica and, when applied, are gossiped onward to the other peers.
pub async fn run_peer<S>(
    stream: WebSocketStream<S>,
    replica: Arc<Mutex<Replica>>,
    gossip: Arc<PeerGossip>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut read) = stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let peer_id = gossip.register(tx);

    loop {
        tokio::select! {
            queued = rx.recv() => {
                let Some(text) = queued else { break };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = read.next() => {
                let Some(Ok(message)) = message else { break };
                let Message::Text(text) = message else { continue };
                let Ok(Frame::Event(event)) = Frame::from_text(&text) else { continue };
                let outcome = replica.lock().await.handle_event(*event);
                if outcome == Inbound::Applied {
                    gossip.forward(Some(peer_id), &text);
                }
            }
        }
    }
    gossip.unregister(peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(16));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn gossip_skips_sender() {
        let gossip = PeerGossip::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = gossip.register(tx_a);
        let _b = gossip.register(tx_b);

        gossip.forward(Some(a), "frame");
        assert_eq!(rx_b.recv().await.unwrap(), "frame");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn gossip_drops_on_full_queue() {
        let gossip = PeerGossip::new();
        let (tx, mut rx) = mpsc::channel(1);
        gossip.register(tx);
        gossip.forward(None, "one");
        gossip.forward(None, "two"); // dropped, queue full
        assert_eq!(rx.recv().await.unwrap(), "one");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_peer() {
        let gossip = PeerGossip::new();
        let (tx, _rx) = mpsc::channel(1);
        let id = gossip.register(tx);
        assert_eq!(gossip.peer_count(), 1);
        gossip.unregister(id);
        assert_eq!(gossip.peer_count(), 0);
    }
}
