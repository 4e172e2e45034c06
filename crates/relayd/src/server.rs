//! Relay server loop
//!
//! One task per connected WebSocket reads frames; frame handling is
//! serialized per socket by that read loop. Outbound frames go through a
//! per-socket queue drained by a writer task, so a SNAPSHOT and the live
//! EVENTs that follow it arrive in order. A panic during one ingest is
//! caught and surfaced as INTERNAL_ERROR without tearing down the
//! socket or the engine.

use crate::config::Config;
use crate::engine::SequencingEngine;
use crate::retention::spawn_retention_tasks;
use crate::storage::{LogStore, MemoryLogStore, SledLogStore};
use crate::subscriptions::{SubEntry, SubscriptionRegistry};
use futures_util::{FutureExt, SinkExt, StreamExt};
use guildlog_core::crypto::KeyPair;
use guildlog_net::frame::{
    error_frame, ErrorCode, Frame, HelloOk, Snapshot, PROTOCOL,
};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Metadata key for the persisted relay identity seed
const RELAY_SEED_KEY: &str = "relay-seed";

/// Relay server state
pub struct RelayServer {
    config: Config,
    listener: TcpListener,
    engine: Arc<SequencingEngine>,
    subs: Arc<SubscriptionRegistry>,
    keypair: Arc<KeyPair>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Open storage, load or create the relay identity, and bind the
    /// listen socket.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let (store, keypair): (Arc<dyn LogStore>, KeyPair) = if config.memory {
            (Arc::new(MemoryLogStore::new()), KeyPair::generate())
        } else {
            let store = SledLogStore::open(&config.db)?;
            let keypair = match store.get_metadata(RELAY_SEED_KEY)? {
                Some(seed) if seed.len() == 32 => {
                    let mut bytes = [0u8; 32];
                    bytes.copy_from_slice(&seed);
                    KeyPair::from_seed(&bytes)?
                }
                _ => {
                    let keypair = KeyPair::generate();
                    store.put_metadata(RELAY_SEED_KEY, &keypair.to_seed())?;
                    keypair
                }
            };
            (Arc::new(store), keypair)
        };

        let subs = Arc::new(SubscriptionRegistry::new());
        let engine = Arc::new(SequencingEngine::new(store, subs.clone()));
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            listener,
            engine,
            subs,
            keypair: Arc::new(keypair),
            shutdown_tx,
        })
    }

    /// Bound address (useful with port 0)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Relay author identity used for checkpoints
    pub fn relay_user_id(&self) -> String {
        self.keypair.user_id()
    }

    /// Shared sequencing engine handle
    pub fn engine(&self) -> Arc<SequencingEngine> {
        self.engine.clone()
    }

    /// Relay keypair, the author of this relay's checkpoints
    pub fn keypair(&self) -> Arc<KeyPair> {
        self.keypair.clone()
    }

    /// Handle for requesting shutdown
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept connections until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            port = self.local_addr()?.port(),
            relay = %self.relay_user_id(),
            "relayd listening"
        );

        let (_prune, _checkpoint) =
            spawn_retention_tasks(self.engine.clone(), self.keypair.clone(), &self.shutdown_tx);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let engine = self.engine.clone();
                            let subs = self.subs.clone();
                            let relay_name = self.config.relay_name.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_socket(stream, addr, engine, subs, relay_name).await
                                {
                                    debug!(%addr, "connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => error!("accept error: {e}"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        self.engine.store().close()?;
        Ok(())
    }
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<SequencingEngine>,
    subs: Arc<SubscriptionRegistry>,
    relay_name: String,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut read) = ws.split();

    let (tx, mut rx) = mpsc::channel::<String>(256);
    let socket_id = subs.register(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&engine, &subs, socket_id, &tx, &relay_name, &text).await;
            }
            Ok(Message::Binary(_)) => {
                send(&tx, error_frame(ErrorCode::InvalidFrame, "text frames only")).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%addr, "read error: {e}");
                break;
            }
        }
    }

    subs.unregister(socket_id);
    writer.abort();
    Ok(())
}

async fn send(tx: &mpsc::Sender<String>, frame: Frame) {
    match frame.to_text() {
        Ok(text) => {
            let _ = tx.send(text).await;
        }
        Err(e) => warn!("frame encode failed: {e}"),
    }
}

async fn handle_frame(
    engine: &Arc<SequencingEngine>,
    subs: &Arc<SubscriptionRegistry>,
    socket_id: u64,
    tx: &mpsc::Sender<String>,
    relay_name: &str,
    text: &str,
) {
    let frame = match Frame::from_text(text) {
        Ok(frame) => frame,
        Err(e) => {
            send(tx, error_frame(ErrorCode::InvalidFrame, e.to_string())).await;
            return;
        }
    };

    match frame {
        Frame::Hello(hello) => {
            if hello.protocol != PROTOCOL {
                send(
                    tx,
                    error_frame(
                        ErrorCode::UnsupportedProtocol,
                        format!("unsupported protocol {}", hello.protocol),
                    ),
                )
                .await;
                return;
            }
            send(
                tx,
                Frame::HelloOk(HelloOk {
                    protocol: PROTOCOL.into(),
                    relay_name: Some(relay_name.to_string()),
                    relay_version: Some(env!("CARGO_PKG_VERSION").into()),
                    features: None,
                }),
            )
            .await;
        }
        Frame::Sub(sub) => {
            // Hold the guild lock across snapshot + registration so no
            // broadcast can slip between the log read and the sub.
            let lock = engine.guild_lock(&sub.guild_id);
            let _guard = lock.lock().await;
            let mut events = match engine.store().get_log(&sub.guild_id) {
                Ok(events) => events,
                Err(e) => {
                    warn!(guild = %sub.guild_id, "snapshot read failed: {e}");
                    send(tx, error_frame(ErrorCode::InternalError, "snapshot read failed"))
                        .await;
                    return;
                }
            };
            if let Some(from_seq) = sub.from_seq {
                events.retain(|e| e.seq >= from_seq);
            }
            if let Some(limit) = sub.limit {
                events.truncate(limit as usize);
            }
            let end_seq = events.last().map(|e| e.seq);
            send(
                tx,
                Frame::Snapshot(Snapshot {
                    sub_id: sub.sub_id.clone(),
                    guild_id: sub.guild_id.clone(),
                    events,
                    end_seq,
                }),
            )
            .await;
            subs.subscribe(
                socket_id,
                sub.sub_id,
                SubEntry { guild_id: sub.guild_id, channels: sub.channels },
            );
        }
        Frame::Unsub(unsub) => {
            subs.unsubscribe(socket_id, &unsub.sub_id);
        }
        Frame::Publish(publish) => {
            let outcome = AssertUnwindSafe(engine.publish(publish))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(event)) => {
                    // The publisher always receives the resulting EVENT;
                    // directly if it has no matching subscription.
                    if !subs.has_guild_sub(socket_id, event.body.guild_id()) {
                        send(tx, Frame::Event(Box::new(event))).await;
                    }
                }
                Ok(Err(e)) => {
                    send(tx, error_frame(e.code(), e.to_string())).await;
                }
                Err(_) => {
                    error!("ingest panicked; engine continues");
                    send(tx, error_frame(ErrorCode::InternalError, "internal error")).await;
                }
            }
        }
        Frame::HelloOk(_) | Frame::Snapshot(_) | Frame::Event(_) | Frame::Error(_) => {
            send(
                tx,
                error_frame(ErrorCode::InvalidFrame, "server-to-client frame"),
            )
            .await;
        }
    }
}
