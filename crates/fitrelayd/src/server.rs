//! Connection & Protocol Engine (C7): accepts WebSocket connections, runs
//! one task per connection, and drives the PUBLISH/SUBSCRIBE/UNSUBSCRIBE
//! state machine over the wire protocol in `wire.rs`.
//!
//! Each connection task owns its read loop, its outbound queue, and its
//! slice of the Subscription Registry's label map; connection tasks never
//! share mutable state directly (per-connection `mpsc` channel, shared
//! only through `Arc`-held collaborators). Shape grounded on the teacher's
//! `Server` composition root (`tokio::select!` accept loop, background
//! task spawning, broadcast-channel shutdown) and on the pack's
//! `bio-bridge::handle_client` per-connection read/write `tokio::select!`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fitrelay_core::{privacy, Event};
use fitrelay_net::KeyPair;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::admin::{self, AdminState};
use crate::config::{Config, NodeState};
use crate::expiry;
use crate::forward;
use crate::query::QueryEngine;
use crate::satellite::SatelliteRegistry;
use crate::storage::Storage;
use crate::subscriptions::{ConnectionId, SubscriptionRegistry};
use crate::synth;
use crate::wire::{parse_client_message, ClientMessage, ServerMessage, WireError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("bind failed on {0}")]
    BindFailed(SocketAddr),
}

/// The relay's composition root: every shared collaborator is constructed
/// here and handed to connection tasks and background tasks as `Arc`s.
pub struct Server {
    config: Config,
    identity: KeyPair,
    storage: Arc<Storage>,
    satellites: Arc<SatelliteRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    http_client: reqwest::Client,
    next_connection_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(Storage::open(&config.database_url)?);
        let identity = load_or_generate_identity(&config, &storage)?;

        let satellites = Arc::new(SatelliteRegistry::new());
        satellites.load_from_storage(&storage)?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            identity,
            storage,
            satellites,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            http_client: reqwest::Client::new(),
            next_connection_id: AtomicU64::new(1),
            shutdown_tx,
        })
    }

    pub fn identity_pubkey(&self) -> String {
        self.identity.public_key_hex()
    }

    /// Run the WebSocket listener, the admin HTTP surface, and the expiry
    /// sweeper until a shutdown signal arrives.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        info!(listen = %self.config.listen_address, "starting fitrelayd");

        let admin_state = Arc::new(AdminState {
            config: self.config.clone(),
            storage: self.storage.clone(),
            satellites: self.satellites.clone(),
            identity_pubkey: self.identity_pubkey(),
        });
        let http_listen = self.config.http_listen_address;
        let admin_handle = tokio::spawn(async move {
            if let Err(e) = admin::serve(admin_state, http_listen).await {
                error!(error = %e, "admin HTTP surface failed");
            }
        });

        let expiry_handle = expiry::spawn(
            self.storage.clone(),
            self.config.expiry_sweep_interval_seconds,
            self.shutdown_tx.subscribe(),
        );

        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|_| ServerError::BindFailed(self.config.listen_address))?;
        info!(addr = %self.config.listen_address, "WebSocket listener bound");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    warn!(%addr, error = %e, "connection task ended with an error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        admin_handle.abort();
        expiry_handle.abort();
        self.storage.flush()?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let id: ConnectionId = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%addr, error = %e, "websocket handshake failed");
                return Ok(());
            }
        };
        debug!(%addr, connection_id = id, "accepted connection");
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(self.config.max_outbound_queue);
        let overflowed = self.subscriptions.register_connection(id, tx.clone());

        // A live EVENT frame is never shed per §4.7; when `fan_out` can't
        // enqueue one it flags `overflowed` instead. This ticks the flag
        // between selects so a connection that's gone quiet on reads still
        // gets torn down promptly rather than only on its next inbound poll.
        let mut overflow_check = tokio::time::interval(Duration::from_millis(200));

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_frame(id, &tx, &text).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(connection_id = id, error = %e, "websocket read error");
                            break;
                        }
                    }
                }
                outbound = rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = overflow_check.tick() => {
                    if overflowed.load(Ordering::Relaxed) {
                        warn!(connection_id = id, "closing connection after a live event was dropped");
                        let _ = sink.send(Message::Text(
                            ServerMessage::Notice {
                                message: "outbound queue overflow: closing connection".to_string(),
                            }
                            .to_frame(),
                        )).await;
                        break;
                    }
                }
            }
        }

        self.subscriptions.remove_connection(id);
        debug!(connection_id = id, "connection closed");
        Ok(())
    }

    /// Handle one inbound text frame. Returns `false` when the caller
    /// should tear the connection down (outbound queue overflow past
    /// shedding, per the back-pressure policy in `send_direct`).
    async fn handle_frame(&self, id: ConnectionId, tx: &mpsc::Sender<String>, text: &str) -> bool {
        match parse_client_message(text) {
            Ok(ClientMessage::Publish(event)) => {
                let (event_id, ok, message) = self.handle_publish(id, event).await;
                self.send_direct(
                    tx,
                    ServerMessage::Acceptance {
                        id: event_id,
                        ok,
                        message,
                    },
                )
            }
            Ok(ClientMessage::Subscribe { label, filters }) => {
                let engine = QueryEngine::new(&self.storage, self.config.max_query_limit);
                let backlog = match engine.resolve(&filters) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(connection_id = id, error = %e, "query engine failure");
                        Vec::new()
                    }
                };
                self.subscriptions.subscribe(id, &label, filters);
                let _ = self.subscriptions.send_backlog(id, &label, backlog).await;
                true
            }
            Ok(ClientMessage::Unsubscribe { label }) => {
                self.subscriptions.unsubscribe(id, &label);
                true
            }
            Err(WireError::UnknownCommand(cmd)) => self.send_direct(
                tx,
                ServerMessage::Notice {
                    message: format!("unknown command: {cmd}"),
                },
            ),
            Err(WireError::InvalidFormat(detail)) => self.send_direct(
                tx,
                ServerMessage::Notice {
                    message: format!("invalid frame: {detail}"),
                },
            ),
        }
    }

    /// Direct (non-backlog, non-live) send of an ACCEPTANCE or NOTICE
    /// frame. These frames aren't subject to backlog shedding, so an
    /// overflow here means the client has stopped draining its queue —
    /// the connection is closed with a best-effort final NOTICE.
    fn send_direct(&self, tx: &mpsc::Sender<String>, message: ServerMessage) -> bool {
        if tx.try_send(message.to_frame()).is_err() {
            warn!("outbound queue saturated past shedding, closing connection");
            let _ = tx.try_send(
                ServerMessage::Notice {
                    message: "outbound queue overflow".into(),
                }
                .to_frame(),
            );
            return false;
        }
        true
    }

    /// `PUBLISH(event) -> C1 -> C2` per §4.7: validate, then on
    /// PUBLIC/LIMITED store and live-match; on PRIVATE hand off to
    /// satellite routing.
    async fn handle_publish(
        &self,
        connection_id: ConnectionId,
        event: Event,
    ) -> (String, bool, String) {
        let now = crate::now_unix();

        if let Err(e) = event.validate(now, self.config.clock_skew_future_seconds) {
            return (
                event.id.clone(),
                false,
                format!("invalid: {}", describe_validation_error(&e)),
            );
        }

        match self.storage.has_event(&event.id) {
            Ok(true) => return (event.id.clone(), true, "duplicate".to_string()),
            Ok(false) => {}
            Err(e) => return (event.id.clone(), false, format!("store error: {e}")),
        }

        match privacy::classify(&event) {
            privacy::PrivacyLevel::Public | privacy::PrivacyLevel::Limited => {
                if let Err(e) = self.storage.put_event(&event) {
                    return (event.id.clone(), false, format!("store error: {e}"));
                }
                self.subscriptions.fan_out(&event);
                (event.id.clone(), true, String::new())
            }
            privacy::PrivacyLevel::Private => {
                self.handle_private_publish(connection_id, event, now)
            }
        }
    }

    /// PRIVATE routing: find a live satellite, synthesize and store the
    /// public pointer, and forward the original asynchronously. Falls
    /// back to storing the original locally when no satellite is live.
    fn handle_private_publish(
        &self,
        connection_id: ConnectionId,
        event: Event,
        now: i64,
    ) -> (String, bool, String) {
        let pinned = event.first_tag_value("blossom");
        let node = self.satellites.route(
            event.kind,
            pinned,
            now,
            self.config.satellite_liveness_seconds,
        );

        let Some(node) = node else {
            return match self.storage.put_event(&event) {
                Ok(()) => {
                    self.subscriptions.fan_out(&event);
                    (
                        event.id.clone(),
                        true,
                        "no satellite available for this kind; stored locally".to_string(),
                    )
                }
                Err(e) => (event.id.clone(), false, format!("store error: {e}")),
            };
        };

        let reference =
            match synth::synthesize_reference(&event, &node.pubkey, &node.url, &self.identity, now)
            {
                Ok(r) => r,
                Err(e) => {
                    return (
                        event.id.clone(),
                        false,
                        format!("reference synthesis failed: {e}"),
                    )
                }
            };

        if let Err(e) = self.storage.put_event(&reference) {
            return (event.id.clone(), false, format!("store error: {e}"));
        }
        self.subscriptions.fan_out(&reference);

        let client = self.http_client.clone();
        let subscriptions = self.subscriptions.clone();
        let forward_url = format!("{}/events", node.url.trim_end_matches('/'));
        let ceiling = Duration::from_secs(self.config.forward_retry_ceiling_seconds);
        let original = event.clone();
        tokio::spawn(async move {
            if forward::forward_with_retry(&client, &forward_url, &original, ceiling)
                .await
                .is_err()
            {
                subscriptions.notify(
                    connection_id,
                    &format!(
                        "failed to forward event {} to satellite after retrying",
                        original.id
                    ),
                );
            }
        });

        (event.id.clone(), true, String::new())
    }
}

/// Resolve the relay's reference-event signing identity: an explicit
/// `server_identity_seed` wins and is (re-)persisted; otherwise reuse
/// whatever was persisted on a prior start; otherwise mint a fresh one
/// and persist it so the next restart keeps the same pubkey, mirroring
/// the teacher's `NodeState`-persisted-keypair pattern.
fn load_or_generate_identity(config: &Config, storage: &Storage) -> Result<KeyPair, ServerError> {
    if let Some(hex_seed) = &config.server_identity_seed {
        let bytes = hex::decode(hex_seed).expect("server_identity_seed validated at startup");
        let seed: [u8; 32] = bytes
            .try_into()
            .expect("server_identity_seed validated at startup");
        storage.put_identity_seed(&seed)?;
        return Ok(KeyPair::from_seed(&seed));
    }

    if let Some(seed) = storage.get_identity_seed()? {
        return Ok(KeyPair::from_seed(&seed));
    }

    let node_state = NodeState::generate();
    storage.put_identity_seed(&node_state.identity_seed)?;
    Ok(KeyPair::from_seed(&node_state.identity_seed))
}

fn describe_validation_error(e: &fitrelay_core::Error) -> &'static str {
    match e {
        fitrelay_core::Error::InvalidFormat(_) => "malformed event",
        fitrelay_core::Error::InvalidId { .. } => "id mismatch",
        fitrelay_core::Error::InvalidSig => "signature does not verify",
        fitrelay_core::Error::UnsupportedKind(_) => "unsupported kind",
        fitrelay_core::Error::ClockSkew { .. } => "created_at too far in the future",
        fitrelay_core::Error::Canonicalization(_) => "malformed event",
        fitrelay_core::Error::InvalidPublicKey(_) => "malformed event",
    }
}
