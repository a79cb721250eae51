//! WebSocket relay server.
//!
//! Every connection gets an id and an outgoing queue. Subscriptions are kept
//! per `(connection, subscription id)`; a verified event is fanned out to
//! every subscription whose filter matches, including the publisher's own.
//! Nothing is stored: events published before a subscription are never
//! delivered to it.

use crate::config::{Config, LimitsConfig};
use crate::error::Result;
use crate::limits::{RateLimitError, RateLimits};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tower_types::relay::{format_retry_after, ClientMessage, Event, Filter, RelayMessage};
use tracing::{debug, info, warn};

/// Operational counters.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Connections accepted.
    pub connections_total: AtomicU64,
    /// Events accepted and fanned out.
    pub events_accepted: AtomicU64,
    /// Events refused for a bad id or signature.
    pub events_invalid: AtomicU64,
    /// Publishes refused by the rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Event deliveries to subscribers.
    pub deliveries: AtomicU64,
}

/// Shared routing state.
#[derive(Debug)]
pub(crate) struct RelayState {
    limits: RateLimits,
    config: LimitsConfig,
    clients: DashMap<u64, mpsc::UnboundedSender<String>>,
    subscriptions: DashMap<(u64, String), Filter>,
    next_client: AtomicU64,
    stats: RelayStats,
}

impl RelayState {
    pub(crate) fn new(config: LimitsConfig) -> Self {
        Self {
            limits: RateLimits::new(&config),
            config,
            clients: DashMap::new(),
            subscriptions: DashMap::new(),
            next_client: AtomicU64::new(1),
            stats: RelayStats::default(),
        }
    }

    /// Add a connection whose outgoing frames go to `outgoing`.
    pub(crate) fn register(&self, outgoing: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        self.clients.insert(id, outgoing);
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Drop a connection and all of its subscriptions.
    pub(crate) fn unregister(&self, client: u64) {
        self.clients.remove(&client);
        self.subscriptions.retain(|(owner, _), _| *owner != client);
        self.limits.shrink();
    }

    fn subscription_count(&self, client: u64) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| entry.key().0 == client)
            .count()
    }

    /// Handle one text frame from `client`; returns the direct replies.
    pub(crate) fn handle(&self, client: u64, text: &str) -> Vec<RelayMessage> {
        if text.len() > self.config.max_message_size {
            return vec![RelayMessage::Notice(format!(
                "invalid: frame of {} bytes exceeds {}",
                text.len(),
                self.config.max_message_size
            ))];
        }

        let message = match ClientMessage::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("client {} sent an unreadable frame: {}", client, e);
                return vec![RelayMessage::Notice(format!("invalid: {}", e))];
            }
        };

        match message {
            ClientMessage::Req { sub_id, filter } => self.subscribe(client, sub_id, filter),
            ClientMessage::Close { sub_id } => {
                self.subscriptions.remove(&(client, sub_id));
                Vec::new()
            }
            ClientMessage::Event(event) => vec![self.publish(client, event)],
        }
    }

    fn subscribe(&self, client: u64, sub_id: String, filter: Filter) -> Vec<RelayMessage> {
        let key = (client, sub_id.clone());
        if !self.subscriptions.contains_key(&key)
            && self.subscription_count(client) >= self.config.max_subscriptions
        {
            return vec![RelayMessage::Closed {
                sub_id,
                message: format!(
                    "blocked: at most {} subscriptions per connection",
                    self.config.max_subscriptions
                ),
            }];
        }

        self.subscriptions.insert(key, filter);
        debug!("client {} subscribed {}", client, sub_id);
        vec![RelayMessage::Eose { sub_id }]
    }

    fn publish(&self, client: u64, event: Event) -> RelayMessage {
        if let Err(e) = event.verify() {
            self.stats.events_invalid.fetch_add(1, Ordering::Relaxed);
            warn!("client {} published invalid event {}: {}", client, event.id, e);
            return RelayMessage::Ok {
                event_id: event.id,
                accepted: false,
                message: format!("invalid: {}", e),
            };
        }

        if let Err(RateLimitError::PublishLimitExceeded { retry_after_secs }) =
            self.limits.check_publish(client)
        {
            self.stats.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            debug!("client {} rate limited for {}s", client, retry_after_secs);
            return RelayMessage::Ok {
                event_id: event.id,
                accepted: false,
                message: format_retry_after("rate-limited", retry_after_secs),
            };
        }

        let targets: Vec<(u64, String)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().matches(&event))
            .map(|entry| entry.key().clone())
            .collect();

        for (subscriber, sub_id) in targets {
            let Some(outgoing) = self.clients.get(&subscriber) else {
                continue;
            };
            let frame = RelayMessage::Event {
                sub_id,
                event: event.clone(),
            }
            .to_json();
            if outgoing.send(frame).is_ok() {
                self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.stats.events_accepted.fetch_add(1, Ordering::Relaxed);
        RelayMessage::Ok {
            event_id: event.id,
            accepted: true,
            message: String::new(),
        }
    }
}

/// The relay server.
#[derive(Debug)]
pub struct Relay {
    config: Config,
    state: Arc<RelayState>,
}

impl Relay {
    /// Create a relay from configuration.
    pub fn new(config: Config) -> Self {
        let state = Arc::new(RelayState::new(config.limits.clone()));
        Self { config, state }
    }

    /// Operational counters.
    pub fn stats(&self) -> &RelayStats {
        &self.state.stats
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        info!("relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.config.server.max_connections.max(1)));
        loop {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                return Ok(());
            };
            let (stream, addr) = listener.accept().await?;
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(state, stream, addr).await {
                    debug!("connection {} ended with error: {}", addr, e);
                }
                drop(permit);
            });
        }
    }

    /// Bind and serve.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

async fn serve_connection(state: Arc<RelayState>, stream: TcpStream, addr: SocketAddr) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut writer, mut reader) = ws.split();
    let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let client = state.register(outgoing.clone());
    debug!("client {} connected from {}", client, addr);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            if writer.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                for reply in state.handle(client, text.as_str()) {
                    let _ = outgoing.send(reply.to_json());
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("client {} read failed: {}", client, e);
                break;
            }
        }
    }

    state.unregister(client);
    drop(outgoing);
    writer_task.abort();
    debug!("client {} disconnected", client);
    Ok(())
}
