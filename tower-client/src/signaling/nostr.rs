//! WebSocket relay speaking the signed-event protocol.
//!
//! Subscriptions are `REQ` frames filtered by topic tag, kind and `since`;
//! publishes are `EVENT` frames signed with a per-connection key. Inbound
//! events are verified before delivery, and a `retry-after=<secs>` hint in
//! `OK` or `NOTICE` frames is handed back to the next publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tower_types::relay::{parse_retry_after, ClientMessage, EventSigner, Filter, RelayMessage};
use tracing::{debug, info, warn};

use super::{unix_now, InboundSink, Inbound, SignalingError, SignalingTransport, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Connection {
    Connecting,
    Open,
    Failed(String),
    Closed,
}

struct Subscription {
    topic: String,
    sink: InboundSink,
}

#[derive(Default)]
struct Shared {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    interval_hint: Mutex<Option<Duration>>,
}

/// A relay connection over WebSocket.
pub struct NostrRelay {
    url: String,
    signer: EventSigner,
    outgoing: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<Connection>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NostrRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NostrRelay")
            .field("url", &self.url)
            .field("pubkey", &self.signer.public_key())
            .finish()
    }
}

impl NostrRelay {
    /// Start connecting to `url`. Await [`SignalingTransport::ready`] before use.
    pub fn connect(url: impl Into<String>) -> Result<Self, SignalingError> {
        let url = url.into();
        let signer =
            EventSigner::generate().map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(Connection::Connecting);
        let shared = Arc::new(Shared::default());

        tokio::spawn(run(url.clone(), outgoing_rx, state_tx, shared.clone()));

        Ok(Self {
            url,
            signer,
            outgoing,
            state,
            shared,
        })
    }

    fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if *self.state.borrow() != Connection::Open {
            return Err(SignalingError::NotConnected);
        }
        self.outgoing
            .send(Message::Text(message.to_json().into()))
            .map_err(|_| SignalingError::NotConnected)
    }
}

async fn run(
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    state: watch::Sender<Connection>,
    shared: Arc<Shared>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("relay {} connection failed: {}", url, e);
            let _ = state.send(Connection::Failed(e.to_string()));
            return;
        }
    };
    info!("connected to relay {}", url);
    let _ = state.send(Connection::Open);

    let (mut writer, mut reader) = ws.split();
    loop {
        tokio::select! {
            out = outgoing.recv() => {
                let Some(message) = out else {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = writer.send(message).await {
                    warn!("relay {} write failed: {}", url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_frame(&url, &shared, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => {
                    info!("relay {} closed the connection", url);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay {} read failed: {}", url, e);
                    break;
                }
            }
        }
    }

    let _ = state.send(Connection::Closed);
}

async fn record_hint(shared: &Shared, message: &str) {
    if let Some(secs) = parse_retry_after(message) {
        *shared.interval_hint.lock().await = Some(Duration::from_secs(secs));
    }
}

async fn handle_frame(url: &str, shared: &Shared, text: &str) {
    let message = match RelayMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("relay {} sent an unreadable frame: {}", url, e);
            return;
        }
    };

    match message {
        RelayMessage::Event { sub_id, event } => {
            if let Err(e) = event.verify() {
                warn!("relay {} delivered an invalid event: {}", url, e);
                return;
            }
            let subscriptions = shared.subscriptions.lock().await;
            let Some(sub) = subscriptions.get(&sub_id) else {
                debug!("relay {} event for unknown subscription {}", url, sub_id);
                return;
            };
            if event.topic() != Some(sub.topic.as_str()) {
                debug!("relay {} event outside subscription topic", url);
                return;
            }
            let _ = sub.sink.send(Inbound {
                topic: sub.topic.clone(),
                content: event.content,
            });
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if !accepted {
                warn!("relay {} rejected event {}: {}", url, event_id, message);
            }
            record_hint(shared, &message).await;
        }
        RelayMessage::Notice(message) => {
            debug!("relay {} notice: {}", url, message);
            record_hint(shared, &message).await;
        }
        RelayMessage::Closed { sub_id, message } => {
            warn!("relay {} closed subscription {}: {}", url, sub_id, message);
            shared.subscriptions.lock().await.remove(&sub_id);
        }
        RelayMessage::Eose { sub_id } => {
            debug!("relay {} end of stored events for {}", url, sub_id);
        }
    }
}

#[async_trait]
impl SignalingTransport for NostrRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn ready(&self) -> Result<(), SignalingError> {
        let mut state = self.state.clone();
        let outcome = match state.wait_for(|s| *s != Connection::Connecting).await {
            Ok(s) => s.clone(),
            Err(_) => return Err(SignalingError::NotConnected),
        };
        match outcome {
            Connection::Open => Ok(()),
            Connection::Failed(e) => Err(SignalingError::ConnectionFailed(e)),
            Connection::Connecting | Connection::Closed => Err(SignalingError::NotConnected),
        }
    }

    async fn subscribe(&self, topic: &str, sink: InboundSink) -> Result<SubscriptionId, SignalingError> {
        let sub_id = uuid::Uuid::now_v7().simple().to_string();
        self.shared.subscriptions.lock().await.insert(
            sub_id.clone(),
            Subscription {
                topic: topic.to_owned(),
                sink,
            },
        );

        let req = ClientMessage::Req {
            sub_id: sub_id.clone(),
            filter: Filter::topic(topic, unix_now()),
        };
        if let Err(e) = self.send(req) {
            self.shared.subscriptions.lock().await.remove(&sub_id);
            return Err(e);
        }
        Ok(SubscriptionId(sub_id))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), SignalingError> {
        if self.shared.subscriptions.lock().await.remove(&id.0).is_none() {
            return Ok(());
        }
        self.send(ClientMessage::Close { sub_id: id.0.clone() })
    }

    async fn publish(&self, topic: &str, content: &str) -> Result<Option<Duration>, SignalingError> {
        let event = self.signer.sign(topic, content, unix_now());
        self.send(ClientMessage::Event(event))?;
        Ok(self.shared.interval_hint.lock().await.take())
    }

    async fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}
