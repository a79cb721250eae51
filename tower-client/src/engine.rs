//! Operation log sync and checkpointing on top of a [`Room`].
//!
//! The engine is the only owner of the log, the materialized document, the
//! snapshot and the checkpoint votes. All of it sits behind one async mutex,
//! so every mutation (local or remote) is applied one at a time. Network
//! sends happen after the lock is released.
//!
//! Actions spoken:
//!
//! | action         | payload                       | on receipt                          |
//! |----------------|-------------------------------|-------------------------------------|
//! | `realtime`     | element event                 | apply to the document, not the log  |
//! | `send-history` | `[[key, event], ...]`         | merge into the log, rebuild         |
//! | `req-hist`     | requesting peer id            | send our log to the requester       |
//! | `propose`      | `{checkpointId, elementHash}` | vote, echo, compact, or pull        |
//!
//! Persistence is best effort: failures are logged and never undo a change.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tower_core::{should_propose, ApplyError, Document, OperationLog, ProposalOutcome, Snapshot, VoteBook};
use tower_types::{
    ActionName, CheckpointId, CheckpointProposal, ElementEvent, HistoryEntries, PeerId, SequenceKey,
};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::persistence::{clear_board, load_board, save_board, KeyValueStore, StoreError};
use crate::room::{ActionReceiver, ActionSender, Room, RoomError, RoomEvent, Target};

/// Engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Registering or sending an action failed.
    #[error("room error: {0}")]
    Room(#[from] RoomError),

    /// Loading or clearing persisted state failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A local edit does not apply to the current document.
    #[error("edit rejected: {0}")]
    Apply(#[from] ApplyError),
}

struct EngineState {
    log: OperationLog,
    document: Document,
    snapshot: Option<Snapshot>,
    votes: VoteBook,
}

impl EngineState {
    /// Replay the log on top of the snapshot.
    fn rebuild(&mut self) {
        let replay = Document::replay(self.snapshot.as_ref().map(|s| &s.elements), &self.log);
        for (key, e) in &replay.skipped {
            debug!("replay skipped {}: {}", key, e);
        }
        self.document = replay.document;
    }
}

struct Senders {
    realtime: ActionSender<ElementEvent>,
    history: ActionSender<HistoryEntries>,
    request: ActionSender<PeerId>,
    propose: ActionSender<CheckpointProposal>,
}

struct Receivers {
    realtime: ActionReceiver<ElementEvent>,
    history: ActionReceiver<HistoryEntries>,
    request: ActionReceiver<PeerId>,
    propose: ActionReceiver<CheckpointProposal>,
}

struct EngineInner {
    self_id: PeerId,
    room: Room,
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    send: Senders,
    state: Mutex<EngineState>,
    document: watch::Sender<Document>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

/// Handle to a running sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("self_id", &self.inner.self_id)
            .finish()
    }
}

impl SyncEngine {
    /// Register the sync actions on `room`, restore persisted state from
    /// `store` and start handling messages.
    pub async fn start(
        room: &Room,
        store: Arc<dyn KeyValueStore>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let (realtime, realtime_rx) = room.make_action(ActionName::REALTIME.as_str())?;
        let (history, history_rx) = room.make_action(ActionName::SEND_HISTORY.as_str())?;
        let (request, request_rx) = room.make_action(ActionName::REQUEST_HISTORY.as_str())?;
        let (propose, propose_rx) = room.make_action(ActionName::PROPOSE.as_str())?;

        let stored = load_board(&*store).await?;
        let mut state = EngineState {
            log: OperationLog::new(),
            document: Document::new(),
            snapshot: None,
            votes: VoteBook::new(config.max_tracked_checkpoints),
        };
        if let Some(snapshot) = stored.snapshot {
            state.log.set_captured(snapshot.captured_keys.clone());
            state.snapshot = Some(snapshot);
        }
        state.log.merge(stored.history);
        state.rebuild();
        info!(
            "restored {} log entries and {} elements",
            state.log.len(),
            state.document.len()
        );

        let (document, _) = watch::channel(state.document.clone());
        let inner = Arc::new(EngineInner {
            self_id: room.self_id().clone(),
            room: room.clone(),
            config,
            store,
            send: Senders {
                realtime,
                history,
                request,
                propose,
            },
            state: Mutex::new(state),
            document,
            driver: StdMutex::new(None),
        });

        let receivers = Receivers {
            realtime: realtime_rx,
            history: history_rx,
            request: request_rx,
            propose: propose_rx,
        };
        let handle = tokio::spawn(drive(Arc::clone(&inner), receivers, room.subscribe()));
        *inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(Self { inner })
    }

    /// Apply an edit to the document right away and broadcast it live.
    ///
    /// The log is not touched; follow up with [`SyncEngine::commit`].
    pub async fn apply_local(&self, event: ElementEvent) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().await;
            state.document.apply(&event)?;
            self.inner.publish(&state.document);
        }
        self.inner.send.realtime.broadcast(&event).await?;
        Ok(())
    }

    /// Append an edit to the log under a fresh key and send it to every peer.
    ///
    /// The document is not rebuilt, so live edits from other peers that are
    /// not committed yet stay visible.
    pub async fn commit(&self, event: ElementEvent) -> Result<SequenceKey, EngineError> {
        let key = SequenceKey::generate();
        {
            let mut state = self.inner.state.lock().await;
            state.log.insert(key.clone(), event.clone());
            // Already applied when it went through apply_local.
            if let Err(e) = state.document.apply(&event) {
                debug!("committed edit not reapplied: {}", e);
            }
            self.inner.publish(&state.document);
            self.inner.persist(&state).await;
        }
        let entries: HistoryEntries = vec![(key.clone(), event)];
        self.inner.send.history.broadcast(&entries).await?;
        Ok(key)
    }

    /// Merge entries into the log and rebuild. Returns how many were new.
    ///
    /// Entries older than the last checkpoint that this peer never saw are
    /// kept, and the full history is pulled from every peer so the replay
    /// order can be restored.
    pub async fn merge_from(&self, entries: HistoryEntries) -> usize {
        self.inner.merge_from(entries, None).await
    }

    /// Ask one peer, or every peer, for its full log.
    pub async fn request_history(&self, peer: Option<PeerId>) -> Result<(), EngineError> {
        self.inner.request_history(peer).await
    }

    /// Propose a checkpoint now and record our own vote.
    pub async fn propose_checkpoint(&self, id: CheckpointId, element_hash: String) -> Result<(), EngineError> {
        self.inner.propose_checkpoint(id, element_hash).await
    }

    /// Propose a checkpoint if the log is long enough and the document has
    /// moved on since the last snapshot. Returns the proposed id.
    pub async fn maybe_propose(&self) -> Result<Option<CheckpointId>, EngineError> {
        self.inner.maybe_propose().await
    }

    /// Replace the snapshot and rebuild on top of it.
    pub async fn restore_snapshot(&self, snapshot: Snapshot) {
        let mut state = self.inner.state.lock().await;
        let mut captured = state.log.captured().clone();
        captured.extend(snapshot.captured_keys.iter().cloned());
        state.log.set_captured(captured);
        state.snapshot = Some(snapshot);
        state.rebuild();
        self.inner.publish(&state.document);
        self.inner.persist(&state).await;
    }

    /// Drop the log, snapshot, votes and document, here and in the store.
    pub async fn clear_history(&self) -> Result<(), EngineError> {
        let mut state = self.inner.state.lock().await;
        state.log.clear();
        state.snapshot = None;
        state.votes = VoteBook::new(self.inner.config.max_tracked_checkpoints);
        state.document = Document::new();
        self.inner.publish(&state.document);
        clear_board(&*self.inner.store).await?;
        info!("history cleared");
        Ok(())
    }

    /// Current document.
    pub fn document(&self) -> Document {
        self.inner.document.borrow().clone()
    }

    /// Watch the document change.
    pub fn subscribe(&self) -> watch::Receiver<Document> {
        self.inner.document.subscribe()
    }

    /// Log entries in key order.
    pub async fn history(&self) -> HistoryEntries {
        self.inner.state.lock().await.log.to_entries()
    }

    /// Latest snapshot.
    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.inner.state.lock().await.snapshot.clone()
    }

    /// Distinct votes recorded for a checkpoint.
    pub async fn votes(&self, id: &CheckpointId) -> usize {
        self.inner.state.lock().await.votes.votes(id)
    }

    /// Stop handling messages and write the final state.
    pub async fn shutdown(&self) {
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
        let state = self.inner.state.lock().await;
        self.inner.persist(&state).await;
    }
}

impl EngineInner {
    fn publish(&self, document: &Document) {
        self.document.send_replace(document.clone());
    }

    async fn persist(&self, state: &EngineState) {
        if let Err(e) = save_board(&*self.store, &state.log, state.snapshot.as_ref()).await {
            error!("failed to persist board: {}", e);
        }
    }

    async fn merge_from(&self, entries: HistoryEntries, from: Option<PeerId>) -> usize {
        let (added, late) = {
            let mut state = self.state.lock().await;
            let late = entries.iter().filter(|(key, _)| state.log.is_late(key)).count();
            if late > 0 {
                // Captured entries must be replayable around the late ones.
                state.log.release_captured();
                if let Some(snapshot) = state.snapshot.as_mut() {
                    snapshot.captured_keys.clear();
                }
            }
            let added = state.log.merge(entries);
            if added > 0 {
                state.rebuild();
                self.publish(&state.document);
                self.persist(&state).await;
                debug!("merged {} new log entries", added);
            }
            (added, late)
        };

        if late > 0 {
            info!("{} entries predate the last checkpoint, pulling full history", late);
            if let Err(e) = self.request_history(from).await {
                warn!("history request failed: {}", e);
            }
        }
        added
    }

    async fn request_history(&self, peer: Option<PeerId>) -> Result<(), EngineError> {
        let target = peer.map_or(Target::All, Target::Peer);
        self.send.request.send(&self.self_id, target).await?;
        Ok(())
    }

    async fn propose_checkpoint(&self, id: CheckpointId, element_hash: String) -> Result<(), EngineError> {
        self.state.lock().await.votes.propose(&id, &self.self_id);
        info!("proposing checkpoint {}", id);
        let proposal = CheckpointProposal {
            checkpoint_id: id,
            element_hash,
        };
        self.send.propose.broadcast(&proposal).await?;
        Ok(())
    }

    async fn maybe_propose(&self) -> Result<Option<CheckpointId>, EngineError> {
        let hash = {
            let state = self.state.lock().await;
            let hash = state.document.content_hash();
            let last = state.snapshot.as_ref().map(|s| s.element_hash.as_str());
            if !should_propose(state.log.len(), self.config.checkpoint_threshold, &hash, last) {
                return Ok(None);
            }
            hash
        };

        let id = CheckpointId::generate();
        self.propose_checkpoint(id.clone(), hash).await?;
        Ok(Some(id))
    }

    async fn on_realtime(&self, event: ElementEvent, from: &PeerId) {
        let mut state = self.state.lock().await;
        match state.document.apply(&event) {
            Ok(()) => self.publish(&state.document),
            Err(e) => warn!("live edit from {} ignored: {}", from, e),
        }
    }

    async fn on_history_request(&self, requester: PeerId, from: &PeerId) {
        if requester == self.self_id {
            return;
        }
        let entries = self.state.lock().await.log.to_entries();
        debug!("sending {} log entries to {} (asked by {})", entries.len(), requester, from);
        if let Err(e) = self.send.history.send_to(&entries, &requester).await {
            warn!("could not send history to {}: {}", requester, e);
        }
    }

    async fn on_proposal(&self, proposal: CheckpointProposal, from: PeerId) {
        let connected = self.room.peer_count();
        let outcome = {
            let mut state = self.state.lock().await;
            let local = state.document.content_hash();
            let outcome = state.votes.on_proposal(
                &proposal.checkpoint_id,
                &from,
                &proposal.element_hash,
                &local,
                &self.self_id,
                connected,
            );
            if let ProposalOutcome::Voted { compact: true, .. } = outcome {
                self.compact(&mut state, proposal.checkpoint_id.clone());
                self.persist(&state).await;
            }
            outcome
        };

        match outcome {
            ProposalOutcome::RequestHistory => {
                debug!("checkpoint {} disagrees with our state, pulling from {}", proposal.checkpoint_id, from);
                if let Err(e) = self.request_history(Some(from)).await {
                    warn!("history request failed: {}", e);
                }
            }
            ProposalOutcome::Voted { echo: true, .. } => {
                if let Err(e) = self.send.propose.broadcast(&proposal).await {
                    warn!("could not echo checkpoint {}: {}", proposal.checkpoint_id, e);
                }
            }
            ProposalOutcome::Voted { .. } => {}
        }
    }

    /// Snapshot the document and keep only the most recent log entries.
    fn compact(&self, state: &mut EngineState, id: CheckpointId) {
        let dropped = state.log.truncate_to_recent(self.config.retained_entries);
        let elements = state.document.clone();
        state.snapshot = Some(Snapshot {
            element_hash: elements.content_hash(),
            elements,
            captured_keys: state.log.captured().clone(),
            id: id.clone(),
        });
        info!("checkpoint {} reached quorum, dropped {} log entries", id, dropped);
    }
}

async fn drive(inner: Arc<EngineInner>, mut rx: Receivers, mut room_events: broadcast::Receiver<RoomEvent>) {
    let period = inner.config.checkpoint_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            Some((event, from)) = rx.realtime.recv() => inner.on_realtime(event, &from).await,
            Some((entries, from)) = rx.history.recv() => {
                debug!("history from {}", from);
                inner.merge_from(entries, Some(from)).await;
            }
            Some((requester, from)) = rx.request.recv() => inner.on_history_request(requester, &from).await,
            Some((proposal, from)) = rx.propose.recv() => inner.on_proposal(proposal, from).await,
            event = room_events.recv() => match event {
                Ok(RoomEvent::PeerJoined(peer)) => {
                    if let Err(e) = inner.request_history(Some(peer)).await {
                        warn!("history request failed: {}", e);
                    }
                }
                Ok(RoomEvent::PeerLeft(_)) => {}
                Err(RecvError::Lagged(missed)) => warn!("missed {} room events", missed),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = inner.maybe_propose().await {
                    warn!("checkpoint proposal failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, ConnectionChannel, MockNetwork};
    use crate::config::TransportConfig;
    use crate::persistence::{MemoryStore, HISTORY_KEY};
    use crate::rendezvous::NegotiatedPeer;
    use std::time::Duration;
    use tower_core::Role;
    use tower_types::{Element, ElementId, ElementKind, ElementPatch};

    fn engine_config() -> EngineConfig {
        EngineConfig {
            checkpoint_interval_secs: 3600,
            checkpoint_threshold: 3,
            retained_entries: 2,
            max_tracked_checkpoints: 8,
        }
    }

    fn transport_config() -> TransportConfig {
        TransportConfig {
            low_water_mark: 1024,
            leave_grace_ms: 10,
            max_message_size: tower_core::frame::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    async fn link(network: &MockNetwork, a: &Room, b: &Room) {
        let (x, mut x_events) = ConnectionChannel::open(network, Role::Offerer, 1024).await.unwrap();
        let (y, mut y_events) = ConnectionChannel::open(network, Role::Answerer, 1024).await.unwrap();
        let answer = y.apply_signal(x.create_offer().await.unwrap()).await.unwrap().unwrap();
        x.apply_signal(answer).await.unwrap();
        assert_eq!(x_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(y_events.recv().await, Some(ChannelEvent::Open));

        assert!(
            a.attach_peer(NegotiatedPeer {
                peer_id: b.self_id().clone(),
                channel: x,
                events: x_events,
            })
            .await
        );
        assert!(
            b.attach_peer(NegotiatedPeer {
                peer_id: a.self_id().clone(),
                channel: y,
                events: y_events,
            })
            .await
        );
    }

    async fn peer(name: &str, store: MemoryStore) -> (Room, SyncEngine) {
        let room = Room::new(PeerId::from(name), transport_config());
        let engine = SyncEngine::start(&room, Arc::new(store), engine_config()).await.unwrap();
        (room, engine)
    }

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn rect(id: &str, x: f64, y: f64) -> ElementEvent {
        ElementEvent::Create(Element::rect(id, x, y, 40.0, 30.0, "red"))
    }

    fn position(engine: &SyncEngine, id: &str) -> Option<(f64, f64)> {
        engine
            .document()
            .get(&ElementId::from(id))
            .map(|e| (e.x, e.y))
    }

    // ===========================================
    // Editing between two peers
    // ===========================================

    #[tokio::test]
    async fn create_move_delete_scenario() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;

        let create = rect("e1", 100.0, 100.0);
        a.apply_local(create.clone()).await.unwrap();
        a.commit(create).await.unwrap();
        assert!(wait_for(|| async { position(&b, "e1") == Some((100.0, 100.0)) }).await);

        let moved = ElementEvent::Update(ElementPatch::moved("e1", ElementKind::Rect, 150.0, 120.0));
        a.apply_local(moved.clone()).await.unwrap();
        a.commit(moved).await.unwrap();
        assert!(wait_for(|| async { position(&b, "e1") == Some((150.0, 120.0)) }).await);

        let delete = ElementEvent::delete("e1");
        a.apply_local(delete.clone()).await.unwrap();
        a.commit(delete).await.unwrap();
        assert!(wait_for(|| async { b.document().is_empty() }).await);
        assert!(a.document().is_empty());
        assert!(wait_for(|| async { b.history().await.len() == 3 }).await);
    }

    #[tokio::test]
    async fn live_edits_do_not_enter_the_log() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;

        a.apply_local(rect("e1", 1.0, 2.0)).await.unwrap();

        assert!(wait_for(|| async { position(&b, "e1") == Some((1.0, 2.0)) }).await);
        assert!(b.history().await.is_empty());
        assert!(a.history().await.is_empty());
    }

    #[tokio::test]
    async fn commit_keeps_uncommitted_edits_of_others() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;

        // Bob is still dragging; nothing committed yet.
        b.apply_local(rect("drag", 5.0, 5.0)).await.unwrap();
        assert!(wait_for(|| async { position(&a, "drag") == Some((5.0, 5.0)) }).await);

        let create = rect("e1", 1.0, 1.0);
        a.apply_local(create.clone()).await.unwrap();
        a.commit(create).await.unwrap();

        assert_eq!(position(&a, "drag"), Some((5.0, 5.0)));
        assert_eq!(position(&a, "e1"), Some((1.0, 1.0)));
        assert_eq!(a.history().await.len(), 1);
    }

    #[tokio::test]
    async fn local_edit_of_missing_element_is_rejected() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        let result = a.apply_local(ElementEvent::delete("ghost")).await;
        assert!(matches!(result, Err(EngineError::Apply(_))));
    }

    #[tokio::test]
    async fn joining_peer_receives_existing_history() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        for i in 0..3 {
            a.commit(rect(&format!("e{}", i), i as f64, 0.0)).await.unwrap();
        }

        link(&network, &room_a, &room_b).await;

        assert!(wait_for(|| async { b.document().len() == 3 }).await);
        assert_eq!(a.document(), b.document());
        assert_eq!(a.history().await, b.history().await);
    }

    #[tokio::test]
    async fn history_request_naming_self_is_ignored() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, _b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;
        // Let the join-time history exchange settle.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = network.sent_count();

        a.inner
            .on_history_request(PeerId::from("alice"), &PeerId::from("bob"))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(network.sent_count(), sent);
    }

    #[tokio::test]
    async fn merge_is_idempotent() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        let entries: HistoryEntries = vec![
            (SequenceKey::from("0002"), ElementEvent::delete("e1")),
            (SequenceKey::from("0001"), rect("e1", 0.0, 0.0)),
            (SequenceKey::from("0003"), rect("e1", 5.0, 5.0)),
        ];

        assert_eq!(a.merge_from(entries.clone()).await, 3);
        let once = a.document();
        assert_eq!(a.merge_from(entries).await, 0);

        assert_eq!(a.document(), once);
        assert_eq!(position(&a, "e1"), Some((5.0, 5.0)));
    }

    #[tokio::test]
    async fn subscribers_see_document_changes() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        let mut watcher = a.subscribe();

        a.commit(rect("e1", 0.0, 0.0)).await.unwrap();

        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().len(), 1);
    }

    // ===========================================
    // Checkpoints
    // ===========================================

    #[tokio::test]
    async fn agreeing_peers_compact_independently() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;
        for i in 0..5 {
            a.commit(rect(&format!("e{}", i), i as f64, 0.0)).await.unwrap();
        }
        assert!(wait_for(|| async { b.history().await.len() == 5 }).await);
        let before = a.document();

        let id = a.maybe_propose().await.unwrap().expect("log is past the threshold");

        assert!(wait_for(|| async { a.snapshot().await.is_some() && b.snapshot().await.is_some() }).await);
        assert_eq!(a.history().await.len(), 2);
        assert_eq!(b.history().await.len(), 2);
        assert_eq!(a.votes(&id).await, 2);
        assert_eq!(a.document(), before);
        assert_eq!(b.document(), before);

        // Same state as the snapshot: nothing new to propose.
        assert_eq!(a.maybe_propose().await.unwrap(), None);
    }

    #[tokio::test]
    async fn lone_peer_never_compacts() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        for i in 0..5 {
            a.commit(rect(&format!("e{}", i), 0.0, 0.0)).await.unwrap();
        }

        let id = a.maybe_propose().await.unwrap().unwrap();

        assert_eq!(a.votes(&id).await, 1);
        assert!(a.snapshot().await.is_none());
        assert_eq!(a.history().await.len(), 5);
    }

    #[tokio::test]
    async fn short_log_does_not_propose() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        a.commit(rect("e1", 0.0, 0.0)).await.unwrap();
        assert_eq!(a.maybe_propose().await.unwrap(), None);
    }

    #[tokio::test]
    async fn diverged_peer_pulls_history_instead_of_voting() {
        let network = MockNetwork::new();
        let (room_a, a) = peer("alice", MemoryStore::new()).await;
        let (room_b, b) = peer("bob", MemoryStore::new()).await;
        link(&network, &room_a, &room_b).await;

        // Entries only alice has.
        {
            let mut state = a.inner.state.lock().await;
            for i in 0..5 {
                state
                    .log
                    .insert(SequenceKey::new(format!("{:04}", i)), rect(&format!("e{}", i), 0.0, 0.0));
            }
            state.rebuild();
            a.inner.publish(&state.document);
        }

        let id = a.maybe_propose().await.unwrap().unwrap();

        assert!(wait_for(|| async { b.document().len() == 5 }).await);
        assert!(b.snapshot().await.is_none());
        assert_eq!(b.votes(&id).await, 0);
    }

    // ===========================================
    // Persistence
    // ===========================================

    #[tokio::test]
    async fn state_is_restored_from_the_store() {
        let store = MemoryStore::new();
        {
            let (_room, a) = peer("alice", store.clone()).await;
            a.commit(rect("e1", 7.0, 8.0)).await.unwrap();
            a.commit(rect("e2", 1.0, 1.0)).await.unwrap();
            a.shutdown().await;
        }

        let (_room, again) = peer("alice", store).await;
        assert_eq!(position(&again, "e1"), Some((7.0, 8.0)));
        assert_eq!(again.history().await.len(), 2);
    }

    #[tokio::test]
    async fn restored_snapshot_is_the_replay_base() {
        let (_room, a) = peer("alice", MemoryStore::new()).await;
        let elements: Document = [(ElementId::from("base"), Element::rect("base", 0.0, 0.0, 1.0, 1.0, "blue"))]
            .into_iter()
            .collect();
        a.restore_snapshot(Snapshot {
            id: CheckpointId::from("c0"),
            element_hash: elements.content_hash(),
            elements,
            captured_keys: [SequenceKey::from("0001"), SequenceKey::from("0005")].into_iter().collect(),
        })
        .await;

        // Already folded into the snapshot.
        let stale: HistoryEntries = vec![(SequenceKey::from("0001"), rect("old", 0.0, 0.0))];
        assert_eq!(a.merge_from(stale).await, 0);

        a.commit(rect("new", 0.0, 0.0)).await.unwrap();
        let document = a.document();
        assert!(document.get(&ElementId::from("base")).is_some());
        assert!(document.get(&ElementId::from("new")).is_some());
        assert!(document.get(&ElementId::from("old")).is_none());
    }

    #[tokio::test]
    async fn entries_older_than_the_snapshot_are_still_merged() {
        let (_room_a, a) = peer("alice", MemoryStore::new()).await;
        let (_room_b, b) = peer("bob", MemoryStore::new()).await;
        let entries: HistoryEntries = (1..=5)
            .map(|i| (SequenceKey::new(format!("{:04}", i)), rect(&format!("e{}", i), i as f64, 0.0)))
            .collect();
        a.merge_from(entries.clone()).await;
        b.merge_from(entries).await;
        {
            let mut state = a.inner.state.lock().await;
            a.inner.compact(&mut state, CheckpointId::from("c1"));
        }
        assert_eq!(a.history().await.len(), 2);

        // Made offline before the checkpoint, delivered after it.
        let late: HistoryEntries = vec![
            (SequenceKey::from("0000"), rect("late", 3.0, 3.0)),
            (
                SequenceKey::from("0000a"),
                ElementEvent::Update(ElementPatch::moved("e1", ElementKind::Rect, 9.0, 9.0)),
            ),
        ];
        assert_eq!(a.merge_from(late.clone()).await, 2);
        assert_eq!(b.merge_from(late).await, 2);
        assert_eq!(position(&a, "late"), Some((3.0, 3.0)));
        assert!(a.snapshot().await.unwrap().captured_keys.is_empty());

        // The compacted entries come back with the other side's history.
        assert_eq!(a.merge_from(b.history().await).await, 3);
        assert_eq!(b.merge_from(a.history().await).await, 0);
        assert_eq!(a.history().await, b.history().await);
        assert_eq!(a.document(), b.document());
        assert_eq!(a.document().content_hash(), b.document().content_hash());
        assert_eq!(position(&a, "e1"), Some((1.0, 0.0)));
    }

    #[tokio::test]
    async fn clear_history_empties_everything() {
        let store = MemoryStore::new();
        let (_room, a) = peer("alice", store.clone()).await;
        a.commit(rect("e1", 0.0, 0.0)).await.unwrap();
        assert!(store.get(HISTORY_KEY).is_some());

        a.clear_history().await.unwrap();

        assert!(a.document().is_empty());
        assert!(a.history().await.is_empty());
        assert!(store.get(HISTORY_KEY).is_none());
    }

    #[tokio::test]
    async fn persistence_failures_do_not_lose_edits() {
        let store = MemoryStore::new();
        let (_room, a) = peer("alice", store.clone()).await;
        store.fail_next_save("disk full");

        a.commit(rect("e1", 0.0, 0.0)).await.unwrap();

        assert_eq!(a.history().await.len(), 1);
        assert_eq!(a.document().len(), 1);
    }
}
