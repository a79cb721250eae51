//! Operation log and materialized document.
//!
//! The [`OperationLog`] is a map from [`SequenceKey`] to [`ElementEvent`].
//! Entries are never mutated; iteration is always in key order regardless of
//! insertion order.
//!
//! The [`Document`] is derived from the log by [`Document::replay`]: creates
//! and updates are applied in key order (each cancelling any pending delete of
//! its element), then every delete still pending is applied. Because replay
//! always re-sorts, merging the same entries in any order, any number of
//! times, yields the same document.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tower_types::{
    CheckpointId, Element, ElementEvent, ElementId, HistoryEntries, SequenceKey, SyncError,
};

/// Why an event could not be applied to a document.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Update or delete of an element the document does not hold.
    #[error("element {0} not found")]
    UnknownElement(ElementId),

    /// Update rejected by the element (shape mismatch).
    #[error(transparent)]
    Rejected(#[from] SyncError),
}

/// Append-only log of element events keyed by sequence key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationLog {
    entries: BTreeMap<SequenceKey, ElementEvent>,
    captured: BTreeSet<SequenceKey>,
}

impl OperationLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry exists under `key`.
    pub fn contains(&self, key: &SequenceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Entry under `key`.
    pub fn get(&self, key: &SequenceKey) -> Option<&ElementEvent> {
        self.entries.get(key)
    }

    /// Keys dropped by compaction and folded into the snapshot.
    ///
    /// [`insert`](Self::insert) refuses them, so a peer resending its full log
    /// does not replay them twice.
    pub fn captured(&self) -> &BTreeSet<SequenceKey> {
        &self.captured
    }

    /// Restore the captured keys recorded by an earlier compaction.
    pub fn set_captured(&mut self, keys: BTreeSet<SequenceKey>) {
        self.captured = keys;
    }

    /// Forget the captured keys so those entries can be merged again.
    pub fn release_captured(&mut self) {
        self.captured.clear();
    }

    /// Whether `key` is new to this log yet sorts before an entry already
    /// folded into the snapshot.
    ///
    /// Such an entry was never part of the snapshot, so replaying it on top
    /// of the snapshot puts it out of order.
    pub fn is_late(&self, key: &SequenceKey) -> bool {
        self.captured.last().is_some_and(|newest| key < newest)
            && !self.captured.contains(key)
            && !self.entries.contains_key(key)
    }

    /// Insert an entry unless the key is present or captured.
    ///
    /// Returns whether the entry was inserted.
    pub fn insert(&mut self, key: SequenceKey, event: ElementEvent) -> bool {
        if self.captured.contains(&key) || self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, event);
        true
    }

    /// Insert every absent entry; returns how many were new.
    pub fn merge(&mut self, entries: impl IntoIterator<Item = (SequenceKey, ElementEvent)>) -> usize {
        entries
            .into_iter()
            .filter(|(key, event)| self.insert(key.clone(), event.clone()))
            .count()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&SequenceKey, &ElementEvent)> {
        self.entries.iter()
    }

    /// Owned copy of all entries in key order, in wire form.
    pub fn to_entries(&self) -> HistoryEntries {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Keep only the `keep` most recent entries; returns how many were dropped.
    ///
    /// Dropped keys become captured.
    pub fn truncate_to_recent(&mut self, keep: usize) -> usize {
        let excess = self.entries.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }
        let dropped = match self.entries.keys().nth(excess).cloned() {
            Some(first_kept) => {
                let kept = self.entries.split_off(&first_kept);
                std::mem::replace(&mut self.entries, kept)
            }
            None => std::mem::take(&mut self.entries),
        };
        self.captured.extend(dropped.into_keys());
        excess
    }

    /// Drop every entry and captured key.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.captured.clear();
    }
}

/// Materialized whiteboard state: element id to element.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    elements: BTreeMap<ElementId, Element>,
}

/// Outcome of a replay.
#[derive(Debug)]
pub struct Replay {
    /// The rebuilt document.
    pub document: Document,
    /// Entries that could not be applied, with their keys.
    pub skipped: Vec<(SequenceKey, ApplyError)>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the document holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element by id.
    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    /// Elements in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ElementId, &Element)> {
        self.elements.iter()
    }

    /// Apply one event immediately, deletes included.
    ///
    /// Used for optimistic local edits and live remote edits. On error the
    /// document is unchanged.
    pub fn apply(&mut self, event: &ElementEvent) -> Result<(), ApplyError> {
        match event {
            ElementEvent::Create(element) => {
                self.elements.insert(element.id.clone(), element.clone());
                Ok(())
            }
            ElementEvent::Update(patch) => self.patch(patch),
            ElementEvent::Delete(target) => self
                .elements
                .remove(&target.id)
                .map(|_| ())
                .ok_or_else(|| ApplyError::UnknownElement(target.id.clone())),
        }
    }

    fn patch(&mut self, patch: &tower_types::ElementPatch) -> Result<(), ApplyError> {
        let element = self
            .elements
            .get_mut(&patch.id)
            .ok_or_else(|| ApplyError::UnknownElement(patch.id.clone()))?;
        element.apply_patch(patch)?;
        Ok(())
    }

    /// Rebuild a document from `base` plus every entry of `log`.
    ///
    /// Creates and updates apply in key order and cancel any pending delete
    /// of their element; deletes apply after the full pass.
    pub fn replay(base: Option<&Document>, log: &OperationLog) -> Replay {
        let mut document = base.cloned().unwrap_or_default();
        let mut skipped = Vec::new();
        let mut pending_deletes: BTreeMap<ElementId, SequenceKey> = BTreeMap::new();

        for (key, event) in log.iter() {
            match event {
                ElementEvent::Delete(target) => {
                    pending_deletes.insert(target.id.clone(), key.clone());
                }
                _ => {
                    pending_deletes.remove(event.element_id());
                    if let Err(e) = document.apply(event) {
                        skipped.push((key.clone(), e));
                    }
                }
            }
        }

        for (id, key) in pending_deletes {
            if document.elements.remove(&id).is_none() {
                skipped.push((key, ApplyError::UnknownElement(id)));
            }
        }

        Replay { document, skipped }
    }

    /// SHA-256 hex over the JSON array of `[id, element]` pairs in id order.
    ///
    /// Two peers holding the same elements always agree on this hash.
    pub fn content_hash(&self) -> String {
        // A sequence of string ids and plain structs; serde_json writes
        // non-finite floats as null.
        let canonical = serde_json::to_vec(self).expect("document serialization failed");
        hex::encode(Sha256::digest(&canonical))
    }

    /// Ids of all elements.
    pub fn ids(&self) -> BTreeSet<ElementId> {
        self.elements.keys().cloned().collect()
    }
}

impl FromIterator<(ElementId, Element)> for Document {
    fn from_iter<I: IntoIterator<Item = (ElementId, Element)>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

// Serialized as `[[id, element], ...]`.
impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.elements.iter())
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(ElementId, Element)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Agreed state captured at a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Checkpoint that produced this snapshot.
    pub id: CheckpointId,
    /// Elements at the checkpoint.
    pub elements: Document,
    /// Content hash of `elements`.
    pub element_hash: String,
    /// Log keys folded into `elements`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub captured_keys: BTreeSet<SequenceKey>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_types::{ElementKind, ElementPatch};

    fn key(n: u32) -> SequenceKey {
        SequenceKey::new(format!("{:08}", n))
    }

    fn create(id: &str, x: f64) -> ElementEvent {
        ElementEvent::Create(Element::rect(id, x, 100.0, 10.0, 10.0, "red"))
    }

    fn moved(id: &str, x: f64) -> ElementEvent {
        ElementEvent::Update(ElementPatch::moved(id, ElementKind::Rect, x, 5.0))
    }

    fn rebuild(log: &OperationLog) -> Document {
        Document::replay(None, log).document
    }

    // ===========================================
    // Replay ordering
    // ===========================================

    #[test]
    fn later_create_cancels_pending_delete() {
        let mut log = OperationLog::new();
        log.insert(key(1), create("A", 1.0));
        log.insert(key(2), ElementEvent::delete("A"));
        log.insert(key(3), create("A", 3.0));

        let doc = rebuild(&log);
        assert_eq!(doc.get(&"A".into()).map(|e| e.x), Some(3.0));
    }

    #[test]
    fn delete_after_update_removes_element() {
        let mut log = OperationLog::new();
        log.insert(key(1), create("A", 1.0));
        log.insert(key(2), moved("A", 5.0));
        log.insert(key(3), ElementEvent::delete("A"));

        assert!(rebuild(&log).get(&"A".into()).is_none());
    }

    #[test]
    fn later_update_cancels_pending_delete() {
        let mut log = OperationLog::new();
        log.insert(key(1), create("A", 1.0));
        log.insert(key(2), ElementEvent::delete("A"));
        log.insert(key(3), moved("A", 9.0));

        let doc = rebuild(&log);
        assert_eq!(doc.get(&"A".into()).map(|e| e.x), Some(9.0));
    }

    #[test]
    fn later_updates_override_earlier_fields() {
        let mut log = OperationLog::new();
        log.insert(key(1), create("A", 1.0));
        log.insert(key(3), moved("A", 3.0));
        log.insert(key(2), moved("A", 2.0));

        assert_eq!(rebuild(&log).get(&"A".into()).map(|e| e.x), Some(3.0));
    }

    #[test]
    fn update_of_unknown_element_is_skipped() {
        let mut log = OperationLog::new();
        log.insert(key(1), moved("ghost", 3.0));
        let replay = Document::replay(None, &log);
        assert!(replay.document.is_empty());
        assert_eq!(replay.skipped.len(), 1);
    }

    // ===========================================
    // Merge properties
    // ===========================================

    #[test]
    fn merge_is_order_independent() {
        let entries = vec![
            (key(1), create("A", 1.0)),
            (key(2), create("B", 2.0)),
            (key(3), moved("A", 7.0)),
            (key(4), ElementEvent::delete("B")),
            (key(5), create("C", 5.0)),
        ];

        let mut forward = OperationLog::new();
        forward.merge(entries.clone());
        let mut backward = OperationLog::new();
        backward.merge(entries.into_iter().rev());

        let a = rebuild(&forward);
        let b = rebuild(&backward);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.ids().len(), 2);
    }

    #[test]
    fn merge_is_idempotent() {
        let entries = vec![(key(1), create("A", 1.0)), (key(2), moved("A", 4.0))];
        let mut log = OperationLog::new();
        assert_eq!(log.merge(entries.clone()), 2);
        let once = rebuild(&log);
        assert_eq!(log.merge(entries), 0);
        assert_eq!(rebuild(&log), once);
    }

    #[test]
    fn existing_entries_are_never_replaced() {
        let mut log = OperationLog::new();
        assert!(log.insert(key(1), create("A", 1.0)));
        assert!(!log.insert(key(1), create("A", 99.0)));
        assert_eq!(log.get(&key(1)), Some(&create("A", 1.0)));
    }

    // ===========================================
    // Compaction
    // ===========================================

    #[test]
    fn truncate_keeps_most_recent_and_captures_the_rest() {
        let mut log = OperationLog::new();
        for n in 1..=10 {
            log.insert(key(n), create(&format!("e{}", n), n as f64));
        }
        assert_eq!(log.truncate_to_recent(4), 6);
        assert_eq!(log.len(), 4);
        assert_eq!(log.captured().len(), 6);
        assert!(log.captured().contains(&key(6)));
        assert!(log.contains(&key(10)));
        assert!(!log.contains(&key(6)));

        // Resent entries already in the snapshot are refused.
        assert!(!log.insert(key(3), create("e3", 3.0)));
        assert!(log.insert(key(11), create("new", 0.0)));
        assert_eq!(log.truncate_to_recent(100), 0);
    }

    #[test]
    fn unseen_keys_before_the_snapshot_are_late() {
        let mut log = OperationLog::new();
        for n in [2, 4, 6, 8] {
            log.insert(key(n), create(&format!("e{}", n), n as f64));
        }
        log.truncate_to_recent(2);

        assert!(log.is_late(&key(1)));
        assert!(log.is_late(&key(3)));
        assert!(!log.is_late(&key(2)));
        assert!(!log.is_late(&key(6)));
        assert!(!log.is_late(&key(5)));
        assert!(!log.is_late(&key(9)));

        // Late entries are kept, not dropped.
        assert!(log.insert(key(3), create("late", 0.0)));

        log.release_captured();
        assert!(log.captured().is_empty());
        assert!(log.insert(key(2), create("e2", 2.0)));
    }

    #[test]
    fn replay_on_snapshot_keeps_compacted_elements() {
        let mut log = OperationLog::new();
        log.insert(key(1), create("old", 1.0));
        log.insert(key(2), create("A", 2.0));
        log.insert(key(3), moved("A", 6.0));
        let base = rebuild(&log);

        log.truncate_to_recent(1);
        let doc = Document::replay(Some(&base), &log).document;
        assert_eq!(doc, base);

        log.insert(key(4), ElementEvent::delete("old"));
        let doc = Document::replay(Some(&base), &log).document;
        assert!(doc.get(&"old".into()).is_none());
        assert_eq!(doc.get(&"A".into()).map(|e| e.x), Some(6.0));
    }

    // ===========================================
    // Hashing and serialization
    // ===========================================

    #[test]
    fn content_hash_tracks_content() {
        let mut doc = Document::new();
        let empty = doc.content_hash();
        assert_eq!(empty.len(), 64);

        doc.apply(&create("A", 1.0)).unwrap();
        let one = doc.content_hash();
        assert_ne!(empty, one);

        doc.apply(&moved("A", 2.0)).unwrap();
        assert_ne!(one, doc.content_hash());
    }

    #[test]
    fn content_hash_accepts_non_finite_coordinates() {
        let mut doc = Document::new();
        doc.apply(&create("A", f64::NAN)).unwrap();
        assert_eq!(doc.content_hash().len(), 64);
        assert_ne!(doc.content_hash(), Document::new().content_hash());
    }

    #[test]
    fn document_serializes_as_pairs() {
        let doc: Document = vec![(ElementId::from("A"), Element::circle("A", 0.0, 0.0, 1.0, "blue"))]
            .into_iter()
            .collect();
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value[0][0], "A");
        assert_eq!(value[0][1]["type"], "circle");

        let back: Document = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn apply_delete_of_missing_element_fails() {
        let mut doc = Document::new();
        assert!(matches!(
            doc.apply(&ElementEvent::delete("nope")),
            Err(ApplyError::UnknownElement(_))
        ));
    }
}
