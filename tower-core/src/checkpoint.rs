//! Checkpoint proposal, voting and quorum.
//!
//! A peer proposes a checkpoint when its log has grown past a threshold and
//! its state differs from the last snapshot. Peers whose state hashes to the
//! same value vote for it and gossip the proposal onward; a peer whose hash
//! differs pulls history from the proposer instead. Each peer compacts on its
//! own once it has seen more than `floor(N / 2) + 1` distinct votes, where N is
//! the number of peers it is currently connected to.
//!
//! [`VoteBook`] only tracks the most recent checkpoints; older vote sets are
//! evicted as new ones open.

use std::collections::{BTreeSet, VecDeque};

use tower_types::{CheckpointId, PeerId};

/// Votes needed to be exceeded for compaction with `connected` peers.
pub fn quorum_threshold(connected: usize) -> usize {
    connected / 2 + 1
}

/// Whether `votes` distinct voters reach quorum among `connected` peers.
pub fn has_quorum(votes: usize, connected: usize) -> bool {
    votes > quorum_threshold(connected)
}

/// Whether a peer should propose a checkpoint now.
pub fn should_propose(
    log_len: usize,
    threshold: usize,
    current_hash: &str,
    snapshot_hash: Option<&str>,
) -> bool {
    log_len > threshold && snapshot_hash != Some(current_hash)
}

/// What to do after receiving a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Local state differs; pull history from the proposer.
    RequestHistory,
    /// Vote recorded.
    Voted {
        /// Re-broadcast the proposal (first time this peer voted for it).
        echo: bool,
        /// Quorum reached for the first time; compact now.
        compact: bool,
        /// Distinct voters so far.
        votes: usize,
    },
}

#[derive(Debug)]
struct VoteSet {
    id: CheckpointId,
    voters: BTreeSet<PeerId>,
    compacted: bool,
}

/// Bounded record of checkpoint votes.
#[derive(Debug)]
pub struct VoteBook {
    sets: VecDeque<VoteSet>,
    capacity: usize,
}

impl VoteBook {
    /// Track at most `capacity` checkpoints at a time.
    pub fn new(capacity: usize) -> Self {
        Self {
            sets: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn set_mut(&mut self, id: &CheckpointId) -> &mut VoteSet {
        if let Some(pos) = self.sets.iter().position(|s| &s.id == id) {
            return &mut self.sets[pos];
        }
        while self.sets.len() >= self.capacity {
            self.sets.pop_front();
        }
        self.sets.push_back(VoteSet {
            id: id.clone(),
            voters: BTreeSet::new(),
            compacted: false,
        });
        let last = self.sets.len() - 1;
        &mut self.sets[last]
    }

    fn set(&self, id: &CheckpointId) -> Option<&VoteSet> {
        self.sets.iter().find(|s| &s.id == id)
    }

    /// Record a vote; returns the number of distinct voters.
    pub fn record(&mut self, id: &CheckpointId, voter: &PeerId) -> usize {
        let set = self.set_mut(id);
        set.voters.insert(voter.clone());
        set.voters.len()
    }

    /// Distinct voters for `id`.
    pub fn votes(&self, id: &CheckpointId) -> usize {
        self.set(id).map_or(0, |s| s.voters.len())
    }

    /// Whether `voter` has voted for `id`.
    pub fn has_voted(&self, id: &CheckpointId, voter: &PeerId) -> bool {
        self.set(id).is_some_and(|s| s.voters.contains(voter))
    }

    /// Number of checkpoints currently tracked.
    pub fn tracked(&self) -> usize {
        self.sets.len()
    }

    /// Record the local peer's own proposal.
    pub fn propose(&mut self, id: &CheckpointId, self_id: &PeerId) {
        self.record(id, self_id);
    }

    /// Mark `id` compacted if quorum is reached and it was not compacted yet.
    ///
    /// Returns true exactly once per checkpoint.
    pub fn try_compact(&mut self, id: &CheckpointId, connected: usize) -> bool {
        let set = self.set_mut(id);
        if set.compacted || !has_quorum(set.voters.len(), connected) {
            return false;
        }
        set.compacted = true;
        true
    }

    /// Handle a proposal received from `proposer`.
    ///
    /// `local_hash` is the hash of this peer's current state. When it matches,
    /// a vote for the proposer is recorded; if this peer had not voted yet it
    /// votes too and the proposal should be echoed.
    pub fn on_proposal(
        &mut self,
        id: &CheckpointId,
        proposer: &PeerId,
        proposed_hash: &str,
        local_hash: &str,
        self_id: &PeerId,
        connected: usize,
    ) -> ProposalOutcome {
        if proposed_hash != local_hash {
            return ProposalOutcome::RequestHistory;
        }

        self.record(id, proposer);
        let echo = !self.has_voted(id, self_id);
        let votes = self.record(id, self_id);
        let compact = self.try_compact(id, connected);

        ProposalOutcome::Voted {
            echo,
            compact,
            votes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn cp(s: &str) -> CheckpointId {
        CheckpointId::from(s)
    }

    // ===========================================
    // Quorum arithmetic
    // ===========================================

    #[test]
    fn quorum_boundaries() {
        // N = 1: threshold 1, so 2 votes are needed.
        assert!(!has_quorum(1, 1));
        assert!(has_quorum(2, 1));
        // N = 2: threshold 2, so 3 votes are needed.
        assert!(!has_quorum(2, 2));
        assert!(has_quorum(3, 2));
        // N = 4: threshold 3, so 4 votes are needed.
        assert!(!has_quorum(3, 4));
        assert!(has_quorum(4, 4));
        // N = 5: threshold 3, so 4 votes are needed.
        assert!(!has_quorum(3, 5));
        assert!(has_quorum(4, 5));
    }

    #[test]
    fn lone_peer_never_compacts_alone() {
        assert!(!has_quorum(1, 0));
        let mut book = VoteBook::new(4);
        book.propose(&cp("c"), &peer("me"));
        assert!(!book.try_compact(&cp("c"), 0));
    }

    #[test]
    fn propose_only_past_threshold_and_on_new_state() {
        assert!(!should_propose(100, 100, "h", None));
        assert!(should_propose(101, 100, "h", None));
        assert!(should_propose(101, 100, "h", Some("old")));
        assert!(!should_propose(500, 100, "h", Some("h")));
    }

    // ===========================================
    // Proposal handling
    // ===========================================

    #[test]
    fn mismatched_hash_requests_history() {
        let mut book = VoteBook::new(4);
        let outcome = book.on_proposal(&cp("c"), &peer("a"), "h1", "h2", &peer("me"), 1);
        assert_eq!(outcome, ProposalOutcome::RequestHistory);
        assert_eq!(book.votes(&cp("c")), 0);
    }

    #[test]
    fn first_matching_proposal_votes_and_echoes() {
        let mut book = VoteBook::new(4);
        let outcome = book.on_proposal(&cp("c"), &peer("a"), "h", "h", &peer("me"), 1);
        assert_eq!(
            outcome,
            ProposalOutcome::Voted {
                echo: true,
                compact: true,
                votes: 2
            }
        );

        let again = book.on_proposal(&cp("c"), &peer("a"), "h", "h", &peer("me"), 1);
        assert_eq!(
            again,
            ProposalOutcome::Voted {
                echo: false,
                compact: false,
                votes: 2
            }
        );
    }

    #[test]
    fn proposer_counts_echoes_toward_quorum() {
        // Proposer with two connected peers needs three votes.
        let mut book = VoteBook::new(4);
        let me = peer("me");
        book.propose(&cp("c"), &me);

        let first = book.on_proposal(&cp("c"), &peer("b"), "h", "h", &me, 2);
        assert_eq!(
            first,
            ProposalOutcome::Voted {
                echo: false,
                compact: false,
                votes: 2
            }
        );
        let second = book.on_proposal(&cp("c"), &peer("c"), "h", "h", &me, 2);
        assert!(matches!(second, ProposalOutcome::Voted { compact: true, votes: 3, .. }));
    }

    // ===========================================
    // Bounded vote sets
    // ===========================================

    #[test]
    fn oldest_vote_sets_are_evicted() {
        let mut book = VoteBook::new(2);
        book.record(&cp("1"), &peer("a"));
        book.record(&cp("2"), &peer("a"));
        book.record(&cp("3"), &peer("a"));

        assert_eq!(book.tracked(), 2);
        assert_eq!(book.votes(&cp("1")), 0);
        assert_eq!(book.votes(&cp("3")), 1);
    }

    #[test]
    fn duplicate_voters_count_once() {
        let mut book = VoteBook::new(2);
        assert_eq!(book.record(&cp("1"), &peer("a")), 1);
        assert_eq!(book.record(&cp("1"), &peer("a")), 1);
        assert_eq!(book.record(&cp("1"), &peer("b")), 2);
        assert!(book.has_voted(&cp("1"), &peer("b")));
    }
}
