use std::collections::{BTreeMap, BTreeSet};

use crate::{
    Height, Message, ParticipantIndex, Phase, QuorumCertificate, Round, Signature,
    SignedMessage, StateHash,
};

type Slot = BTreeMap<ParticipantIndex, (StateHash, Signature)>;

/// Pre-votes and pre-commits of one height, one slot per
/// `(round, phase, participant)`. A later vote for an occupied slot replaces
/// the earlier one, so a participant is never counted twice.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    height: Height,
    slots: BTreeMap<(Round, Phase), Slot>,
}

impl VoteTally {
    pub fn new(height: Height) -> Self {
        Self {
            height,
            slots: Default::default(),
        }
    }

    /// Records a verified vote. Returns whether the tally changed; replaying
    /// the identical vote is a no-op. Non-vote messages are ignored.
    pub fn insert(&mut self, signed: &SignedMessage) -> bool {
        let (round, phase, hash) = match &signed.message {
            Message::PreVote { round, hash, .. } => (*round, Phase::PreVote, *hash),
            Message::PreCommit { round, hash, .. } => (*round, Phase::PreCommit, *hash),
            _ => return false,
        };

        let slot = self.slots.entry((round, phase)).or_default();
        match slot.get(&signed.voter) {
            Some((existing, _)) if *existing == hash => false,
            _ => {
                slot.insert(signed.voter, (hash, signed.sig.clone()));
                true
            }
        }
    }

    /// Number of participants whose current vote in the slot is `hash`.
    pub fn count(&self, round: Round, phase: Phase, hash: &StateHash) -> usize {
        self.slots
            .get(&(round, phase))
            .map(|slot| slot.values().filter(|(h, _)| h == hash).count())
            .unwrap_or_default()
    }

    /// The hash holding a quorum in the slot, if any. At most one hash can,
    /// since votes are counted once per participant.
    pub fn quorum(&self, round: Round, phase: Phase, quorum: usize) -> Option<StateHash> {
        let slot = self.slots.get(&(round, phase))?;
        let hashes = BTreeSet::from_iter(slot.values().map(|(hash, _)| *hash));
        hashes
            .into_iter()
            .find(|hash| self.count(round, phase, hash) >= quorum)
    }

    /// Every hash some vote still refers to.
    pub fn hashes(&self) -> BTreeSet<StateHash> {
        BTreeSet::from_iter(
            self.slots
                .values()
                .flat_map(|slot| slot.values().map(|(hash, _)| *hash)),
        )
    }

    /// Every `(round, hash)` holding a quorum of `phase` votes, lowest round first.
    pub fn find_quorums(&self, phase: Phase, quorum: usize) -> Vec<(Round, StateHash)> {
        let rounds = self
            .slots
            .keys()
            .filter(|(_, p)| *p == phase)
            .map(|(round, _)| *round);
        Vec::from_iter(rounds.filter_map(|round| {
            self.quorum(round, phase, quorum).map(|hash| (round, hash))
        }))
    }

    /// Gathers the signatures for `hash` in the slot into a certificate.
    pub fn certificate(
        &self,
        round: Round,
        phase: Phase,
        hash: &StateHash,
        quorum: usize,
    ) -> Option<QuorumCertificate> {
        let slot = self.slots.get(&(round, phase))?;
        let signatures = BTreeMap::from_iter(
            slot.iter()
                .filter(|(_, (h, _))| h == hash)
                .map(|(voter, (_, sig))| (*voter, sig.clone())),
        );
        if signatures.len() < quorum {
            return None;
        }
        Some(QuorumCertificate {
            height: self.height,
            round,
            phase,
            hash: *hash,
            signatures,
        })
    }

    /// Drops every slot of a round below `round`.
    pub fn prune_below(&mut self, round: Round) {
        self.slots = self.slots.split_off(&(round, Phase::Propose));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SecretKey;

    fn vote(voter: ParticipantIndex, round: Round, hash: u8, precommit: bool) -> SignedMessage {
        let hash = StateHash([hash; 32]);
        let message = if precommit {
            Message::PreCommit {
                height: 1,
                round,
                hash,
            }
        } else {
            Message::PreVote {
                height: 1,
                round,
                hash,
            }
        };
        SignedMessage {
            message,
            voter,
            sig: SecretKey::random().sign(b"unchecked"),
        }
    }

    #[test]
    fn test_replayed_vote_is_a_noop() {
        let mut tally = VoteTally::new(1);
        let v = vote(0, 0, 1, false);
        assert!(tally.insert(&v));
        assert!(!tally.insert(&v));
        assert_eq!(tally.count(0, Phase::PreVote, &StateHash([1; 32])), 1);
    }

    #[test]
    fn test_later_vote_replaces_earlier_in_same_slot() {
        let mut tally = VoteTally::new(1);
        assert!(tally.insert(&vote(0, 0, 1, false)));
        assert!(tally.insert(&vote(0, 0, 2, false)));
        assert_eq!(tally.count(0, Phase::PreVote, &StateHash([1; 32])), 0);
        assert_eq!(tally.count(0, Phase::PreVote, &StateHash([2; 32])), 1);
        assert_eq!(tally.hashes(), BTreeSet::from([StateHash([2; 32])]));
    }

    #[test]
    fn test_quorum_and_certificate() {
        let mut tally = VoteTally::new(1);
        for voter in 0..2 {
            tally.insert(&vote(voter, 3, 9, true));
        }
        tally.insert(&vote(2, 3, 8, true));
        assert_eq!(tally.quorum(3, Phase::PreCommit, 3), None);
        assert!(tally
            .certificate(3, Phase::PreCommit, &StateHash([9; 32]), 3)
            .is_none());

        tally.insert(&vote(3, 3, 9, true));
        assert_eq!(
            tally.quorum(3, Phase::PreCommit, 3),
            Some(StateHash([9; 32]))
        );
        assert_eq!(
            tally.find_quorums(Phase::PreCommit, 3),
            vec![(3, StateHash([9; 32]))]
        );
        assert!(tally.find_quorums(Phase::PreVote, 3).is_empty());

        let qc = tally
            .certificate(3, Phase::PreCommit, &StateHash([9; 32]), 3)
            .unwrap();
        assert_eq!(qc.height, 1);
        assert_eq!(Vec::from_iter(qc.signatures.keys().copied()), vec![0, 1, 3]);
    }

    #[test]
    fn test_prune_below_keeps_current_round() {
        let mut tally = VoteTally::new(1);
        tally.insert(&vote(0, 0, 1, false));
        tally.insert(&vote(0, 1, 1, true));
        tally.insert(&vote(0, 2, 1, false));
        tally.insert(&vote(1, 0, 2, false));
        tally.prune_below(1);
        assert_eq!(tally.count(0, Phase::PreVote, &StateHash([1; 32])), 0);
        assert_eq!(tally.count(1, Phase::PreCommit, &StateHash([1; 32])), 1);
        assert_eq!(tally.count(2, Phase::PreVote, &StateHash([1; 32])), 1);
        assert_eq!(tally.hashes(), BTreeSet::from([StateHash([1; 32])]));
    }
}
