use core::fmt::{self, Debug};
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::signing_payload;
use crate::{
    Error, Height, ParticipantIndex, ParticipantSet, Phase, Result, Round, Signature, State,
    StateCapabilities, StateHash,
};

/// At least a quorum of distinct participants' signatures over the same
/// `(height, round, phase, hash)` vote.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub height: Height,
    pub round: Round,
    pub phase: Phase,
    pub hash: StateHash,
    pub signatures: BTreeMap<ParticipantIndex, Signature>,
}

impl Debug for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QC(H{}R{}-{:?}{:?}x{})",
            self.height,
            self.round,
            self.phase,
            self.hash,
            self.signatures.len()
        )
    }
}

impl QuorumCertificate {
    pub fn verify(&self, participants: &ParticipantSet) -> Result<()> {
        if !matches!(self.phase, Phase::PreVote | Phase::PreCommit) {
            return Err(Error::InvalidCertificate("only votes can be certified"));
        }
        if self.signatures.len() < participants.quorum() {
            return Err(Error::InvalidCertificate("fewer signatures than a quorum"));
        }

        let payload = signing_payload(self.height, self.round, self.phase, Some(self.hash))?;
        for (voter, sig) in self.signatures.iter() {
            let public_key = participants.get(*voter)?;
            if !public_key.verify(sig, &payload) {
                return Err(Error::InvalidSignature { voter: *voter });
            }
        }
        Ok(())
    }
}

/// A state we pre-committed to, together with the pre-vote certificate that
/// justified it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub state: State,
    pub certificate: QuorumCertificate,
}

impl Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lock({:?})", self.certificate)
    }
}

impl Lock {
    pub fn round(&self) -> Round {
        self.certificate.round
    }

    pub fn hash(&self) -> StateHash {
        self.certificate.hash
    }

    /// A lock is only meaningful for a pre-vote quorum at `height` whose hash
    /// matches the carried state.
    pub fn verify(
        &self,
        height: Height,
        participants: &ParticipantSet,
        capabilities: &dyn StateCapabilities,
    ) -> Result<()> {
        if self.certificate.phase != Phase::PreVote {
            return Err(Error::InvalidCertificate("a lock needs a pre-vote certificate"));
        }
        if self.certificate.height != height {
            return Err(Error::InvalidCertificate("lock certifies another height"));
        }
        if capabilities.hash(&self.state) != self.certificate.hash {
            return Err(Error::InvalidCertificate("lock state does not match its hash"));
        }
        if !capabilities.validate(&self.state) {
            return Err(Error::InvalidState);
        }
        self.certificate.verify(participants)
    }
}
