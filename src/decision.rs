use serde::{Deserialize, Serialize};

use crate::{
    Error, Height, Message, ParticipantSet, Phase, QuorumCertificate, Result, Round, State,
    StateCapabilities, StateHash,
};

/// The state agreed at one height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedState {
    pub height: Height,
    pub round: Round,
    pub state: State,
}

/// A confirmed state together with the pre-commit certificate proving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub confirmed: ConfirmedState,
    pub certificate: QuorumCertificate,
}

impl Decision {
    pub fn height(&self) -> Height {
        self.confirmed.height
    }

    pub fn hash(&self) -> StateHash {
        self.certificate.hash
    }

    pub fn validate(
        &self,
        participants: &ParticipantSet,
        capabilities: &dyn StateCapabilities,
    ) -> Result<()> {
        let qc = &self.certificate;
        if qc.phase != Phase::PreCommit {
            return Err(Error::InvalidCertificate("a decision needs a pre-commit certificate"));
        }
        if qc.height != self.confirmed.height || qc.round != self.confirmed.round {
            return Err(Error::InvalidCertificate("certificate is for another round"));
        }
        if capabilities.hash(&self.confirmed.state) != qc.hash {
            return Err(Error::InvalidCertificate("decided state does not match its hash"));
        }
        qc.verify(participants)
    }

    /// The `Decide` message announcing this decision.
    pub fn to_message(&self) -> Message {
        Message::Decide {
            height: self.confirmed.height,
            round: self.confirmed.round,
            state: self.confirmed.state.clone(),
            certificate: self.certificate.clone(),
        }
    }

    /// Builds a decision out of a `Decide` message, checking its certificate.
    pub fn from_message(
        message: &Message,
        participants: &ParticipantSet,
        capabilities: &dyn StateCapabilities,
    ) -> Result<Option<Self>> {
        let decision = match message {
            Message::Decide {
                height,
                round,
                state,
                certificate,
            } => Self {
                confirmed: ConfirmedState {
                    height: *height,
                    round: *round,
                    state: state.clone(),
                },
                certificate: certificate.clone(),
            },
            _ => return Ok(None),
        };
        decision.validate(participants, capabilities)?;
        Ok(Some(decision))
    }

    /// Fails with `ConflictingDecision` if `message` is a valid `Decide` for
    /// our height certifying a different state.
    pub fn check_agreement(
        &self,
        message: &Message,
        participants: &ParticipantSet,
        capabilities: &dyn StateCapabilities,
    ) -> Result<()> {
        if message.height() != self.height() {
            return Ok(());
        }
        match Self::from_message(message, participants, capabilities)? {
            Some(theirs) if theirs.hash() != self.hash() => Err(Error::ConflictingDecision {
                height: self.height(),
                ours: self.hash(),
                theirs: theirs.hash(),
            }),
            _ => Ok(()),
        }
    }
}
