use core::fmt::{self, Debug};
use std::sync::Arc;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::{
    ConfigError, Error, Height, Lock, ParticipantIndex, ParticipantSet, PublicKey,
    QuorumCertificate, Result, Round, SecretKey, Signature, State, StateCapabilities, StateHash,
};

/// Version byte leading every frame on the wire. Bump on any change to
/// [`SignedMessage`] or to the signing payload layout.
pub const WIRE_VERSION: u8 = 1;

/// Size of the nonce each side of a new connection asks the other to sign.
pub const CHALLENGE_SIZE: usize = 32;

pub type Challenge = [u8; CHALLENGE_SIZE];

/// Tag of a protocol message; also the phase a vote slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    Propose,
    PreVote,
    PreCommit,
    RoundChange,
    Decide,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Full candidate state, justified by the lock certificate when the sender is locked.
    Proposal {
        height: Height,
        round: Round,
        state: State,
        justification: Option<QuorumCertificate>,
    },
    PreVote {
        height: Height,
        round: Round,
        hash: StateHash,
    },
    PreCommit {
        height: Height,
        round: Round,
        hash: StateHash,
    },
    /// Announces the sender moved to `round`, carrying its lock if it has one.
    RoundChange {
        height: Height,
        round: Round,
        lock: Option<Lock>,
    },
    /// A decided state with the pre-commit certificate proving it.
    Decide {
        height: Height,
        round: Round,
        state: State,
        certificate: QuorumCertificate,
    },
}

impl Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Proposal {
                height,
                round,
                state,
                justification,
            } => {
                write!(f, "H{}R{}-P({}B)", height, round, state.len())?;
                if let Some(qc) = justification {
                    write!(f, "-J{:?}@R{}", qc.hash, qc.round)?;
                }
                Ok(())
            }
            Message::PreVote {
                height,
                round,
                hash,
            } => write!(f, "H{}R{}-PV{:?}", height, round, hash),
            Message::PreCommit {
                height,
                round,
                hash,
            } => write!(f, "H{}R{}-PC{:?}", height, round, hash),
            Message::RoundChange {
                height,
                round,
                lock,
            } => write!(
                f,
                "H{}R{}-RC{:?}",
                height,
                round,
                lock.as_ref().map(Lock::hash)
            ),
            Message::Decide {
                height,
                round,
                certificate,
                ..
            } => write!(f, "H{}R{}-D{:?}", height, round, certificate.hash),
        }
    }
}

impl Message {
    pub fn height(&self) -> Height {
        match self {
            Message::Proposal { height, .. }
            | Message::PreVote { height, .. }
            | Message::PreCommit { height, .. }
            | Message::RoundChange { height, .. }
            | Message::Decide { height, .. } => *height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            Message::Proposal { round, .. }
            | Message::PreVote { round, .. }
            | Message::PreCommit { round, .. }
            | Message::RoundChange { round, .. }
            | Message::Decide { round, .. } => *round,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Message::Proposal { .. } => Phase::Propose,
            Message::PreVote { .. } => Phase::PreVote,
            Message::PreCommit { .. } => Phase::PreCommit,
            Message::RoundChange { .. } => Phase::RoundChange,
            Message::Decide { .. } => Phase::Decide,
        }
    }

    /// The state hash a signature over this message commits to.
    pub fn digest(&self, capabilities: &dyn StateCapabilities) -> Option<StateHash> {
        match self {
            Message::Proposal { state, .. } | Message::Decide { state, .. } => {
                Some(capabilities.hash(state))
            }
            Message::PreVote { hash, .. } | Message::PreCommit { hash, .. } => Some(*hash),
            Message::RoundChange { lock, .. } => lock.as_ref().map(Lock::hash),
        }
    }
}

#[derive(Serialize)]
struct SigningPayload {
    version: u8,
    height: Height,
    round: Round,
    phase: Phase,
    hash: Option<StateHash>,
}

/// Canonical bytes signed for `(height, round, phase, hash)`.
pub fn signing_payload(
    height: Height,
    round: Round,
    phase: Phase,
    hash: Option<StateHash>,
) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&SigningPayload {
        version: WIRE_VERSION,
        height,
        round,
        phase,
        hash,
    })?)
}

fn challenge_payload(challenge: &Challenge) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&(b"sn_bft-hello", WIRE_VERSION, challenge))?)
}

/// Answer to a connection challenge: proves the sender holds the key of
/// participant `voter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub voter: ParticipantIndex,
    pub sig: Signature,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub message: Message,
    pub voter: ParticipantIndex,
    pub sig: Signature,
}

impl Debug for SignedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.message, self.voter)
    }
}

/// Signs, verifies and frames protocol messages for one local participant.
pub struct MessageCodec {
    participants: Arc<ParticipantSet>,
    capabilities: Arc<dyn StateCapabilities>,
    secret_key: SecretKey,
    index: ParticipantIndex,
    max_message_size: usize,
}

impl Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("index", &self.index)
            .field("participants", &self.participants.len())
            .field("max_message_size", &self.max_message_size)
            .finish()
    }
}

impl MessageCodec {
    pub fn new(
        participants: Arc<ParticipantSet>,
        capabilities: Arc<dyn StateCapabilities>,
        secret_key: SecretKey,
        max_message_size: usize,
    ) -> std::result::Result<Self, ConfigError> {
        let public_key = secret_key.public_key();
        let index = participants
            .index_of(&public_key)
            .ok_or(ConfigError::NotAParticipant(public_key))?;
        Ok(Self {
            participants,
            capabilities,
            secret_key,
            index,
            max_message_size,
        })
    }

    pub fn index(&self) -> ParticipantIndex {
        self.index
    }

    pub fn participants(&self) -> &ParticipantSet {
        &self.participants
    }

    pub fn capabilities(&self) -> &dyn StateCapabilities {
        self.capabilities.as_ref()
    }

    pub fn sign(&self, message: Message) -> Result<SignedMessage> {
        let payload = signing_payload(
            message.height(),
            message.round(),
            message.phase(),
            message.digest(self.capabilities()),
        )?;
        Ok(SignedMessage {
            sig: self.secret_key.sign(&payload),
            voter: self.index,
            message,
        })
    }

    /// Checks the outer signature against the claimed participant's key.
    /// Certificates carried inside the message are checked by the caller.
    pub fn verify(&self, signed: &SignedMessage) -> Result<()> {
        let public_key = self.participants.get(signed.voter)?;
        let message = &signed.message;
        let payload = signing_payload(
            message.height(),
            message.round(),
            message.phase(),
            message.digest(self.capabilities()),
        )?;
        if public_key.verify(&signed.sig, &payload) {
            Ok(())
        } else {
            Err(Error::InvalidSignature {
                voter: signed.voter,
            })
        }
    }

    fn wire_options(&self) -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(self.max_message_size as u64)
    }

    /// `[WIRE_VERSION] ++ bincode(signed)`
    pub fn encode(&self, signed: &SignedMessage) -> Result<Vec<u8>> {
        let body = self.wire_options().serialize(signed)?;
        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(WIRE_VERSION);
        frame.extend(body);
        if frame.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }
        Ok(frame)
    }

    pub fn decode(&self, frame: &[u8]) -> Result<SignedMessage> {
        let body = self.unframe(frame)?;
        Ok(self.wire_options().deserialize(body)?)
    }

    fn unframe<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        if frame.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max: self.max_message_size,
            });
        }
        match frame.split_first() {
            Some((&WIRE_VERSION, body)) => Ok(body),
            Some((&found, _)) => Err(Error::UnsupportedVersion {
                found,
                expected: WIRE_VERSION,
            }),
            None => Err(Error::UnsupportedVersion {
                found: 0,
                expected: WIRE_VERSION,
            }),
        }
    }

    /// Frame signing the challenge a freshly connected participant sent us.
    pub fn answer_challenge(&self, challenge: &Challenge) -> Result<Vec<u8>> {
        let hello = Hello {
            voter: self.index,
            sig: self.secret_key.sign(challenge_payload(challenge)?),
        };
        let mut frame = vec![WIRE_VERSION];
        frame.extend(self.wire_options().serialize(&hello)?);
        Ok(frame)
    }

    /// Checks the answer to our `challenge`, returning who answered. An
    /// answer claiming to be ourselves is our own signature reflected back.
    pub fn verify_answer(
        &self,
        frame: &[u8],
        challenge: &Challenge,
    ) -> Result<(ParticipantIndex, PublicKey)> {
        let hello: Hello = self.wire_options().deserialize(self.unframe(frame)?)?;
        if hello.voter == self.index {
            return Err(Error::InvalidHandshake("peer answered as ourselves"));
        }
        let public_key = *self.participants.get(hello.voter)?;
        if public_key.verify(&hello.sig, challenge_payload(challenge)?) {
            Ok((hello.voter, public_key))
        } else {
            Err(Error::InvalidSignature { voter: hello.voter })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cmp::Ordering;

    struct Sum;

    impl StateCapabilities for Sum {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        fn validate(&self, _state: &[u8]) -> bool {
            true
        }
        fn hash(&self, state: &[u8]) -> StateHash {
            let mut hash = [0u8; 32];
            for (i, b) in state.iter().enumerate() {
                hash[i % 32] = hash[i % 32].wrapping_add(*b);
            }
            StateHash(hash)
        }
    }

    fn codecs(n: usize) -> Vec<MessageCodec> {
        let keys = Vec::from_iter((0..n).map(|_| SecretKey::random()));
        let participants = Arc::new(
            ParticipantSet::new(Vec::from_iter(keys.iter().map(SecretKey::public_key))).unwrap(),
        );
        Vec::from_iter(keys.into_iter().map(|sk| {
            MessageCodec::new(participants.clone(), Arc::new(Sum), sk, 1024 * 1024).unwrap()
        }))
    }

    #[test]
    fn test_signed_vote_survives_the_wire() {
        let codecs = codecs(4);
        let signed = codecs[2]
            .sign(Message::PreVote {
                height: 1,
                round: 3,
                hash: StateHash([7; 32]),
            })
            .unwrap();
        let frame = codecs[2].encode(&signed).unwrap();
        assert_eq!(frame[0], WIRE_VERSION);

        let decoded = codecs[0].decode(&frame).unwrap();
        assert_eq!(decoded, signed);
        assert!(codecs[0].verify(&decoded).is_ok());
    }

    #[test]
    fn test_tampered_message_fails_verification() {
        let codecs = codecs(4);
        let mut signed = codecs[1]
            .sign(Message::Proposal {
                height: 1,
                round: 0,
                state: b"block".to_vec(),
                justification: None,
            })
            .unwrap();
        if let Message::Proposal { state, .. } = &mut signed.message {
            state.push(1);
        }
        assert!(matches!(
            codecs[0].verify(&signed),
            Err(Error::InvalidSignature { voter: 1 })
        ));
    }

    #[test]
    fn test_impersonation_fails_verification() {
        let codecs = codecs(4);
        let mut signed = codecs[1]
            .sign(Message::PreCommit {
                height: 1,
                round: 0,
                hash: StateHash([1; 32]),
            })
            .unwrap();
        signed.voter = 3;
        assert!(matches!(
            codecs[0].verify(&signed),
            Err(Error::InvalidSignature { voter: 3 })
        ));

        signed.voter = 9;
        assert!(matches!(
            codecs[0].verify(&signed),
            Err(Error::UnknownParticipant { index: 9, .. })
        ));
    }

    #[test]
    fn test_reject_unknown_wire_version_and_oversized_frames() {
        let codecs = codecs(4);
        assert!(matches!(
            codecs[0].decode(&[WIRE_VERSION + 1, 0, 0]),
            Err(Error::UnsupportedVersion { found, .. }) if found == WIRE_VERSION + 1
        ));
        assert!(matches!(
            codecs[0].decode(&vec![WIRE_VERSION; 2 * 1024 * 1024]),
            Err(Error::MessageTooLarge { .. })
        ));
        assert!(matches!(
            codecs[0].decode(&[WIRE_VERSION, 1, 2, 3]),
            Err(Error::Encoding(_))
        ));
    }

    #[test]
    fn test_challenge_answer_binds_the_answering_key() {
        let codecs = codecs(4);
        let challenge = [5u8; CHALLENGE_SIZE];
        let answer = codecs[2].answer_challenge(&challenge).unwrap();
        let (voter, public_key) = codecs[0].verify_answer(&answer, &challenge).unwrap();
        assert_eq!(voter, 2);
        assert_eq!(&public_key, codecs[0].participants().get(2).unwrap());

        // an answer recorded for another challenge proves nothing
        assert!(matches!(
            codecs[0].verify_answer(&answer, &[6u8; CHALLENGE_SIZE]),
            Err(Error::InvalidSignature { voter: 2 })
        ));

        // nor does our own answer reflected back at us
        let ours = codecs[0].answer_challenge(&challenge).unwrap();
        assert!(matches!(
            codecs[0].verify_answer(&ours, &challenge),
            Err(Error::InvalidHandshake(_))
        ));
    }
}
