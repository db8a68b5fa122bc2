use thiserror::Error;

use crate::{Height, ParticipantIndex, PublicKey, Round, StateHash};

/// Problems with the host supplied [`Config`](crate::Config), detected before
/// any protocol activity starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("The consensus epoch must be a non-zero start time")]
    MissingEpoch,
    #[error("The current state must be provided")]
    MissingState,
    #[error("State capabilities (compare, validate, hash) must be provided")]
    MissingCapabilities,
    #[error("A private key must be provided")]
    MissingPrivateKey,
    #[error("At least {minimum} participants are required, found {found}")]
    TooFewParticipants { found: usize, minimum: usize },
    #[error("Participant {0:?} appears more than once")]
    DuplicateParticipant(PublicKey),
    #[error("Our public key {0:?} is not one of the participants")]
    NotAParticipant(PublicKey),
    #[error("Invalid timing: {0}")]
    InvalidTiming(&'static str),
    #[error("Invalid limits: {0}")]
    InvalidLimits(&'static str),
    #[error("The current height leaves no height to work on")]
    HeightExhausted,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("We experienced an IO error")]
    IO(#[from] std::io::Error),
    #[error("Failed to encode with bincode")]
    Encoding(#[from] bincode::Error),
    #[error("Unsupported wire version {found}, we speak {expected}")]
    UnsupportedVersion { found: u8, expected: u8 },
    #[error("Message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Participant index {index} is outside the participant set of {participants}")]
    UnknownParticipant {
        index: ParticipantIndex,
        participants: usize,
    },
    #[error("Signature from participant {voter} is not valid")]
    InvalidSignature { voter: ParticipantIndex },
    #[error("The state was rejected by the host validator")]
    InvalidState,
    #[error("Invalid quorum certificate: {0}")]
    InvalidCertificate(&'static str),
    #[error("Message for height {height} is behind our height {current}")]
    StaleHeight { height: Height, current: Height },
    #[error("Message for height {height} is ahead of our height {current}")]
    FutureHeight { height: Height, current: Height },
    #[error("Message for round {round} is behind our round {current}")]
    StaleRound { round: Round, current: Round },
    #[error("Message for round {round} is more than {lookahead} rounds ahead of {current}")]
    RoundTooFarAhead {
        round: Round,
        current: Round,
        lookahead: Round,
    },
    #[error("Height {height} has already been decided")]
    AlreadyDecided { height: Height },
    #[error("Already holding {limit} pending proposals")]
    TooManyPendingProposals { limit: usize },
    #[error("Peer connection is closed")]
    PeerClosed,
    #[error("Connection handshake failed: {0}")]
    InvalidHandshake(&'static str),
    #[error("No height is left after height {height}")]
    HeightExhausted { height: Height },
    #[error("Two certificates at height {height} certify different states: {ours} != {theirs}")]
    ConflictingDecision {
        height: Height,
        ours: StateHash,
        theirs: StateHash,
    },
    #[error("The agent has shut down")]
    Shutdown,
}

impl Error {
    /// Fatal errors halt the agent; everything else only drops the offending
    /// message or peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConflictingDecision { .. }
                | Error::HeightExhausted { .. }
                | Error::Shutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
