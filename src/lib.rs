//! Leaderless Byzantine fault tolerant agreement on an opaque state.
//!
//! A fixed set of `n = 3f + 1` participants, each identified by a BLS public key,
//! decide one state per height. Every height is driven by a [`RoundState`] through
//! propose, pre-vote and pre-commit phases; a quorum of `⌊2n/3⌋ + 1` matching
//! pre-commits forms a [`QuorumCertificate`] and yields a [`ConfirmedState`].
//!
//! The [`Agent`] binds transport connections to the state machine and exposes
//! `propose`/`wait` to the host application.

pub mod agent;
pub mod certificate;
pub mod config;
pub mod decision;
pub mod error;
pub mod message;
pub mod participants;
pub mod peer;
pub mod round_state;
pub mod state;
pub mod vote_count;

pub use blsttc::{PublicKey, SecretKey, Signature};

pub use agent::Agent;
pub use certificate::{Lock, QuorumCertificate};
pub use config::{verify_config, Config, Limits, Timing};
pub use decision::{ConfirmedState, Decision};
pub use error::{ConfigError, Error, Result};
pub use message::{
    Challenge, Hello, Message, MessageCodec, Phase, SignedMessage, CHALLENGE_SIZE, WIRE_VERSION,
};
pub use participants::{ParticipantSet, MINIMUM_PARTICIPANTS};
pub use peer::{PeerHandle, PeerId, PeerStream};
pub use round_state::{Action, RoundState, Stage, Step};
pub use state::{State, StateCapabilities, StateHash, STATE_HASH_SIZE};
pub use vote_count::VoteTally;

/// Index of one agreed decision.
pub type Height = u64;
/// Sub-step counter within a height.
pub type Round = u64;
/// Stable position of a participant inside the [`ParticipantSet`].
pub type ParticipantIndex = usize;
