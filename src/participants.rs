use std::collections::BTreeSet;

use crate::{ConfigError, Error, ParticipantIndex, PublicKey, Result};

/// Smallest group that tolerates one Byzantine participant (`n = 3f + 1`).
pub const MINIMUM_PARTICIPANTS: usize = 4;

/// The ordered public keys of the consensus group for the active height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSet {
    keys: Vec<PublicKey>,
}

impl ParticipantSet {
    pub fn new(keys: Vec<PublicKey>) -> std::result::Result<Self, ConfigError> {
        if keys.len() < MINIMUM_PARTICIPANTS {
            return Err(ConfigError::TooFewParticipants {
                found: keys.len(),
                minimum: MINIMUM_PARTICIPANTS,
            });
        }

        let mut seen = BTreeSet::new();
        for key in keys.iter() {
            if !seen.insert(key) {
                return Err(ConfigError::DuplicateParticipant(*key));
            }
        }

        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of matching votes needed to certify anything: `⌊2n/3⌋ + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.keys.len() / 3 + 1
    }

    /// Largest number of Byzantine participants we can tolerate: `⌊(n - 1)/3⌋`.
    pub fn max_faulty(&self) -> usize {
        (self.keys.len() - 1) / 3
    }

    pub fn get(&self, index: ParticipantIndex) -> Result<&PublicKey> {
        self.keys.get(index).ok_or(Error::UnknownParticipant {
            index,
            participants: self.keys.len(),
        })
    }

    pub fn index_of(&self, public_key: &PublicKey) -> Option<ParticipantIndex> {
        self.keys.iter().position(|k| k == public_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParticipantIndex, &PublicKey)> {
        self.keys.iter().enumerate()
    }
}
