use core::cmp::Ordering;
use core::fmt::{self, Debug, Display};

use serde::{Deserialize, Serialize};

pub const STATE_HASH_SIZE: usize = 32;

/// The opaque value participants agree on.
pub type State = Vec<u8>;

/// Fixed size digest identifying a [`State`]; only ever produced by the host
/// hasher. Ordering is lexical over the bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateHash(pub [u8; STATE_HASH_SIZE]);

impl From<[u8; STATE_HASH_SIZE]> for StateHash {
    fn from(bytes: [u8; STATE_HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", hex::encode(&self.0[..4]))
    }
}

impl Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Host supplied operations over states. The core never looks inside a state
/// other than through these.
pub trait StateCapabilities: Send + Sync {
    /// Total order between two states, `Equal` when they are the same state.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Integrity check of a candidate state.
    fn validate(&self, state: &[u8]) -> bool;

    /// Digest uniquely identifying a state.
    fn hash(&self, state: &[u8]) -> StateHash;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hash_orders_lexically() {
        let mut low = [0u8; STATE_HASH_SIZE];
        let mut high = [0u8; STATE_HASH_SIZE];
        low[0] = 1;
        high[0] = 2;
        low[31] = 0xff;
        assert!(StateHash(low) < StateHash(high));
    }

    #[test]
    fn test_state_hash_display_is_full_hex() {
        let hash = StateHash([0xab; STATE_HASH_SIZE]);
        assert_eq!(hash.to_string(), "ab".repeat(STATE_HASH_SIZE));
        assert_eq!(format!("{:?}", hash), "#abababab");
    }
}
