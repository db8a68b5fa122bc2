use core::fmt::{self, Debug};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    ConfigError, Height, ParticipantSet, PublicKey, Round, SecretKey, State,
    StateCapabilities, MINIMUM_PARTICIPANTS,
};

/// Round timer parameters. The timeout of round `r` is
/// `initial_timeout * backoff_multiplier^r`, capped at `max_timeout`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub initial_timeout: Duration,
    pub backoff_multiplier: f64,
    pub max_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl Timing {
    pub fn timeout(&self, round: Round) -> Duration {
        let exponent = i32::try_from(round).unwrap_or(i32::MAX);
        let secs = self.initial_timeout.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_timeout.as_secs_f64() {
            self.max_timeout
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.initial_timeout.is_zero() {
            return Err(ConfigError::InvalidTiming("initial timeout must be non-zero"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidTiming(
                "backoff multiplier must be a finite value >= 1.0",
            ));
        }
        if self.max_timeout < self.initial_timeout {
            return Err(ConfigError::InvalidTiming(
                "max timeout must not be below the initial timeout",
            ));
        }
        Ok(())
    }
}

/// Resource bounds of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Candidates queued by `propose` for heights after the current one.
    pub max_pending_proposals: usize,
    /// Outbound frames buffered per peer before new frames are dropped.
    pub peer_queue_capacity: usize,
    /// Largest accepted wire frame.
    pub max_message_size: usize,
    /// How far ahead of the current round a message may be.
    pub round_lookahead: Round,
    /// Messages for the next height buffered until that height starts.
    pub future_message_limit: usize,
    /// Recent decisions kept to answer participants behind us.
    pub decision_history: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pending_proposals: 16,
            peer_queue_capacity: 1024,
            max_message_size: 8 * 1024 * 1024,
            round_lookahead: 64,
            future_message_limit: 4096,
            decision_history: 64,
        }
    }
}

impl Limits {
    fn verify(&self) -> Result<(), ConfigError> {
        if self.peer_queue_capacity == 0 {
            return Err(ConfigError::InvalidLimits("peer queue capacity must be non-zero"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::InvalidLimits("max message size must be non-zero"));
        }
        if self.round_lookahead == 0 {
            return Err(ConfigError::InvalidLimits("round lookahead must be non-zero"));
        }
        if self.decision_history == 0 {
            return Err(ConfigError::InvalidLimits("decision history must be non-zero"));
        }
        Ok(())
    }
}

/// Everything the host supplies before the protocol starts.
#[derive(Clone)]
pub struct Config {
    /// Starting time point of the consensus group.
    pub epoch: SystemTime,
    /// Last decided height, the agent works on `current_height + 1` first.
    pub current_height: Height,
    /// State decided at `current_height`.
    pub current_state: Option<State>,
    pub private_key: Option<SecretKey>,
    /// Public keys of the consensus group, in participant index order.
    pub participants: Vec<PublicKey>,
    pub capabilities: Option<Arc<dyn StateCapabilities>>,
    pub timing: Timing,
    pub limits: Limits,
}

impl Config {
    pub fn new(
        participants: Vec<PublicKey>,
        private_key: SecretKey,
        current_state: State,
        capabilities: Arc<dyn StateCapabilities>,
    ) -> Self {
        Self {
            epoch: SystemTime::now(),
            current_height: 0,
            current_state: Some(current_state),
            private_key: Some(private_key),
            participants,
            capabilities: Some(capabilities),
            timing: Timing::default(),
            limits: Limits::default(),
        }
    }

    /// Checks every field, failing on the first missing or invalid one.
    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.epoch == UNIX_EPOCH {
            return Err(ConfigError::MissingEpoch);
        }
        if self.current_state.is_none() {
            return Err(ConfigError::MissingState);
        }
        if self.current_height == Height::MAX {
            return Err(ConfigError::HeightExhausted);
        }
        if self.capabilities.is_none() {
            return Err(ConfigError::MissingCapabilities);
        }
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(ConfigError::MissingPrivateKey)?;
        if self.participants.len() < MINIMUM_PARTICIPANTS {
            return Err(ConfigError::TooFewParticipants {
                found: self.participants.len(),
                minimum: MINIMUM_PARTICIPANTS,
            });
        }
        self.timing.verify()?;
        self.limits.verify()?;

        let participants = ParticipantSet::new(self.participants.clone())?;
        let public_key = private_key.public_key();
        if participants.index_of(&public_key).is_none() {
            return Err(ConfigError::NotAParticipant(public_key));
        }
        Ok(())
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("epoch", &self.epoch)
            .field("current_height", &self.current_height)
            .field("current_state", &self.current_state.as_ref().map(Vec::len))
            .field("has_private_key", &self.private_key.is_some())
            .field("participants", &self.participants.len())
            .field("has_capabilities", &self.capabilities.is_some())
            .field("timing", &self.timing)
            .field("limits", &self.limits)
            .finish()
    }
}

/// Free standing form of [`Config::verify`].
pub fn verify_config(config: &Config) -> Result<(), ConfigError> {
    config.verify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateHash;
    use core::cmp::Ordering;

    struct Bytes;

    impl StateCapabilities for Bytes {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        fn validate(&self, _state: &[u8]) -> bool {
            true
        }
        fn hash(&self, state: &[u8]) -> StateHash {
            let mut hash = [0u8; 32];
            for (i, b) in state.iter().enumerate() {
                hash[i % 32] ^= b;
            }
            StateHash(hash)
        }
    }

    fn config(n: usize) -> Config {
        let keys = Vec::from_iter((0..n).map(|_| SecretKey::random()));
        Config::new(
            Vec::from_iter(keys.iter().map(SecretKey::public_key)),
            keys[0].clone(),
            b"genesis".to_vec(),
            Arc::new(Bytes),
        )
    }

    #[test]
    fn test_valid_config_passes() {
        let config = config(4);
        assert_eq!(config.verify(), Ok(()));
    }

    #[test]
    fn test_three_participants_fail_before_anything_else() {
        assert_eq!(
            verify_config(&config(3)),
            Err(ConfigError::TooFewParticipants {
                found: 3,
                minimum: MINIMUM_PARTICIPANTS
            })
        );
    }

    #[test]
    fn test_each_missing_field_has_its_own_error() {
        let mut c = config(4);
        c.epoch = UNIX_EPOCH;
        assert_eq!(c.verify(), Err(ConfigError::MissingEpoch));

        let mut c = config(4);
        c.current_state = None;
        assert_eq!(c.verify(), Err(ConfigError::MissingState));

        let mut c = config(4);
        c.capabilities = None;
        assert_eq!(c.verify(), Err(ConfigError::MissingCapabilities));

        let mut c = config(4);
        c.private_key = None;
        assert_eq!(c.verify(), Err(ConfigError::MissingPrivateKey));

        let mut c = config(4);
        c.current_height = Height::MAX;
        assert_eq!(c.verify(), Err(ConfigError::HeightExhausted));

        let mut c = config(4);
        c.limits.decision_history = 0;
        assert!(matches!(c.verify(), Err(ConfigError::InvalidLimits(_))));
    }

    #[test]
    fn test_local_key_must_be_a_participant() {
        let mut c = config(4);
        let outsider = SecretKey::random();
        c.private_key = Some(outsider.clone());
        assert_eq!(
            c.verify(),
            Err(ConfigError::NotAParticipant(outsider.public_key()))
        );
    }

    #[test]
    fn test_invalid_timing_is_rejected() {
        let mut c = config(4);
        c.timing.backoff_multiplier = 0.5;
        assert!(matches!(c.verify(), Err(ConfigError::InvalidTiming(_))));

        let mut c = config(4);
        c.timing.initial_timeout = Duration::ZERO;
        assert!(matches!(c.verify(), Err(ConfigError::InvalidTiming(_))));
    }

    #[test]
    fn test_timeout_backs_off_up_to_the_cap() {
        let timing = Timing {
            initial_timeout: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_timeout: Duration::from_secs(1),
        };
        assert_eq!(timing.timeout(0), Duration::from_millis(100));
        assert_eq!(timing.timeout(1), Duration::from_millis(200));
        assert_eq!(timing.timeout(3), Duration::from_millis(800));
        assert_eq!(timing.timeout(4), Duration::from_secs(1));
        assert_eq!(timing.timeout(u64::MAX), Duration::from_secs(1));
    }
}
