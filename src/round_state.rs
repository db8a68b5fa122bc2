use core::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::{
    ConfirmedState, Decision, Error, Height, Lock, Message, MessageCodec, ParticipantIndex, Phase,
    Result, Round, SignedMessage, State, StateHash, Timing, VoteTally,
};

/// Where a height is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Idle,
    Propose,
    PreVote,
    PreCommit,
    Decided,
}

/// Identifies a timer: it only fires if the machine is still at this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Step {
    pub height: Height,
    pub round: Round,
    pub stage: Stage,
}

/// Side effects requested by the state machine; carried out by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Broadcast(SignedMessage),
    ScheduleTimeout { step: Step, after: Duration },
    Decide(Decision),
}

/// Drives one height to a decision through propose, pre-vote and pre-commit
/// rounds. Never touches the network or the clock, every effect is returned
/// as an [`Action`].
pub struct RoundState {
    codec: Arc<MessageCodec>,
    timing: Timing,
    round_lookahead: Round,
    height: Height,
    round: Round,
    stage: Stage,
    previous: Option<State>,
    candidate: Option<StateHash>,
    proposal_sent: bool,
    known: BTreeMap<StateHash, State>,
    proposals: BTreeMap<Round, BTreeMap<ParticipantIndex, StateHash>>,
    tally: VoteTally,
    round_changes: BTreeMap<Round, BTreeSet<ParticipantIndex>>,
    lock: Option<Lock>,
    decision: Option<Decision>,
}

impl core::fmt::Debug for RoundState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "RoundState(BFT-{} H{}R{} {:?} lock={:?})",
            self.id(),
            self.height,
            self.round,
            self.stage,
            self.lock.as_ref().map(|l| (l.hash(), l.round()))
        )
    }
}

impl RoundState {
    pub fn new(
        codec: Arc<MessageCodec>,
        timing: Timing,
        round_lookahead: Round,
        height: Height,
        previous: Option<State>,
    ) -> Self {
        Self {
            codec,
            timing,
            round_lookahead,
            height,
            round: 0,
            stage: Stage::Idle,
            previous,
            candidate: None,
            proposal_sent: false,
            known: Default::default(),
            proposals: Default::default(),
            tally: VoteTally::new(height),
            round_changes: Default::default(),
            lock: None,
            decision: None,
        }
    }

    pub fn id(&self) -> ParticipantIndex {
        self.codec.index()
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn step(&self) -> Step {
        Step {
            height: self.height,
            round: self.round,
            stage: self.stage,
        }
    }

    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    /// Whether a local candidate was already proposed for this height.
    pub fn has_candidate(&self) -> bool {
        self.candidate.is_some()
    }

    /// Enters round 0. Does nothing once started.
    pub fn start(&mut self) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if self.stage == Stage::Idle {
            info!("[BFT-{}] starting height {}", self.id(), self.height);
            self.enter_round(0, &mut actions)?;
            self.check_progress(&mut actions)?;
        }
        Ok(actions)
    }

    /// Seeds the local candidate. Before `start` it is only stored.
    pub fn propose(&mut self, state: State) -> Result<Vec<Action>> {
        if self.stage == Stage::Decided {
            return Err(Error::AlreadyDecided {
                height: self.height,
            });
        }
        let hash = self.validate_candidate(&state)?;
        info!("[BFT-{}] proposing {:?} for height {}", self.id(), hash, self.height);
        self.candidate = Some(hash);
        self.known.insert(hash, state);

        let mut actions = Vec::new();
        if self.stage != Stage::Idle {
            self.broadcast_proposal(&mut actions)?;
            self.check_progress(&mut actions)?;
        }
        Ok(actions)
    }

    pub fn on_message(&mut self, signed: SignedMessage) -> Result<Vec<Action>> {
        self.codec.verify(&signed)?;

        let height = signed.message.height();
        if height < self.height {
            return Err(Error::StaleHeight {
                height,
                current: self.height,
            });
        }
        if height > self.height {
            return Err(Error::FutureHeight {
                height,
                current: self.height,
            });
        }

        let mut actions = Vec::new();
        if matches!(signed.message, Message::Decide { .. }) {
            self.handle_decide(&signed.message, &mut actions)?;
            return Ok(actions);
        }
        if self.stage == Stage::Decided {
            return Ok(actions);
        }

        let round = signed.message.round();
        if round < self.round {
            return Err(Error::StaleRound {
                round,
                current: self.round,
            });
        }
        if round > self.round.saturating_add(self.round_lookahead) {
            return Err(Error::RoundTooFarAhead {
                round,
                current: self.round,
                lookahead: self.round_lookahead,
            });
        }

        match &signed.message {
            Message::Proposal {
                state,
                justification,
                ..
            } => {
                self.validate_candidate(state)?;
                if let Some(certificate) = justification {
                    self.consider_lock(Lock {
                        state: state.clone(),
                        certificate: certificate.clone(),
                    })?;
                }
            }
            Message::RoundChange {
                lock: Some(lock), ..
            } => self.consider_lock(lock.clone())?,
            _ => (),
        }

        debug!("[BFT-{}] handling {:?}", self.id(), signed);
        self.record(&signed);
        self.forget_unreferenced();
        self.check_progress(&mut actions)?;
        Ok(actions)
    }

    pub fn on_timeout(&mut self, step: Step) -> Result<Vec<Action>> {
        let mut actions = Vec::new();
        if step != self.step() {
            debug!("[BFT-{}] ignoring stale timer {:?}", self.id(), step);
            return Ok(actions);
        }

        debug!("[BFT-{}] timeout at {:?}", self.id(), step);
        match self.stage {
            Stage::Propose if self.prevote_target().is_some() => self.enter_prevote(&mut actions)?,
            Stage::Propose | Stage::PreVote | Stage::PreCommit => {
                self.round_change(self.round + 1, &mut actions)?
            }
            Stage::Idle | Stage::Decided => (),
        }
        self.check_progress(&mut actions)?;
        Ok(actions)
    }

    fn validate_candidate(&self, state: &[u8]) -> Result<StateHash> {
        let capabilities = self.codec.capabilities();
        if !capabilities.validate(state) {
            return Err(Error::InvalidState);
        }
        if let Some(previous) = &self.previous {
            if capabilities.compare(previous, state) == Ordering::Equal {
                return Err(Error::InvalidState);
            }
        }
        Ok(capabilities.hash(state))
    }

    /// Adopts a verified pre-vote certificate if it is newer than our lock.
    fn consider_lock(&mut self, lock: Lock) -> Result<()> {
        lock.verify(
            self.height,
            self.codec.participants(),
            self.codec.capabilities(),
        )?;
        self.known
            .entry(lock.hash())
            .or_insert_with(|| lock.state.clone());

        let supersedes = match &self.lock {
            Some(ours) => lock.round() > ours.round(),
            None => true,
        };
        if supersedes {
            info!(
                "[BFT-{}] adopting lock on {:?} from round {}",
                self.id(),
                lock.hash(),
                lock.round()
            );
            self.lock = Some(lock);
        }
        Ok(())
    }

    fn record(&mut self, signed: &SignedMessage) {
        match &signed.message {
            Message::Proposal { round, state, .. } => {
                let hash = self.codec.capabilities().hash(state);
                self.known.entry(hash).or_insert_with(|| state.clone());
                self.proposals
                    .entry(*round)
                    .or_default()
                    .insert(signed.voter, hash);
            }
            Message::PreVote { .. } | Message::PreCommit { .. } => {
                self.tally.insert(signed);
            }
            Message::RoundChange { round, .. } => {
                self.round_changes
                    .entry(*round)
                    .or_default()
                    .insert(signed.voter);
            }
            Message::Decide { .. } => (),
        }
    }

    /// Drops every state no candidate, lock, proposal or vote refers to any
    /// more. A participant can thus pin at most one state per round.
    fn forget_unreferenced(&mut self) {
        let mut referenced = self.tally.hashes();
        referenced.extend(self.candidate);
        referenced.extend(self.lock.as_ref().map(Lock::hash));
        referenced.extend(
            self.proposals
                .values()
                .flat_map(|by_voter| by_voter.values().copied()),
        );
        self.known.retain(|hash, _| referenced.contains(hash));
    }

    /// Signs a message, counts it as received from ourselves and queues it
    /// for everyone else.
    fn broadcast(&mut self, message: Message, actions: &mut Vec<Action>) -> Result<()> {
        let signed = self.codec.sign(message)?;
        self.record(&signed);
        actions.push(Action::Broadcast(signed));
        Ok(())
    }

    fn schedule(&self, actions: &mut Vec<Action>) {
        actions.push(Action::ScheduleTimeout {
            step: self.step(),
            after: self.timing.timeout(self.round),
        });
    }

    /// Our candidate and everything proposed in the current round.
    fn round_candidates(&self) -> BTreeSet<StateHash> {
        let proposed = self
            .proposals
            .get(&self.round)
            .into_iter()
            .flat_map(|by_voter| by_voter.values().copied());
        BTreeSet::from_iter(self.candidate.into_iter().chain(proposed))
    }

    /// The lock if we hold one, else the lowest hash candidate of this round.
    fn prevote_target(&self) -> Option<StateHash> {
        match &self.lock {
            Some(lock) => Some(lock.hash()),
            None => self.round_candidates().into_iter().next(),
        }
    }

    fn enter_round(&mut self, round: Round, actions: &mut Vec<Action>) -> Result<()> {
        info!(
            "[BFT-{}] entering round {} of height {}",
            self.id(),
            round,
            self.height
        );
        self.round = round;
        self.stage = Stage::Propose;
        self.proposal_sent = false;
        self.tally.prune_below(round);
        self.proposals = self.proposals.split_off(&round);
        self.round_changes = self.round_changes.split_off(&round);

        self.broadcast_proposal(actions)?;
        self.forget_unreferenced();
        self.schedule(actions);
        Ok(())
    }

    fn broadcast_proposal(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        if self.proposal_sent {
            return Ok(());
        }
        // with nothing of our own this round, relay the lowest state we know
        let (state, justification) = match &self.lock {
            Some(lock) => (lock.state.clone(), Some(lock.certificate.clone())),
            None => {
                let hash = self
                    .prevote_target()
                    .or_else(|| self.known.keys().next().copied());
                match hash.and_then(|hash| self.known.get(&hash)) {
                    Some(state) => (state.clone(), None),
                    None => return Ok(()),
                }
            }
        };
        self.proposal_sent = true;
        self.broadcast(
            Message::Proposal {
                height: self.height,
                round: self.round,
                state,
                justification,
            },
            actions,
        )
    }

    fn enter_prevote(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        self.stage = Stage::PreVote;
        match self.prevote_target() {
            Some(hash) => {
                info!("[BFT-{}] pre-voting {:?} in round {}", self.id(), hash, self.round);
                self.broadcast(
                    Message::PreVote {
                        height: self.height,
                        round: self.round,
                        hash,
                    },
                    actions,
                )?;
            }
            None => debug!("[BFT-{}] nothing to pre-vote for", self.id()),
        }
        self.schedule(actions);
        Ok(())
    }

    fn enter_precommit(&mut self, hash: StateHash, actions: &mut Vec<Action>) -> Result<()> {
        self.stage = Stage::PreCommit;
        let quorum = self.codec.participants().quorum();
        let certificate = self
            .tally
            .certificate(self.round, Phase::PreVote, &hash, quorum);
        if let (Some(state), Some(certificate)) = (self.known.get(&hash), certificate) {
            let relock = match &self.lock {
                Some(lock) => lock.round() <= self.round,
                None => true,
            };
            if relock {
                self.lock = Some(Lock {
                    state: state.clone(),
                    certificate,
                });
            }
        }

        info!(
            "[BFT-{}] locked on {:?}, pre-committing in round {}",
            self.id(),
            hash,
            self.round
        );
        self.broadcast(
            Message::PreCommit {
                height: self.height,
                round: self.round,
                hash,
            },
            actions,
        )?;
        self.schedule(actions);
        Ok(())
    }

    fn round_change(&mut self, round: Round, actions: &mut Vec<Action>) -> Result<()> {
        info!(
            "[BFT-{}] moving from round {} to {}",
            self.id(),
            self.round,
            round
        );
        self.broadcast(
            Message::RoundChange {
                height: self.height,
                round,
                lock: self.lock.clone(),
            },
            actions,
        )?;
        self.enter_round(round, actions)
    }

    fn finalize(&mut self, decision: Decision, actions: &mut Vec<Action>) -> Result<()> {
        info!(
            "[BFT-{}] decided {:?} at height {} round {}",
            self.id(),
            decision.hash(),
            decision.height(),
            decision.confirmed.round
        );
        self.stage = Stage::Decided;
        self.decision = Some(decision.clone());
        let announcement = decision.to_message();
        actions.push(Action::Decide(decision));
        self.broadcast(announcement, actions)
    }

    fn handle_decide(&mut self, message: &Message, actions: &mut Vec<Action>) -> Result<()> {
        if let Some(ours) = &self.decision {
            return ours.check_agreement(
                message,
                self.codec.participants(),
                self.codec.capabilities(),
            );
        }
        if let Some(decision) =
            Decision::from_message(message, self.codec.participants(), self.codec.capabilities())?
        {
            self.known
                .entry(decision.hash())
                .or_insert_with(|| decision.confirmed.state.clone());
            self.finalize(decision, actions)?;
        }
        Ok(())
    }

    /// Applies every transition the collected messages allow, until none is left.
    fn check_progress(&mut self, actions: &mut Vec<Action>) -> Result<()> {
        loop {
            if matches!(self.stage, Stage::Idle | Stage::Decided) {
                return Ok(());
            }
            let participants = self.codec.participants();
            let quorum = participants.quorum();
            let max_faulty = participants.max_faulty();
            let n = participants.len();

            let committed = self
                .tally
                .find_quorums(Phase::PreCommit, quorum)
                .into_iter()
                .find(|(round, hash)| *round >= self.round && self.known.contains_key(hash));
            if let Some((round, hash)) = committed {
                if let (Some(state), Some(certificate)) = (
                    self.known.get(&hash),
                    self.tally.certificate(round, Phase::PreCommit, &hash, quorum),
                ) {
                    let decision = Decision {
                        confirmed: ConfirmedState {
                            height: self.height,
                            round,
                            state: state.clone(),
                        },
                        certificate,
                    };
                    return self.finalize(decision, actions);
                }
            }

            // f + 1 participants moved past us, at least one of them honest.
            let jump = self
                .round_changes
                .iter()
                .rev()
                .find(|(round, voters)| **round > self.round && voters.len() > max_faulty)
                .map(|(round, _)| *round);
            if let Some(round) = jump {
                self.round_change(round, actions)?;
                continue;
            }

            if self.stage == Stage::Propose && !self.proposal_sent && !self.known.is_empty() {
                self.broadcast_proposal(actions)?;
                continue;
            }

            if matches!(self.stage, Stage::Propose | Stage::PreVote) {
                if let Some(hash) = self.tally.quorum(self.round, Phase::PreVote, quorum) {
                    let blocked = match &self.lock {
                        Some(lock) => lock.round() > self.round && lock.hash() != hash,
                        None => false,
                    };
                    if self.known.contains_key(&hash) && !blocked {
                        self.enter_precommit(hash, actions)?;
                        continue;
                    }
                }
            }

            if self.stage == Stage::Propose {
                let proposers = self
                    .proposals
                    .get(&self.round)
                    .map(BTreeMap::len)
                    .unwrap_or_default();
                if proposers == n {
                    self.enter_prevote(actions)?;
                    continue;
                }
            }

            return Ok(());
        }
    }
}
