use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::peer::{self, PeerEvent};
use crate::{
    Action, Config, ConfigError, ConfirmedState, Decision, Error, Height, Limits, Message,
    MessageCodec, ParticipantIndex, ParticipantSet, PeerHandle, PeerId, PeerStream, Result,
    RoundState, SignedMessage, State, StateHash, Step, Timing,
};

/// Own frames of the current height kept for peers that connect late.
const RECENT_FRAMES: usize = 16;

/// Time a new connection has to prove its identity.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
    Propose {
        state: State,
        reply: oneshot::Sender<Result<()>>,
    },
    AddPeer(PeerHandle),
}

/// Why no more decisions will be published.
#[derive(Debug, Clone, Copy)]
enum Terminal {
    Shutdown,
    Conflict {
        height: Height,
        ours: StateHash,
        theirs: StateHash,
    },
}

impl Terminal {
    fn to_error(self) -> Error {
        match self {
            Terminal::Shutdown => Error::Shutdown,
            Terminal::Conflict {
                height,
                ours,
                theirs,
            } => Error::ConflictingDecision {
                height,
                ours,
                theirs,
            },
        }
    }
}

#[derive(Default)]
struct Outcome {
    confirmed: Vec<ConfirmedState>,
    terminal: Option<Terminal>,
}

/// Confirmed states not yet handed to the host.
#[derive(Default)]
struct Decisions {
    outcome: Mutex<Outcome>,
    notify: Notify,
}

impl Decisions {
    async fn publish(&self, confirmed: ConfirmedState) {
        self.outcome.lock().await.confirmed.push(confirmed);
        self.notify.notify_waiters();
    }

    async fn terminate(&self, terminal: Terminal) {
        let mut outcome = self.outcome.lock().await;
        if outcome.terminal.is_none() {
            outcome.terminal = Some(terminal);
        }
        drop(outcome);
        self.notify.notify_waiters();
    }

    async fn wait(&self, shutdown: &CancellationToken) -> Result<Vec<ConfirmedState>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut outcome = self.outcome.lock().await;
                if let Some(terminal @ Terminal::Conflict { .. }) = outcome.terminal {
                    return Err(terminal.to_error());
                }
                if shutdown.is_cancelled() {
                    return Err(Error::Shutdown);
                }
                if !outcome.confirmed.is_empty() {
                    return Ok(std::mem::take(&mut outcome.confirmed));
                }
            }

            tokio::select! {
                _ = &mut notified => (),
                _ = shutdown.cancelled() => (),
            }
        }
    }
}

/// Everything needed to turn a raw connection into a registered peer.
#[derive(Clone)]
struct Registrar {
    codec: Arc<MessageCodec>,
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<PeerEvent>,
    next_peer: Arc<AtomicU64>,
    limits: Limits,
    shutdown: CancellationToken,
}

impl Registrar {
    /// Hands `conn` to a task that runs the handshake and then adds the
    /// peer. Returns at once, so both ends of a connection can register it
    /// one after the other.
    fn register<S: PeerStream>(&self, conn: S) -> Result<PeerId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(self.clone().authenticate(id, conn));
        Ok(id)
    }

    async fn authenticate<S: PeerStream>(self, id: PeerId, mut conn: S) {
        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            peer::handshake(&mut conn, &self.codec, self.limits.max_message_size),
        );
        let (voter, public_key) = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = handshake => match result {
                Ok(Ok(identity)) => identity,
                Ok(Err(err)) => {
                    warn!(
                        "[BFT-{}] handshake with peer {} failed: {}",
                        self.codec.index(),
                        id,
                        err
                    );
                    return;
                }
                Err(_) => {
                    warn!(
                        "[BFT-{}] handshake with peer {} timed out",
                        self.codec.index(),
                        id
                    );
                    return;
                }
            },
        };
        debug!("[BFT-{}] peer {} is participant {}", self.codec.index(), id, voter);

        let handle = peer::spawn(
            id,
            conn,
            public_key,
            self.limits.peer_queue_capacity,
            self.limits.max_message_size,
            self.events.clone(),
            self.shutdown.clone(),
        );
        let _ = self.commands.send(Command::AddPeer(handle)).await;
    }
}

/// A participant in the consensus group. Owns a background actor that
/// drives one [`RoundState`] per height and the connections to other
/// participants.
pub struct Agent {
    index: ParticipantIndex,
    registrar: Registrar,
    decisions: Arc<Decisions>,
    shutdown: CancellationToken,
}

impl Agent {
    /// Verifies `config` and spawns the agent's actor. Must be called from
    /// within a tokio runtime.
    pub fn start(config: Config) -> Result<Self> {
        config.verify()?;
        let private_key = config
            .private_key
            .clone()
            .ok_or(ConfigError::MissingPrivateKey)?;
        let capabilities = config
            .capabilities
            .clone()
            .ok_or(ConfigError::MissingCapabilities)?;
        let current_state = config
            .current_state
            .clone()
            .ok_or(ConfigError::MissingState)?;
        let participants = Arc::new(ParticipantSet::new(config.participants.clone())?);
        let codec = Arc::new(MessageCodec::new(
            participants,
            capabilities,
            private_key,
            config.limits.max_message_size,
        )?);
        let index = codec.index();
        let height = config
            .current_height
            .checked_add(1)
            .ok_or(ConfigError::HeightExhausted)?;

        let shutdown = CancellationToken::new();
        let (commands, command_rx) = mpsc::channel(config.limits.peer_queue_capacity);
        let (events, event_rx) = mpsc::channel(config.limits.peer_queue_capacity);
        let decisions = Arc::new(Decisions::default());

        info!(
            "[BFT-{}] starting at height {} with {} participants",
            index,
            height,
            config.participants.len()
        );
        let core = Core::new(
            codec.clone(),
            config.timing,
            config.limits,
            height,
            current_state,
            decisions.clone(),
            shutdown.clone(),
        );
        tokio::spawn(core.run(command_rx, event_rx));

        Ok(Self {
            index,
            registrar: Registrar {
                codec,
                commands,
                events,
                next_peer: Arc::new(AtomicU64::new(0)),
                limits: config.limits,
                shutdown: shutdown.clone(),
            },
            decisions,
            shutdown,
        })
    }

    /// Like [`Agent::start`], additionally accepting participants on `listener`.
    pub fn new(listener: TcpListener, config: Config) -> Result<Self> {
        let agent = Self::start(config)?;
        let registrar = agent.registrar.clone();
        let index = agent.index;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = registrar.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            info!("[BFT-{}] accepted connection from {}", index, addr);
                            if registrar.register(stream).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("[BFT-{}] failed to accept: {}", index, err),
                    },
                }
            }
        });
        Ok(agent)
    }

    pub fn index(&self) -> ParticipantIndex {
        self.index
    }

    /// Registers an established connection to another participant. The
    /// peer takes part once it proved which participant it is.
    pub async fn add_peer<S: PeerStream>(&self, conn: S) -> Result<PeerId> {
        self.registrar.register(conn)
    }

    /// Dials a participant over TCP and registers the connection.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerId> {
        let stream = TcpStream::connect(addr).await?;
        self.add_peer(stream).await
    }

    /// Offers a candidate state. It seeds the current height, or waits for a
    /// later one if we already proposed here.
    pub async fn propose(&self, state: State) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let (reply, response) = oneshot::channel();
        self.registrar
            .commands
            .send(Command::Propose { state, reply })
            .await
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Shutdown)?
    }

    /// Suspends until at least one state is confirmed, then returns every
    /// confirmed state not returned before, lowest height first.
    pub async fn wait(&self) -> Result<Vec<ConfirmedState>> {
        self.decisions.wait(&self.shutdown).await
    }

    pub fn shutdown(&self) {
        info!("[BFT-{}] shutting down", self.index);
        self.shutdown.cancel();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The single owner of the protocol state of an agent.
struct Core {
    codec: Arc<MessageCodec>,
    timing: Timing,
    limits: Limits,
    round_state: RoundState,
    peers: BTreeMap<PeerId, PeerHandle>,
    pending: VecDeque<State>,
    future: Vec<(PeerId, SignedMessage)>,
    recent: VecDeque<Vec<u8>>,
    /// Recent decisions with their signed `Decide` frame, by height.
    decided: BTreeMap<Height, (Decision, Vec<u8>)>,
    caught_up: BTreeSet<(PeerId, Height)>,
    timer: Option<(Step, Instant)>,
    decisions: Arc<Decisions>,
    shutdown: CancellationToken,
}

impl Core {
    fn new(
        codec: Arc<MessageCodec>,
        timing: Timing,
        limits: Limits,
        height: Height,
        current_state: State,
        decisions: Arc<Decisions>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            round_state: RoundState::new(
                codec.clone(),
                timing,
                limits.round_lookahead,
                height,
                Some(current_state),
            ),
            codec,
            timing,
            limits,
            peers: Default::default(),
            pending: Default::default(),
            future: Default::default(),
            recent: Default::default(),
            decided: Default::default(),
            caught_up: Default::default(),
            timer: None,
            decisions,
            shutdown,
        }
    }

    fn id(&self) -> ParticipantIndex {
        self.codec.index()
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<PeerEvent>,
    ) {
        let started = match self.round_state.start() {
            Ok(actions) => self.apply(actions).await,
            Err(err) => Err(err),
        };
        if let Err(err) = started {
            error!("[BFT-{}] failed to start: {}", self.id(), err);
            self.shutdown.cancel();
        }

        let sleep = sleep_until(Instant::now());
        tokio::pin!(sleep);

        loop {
            let deadline = self.timer.map(|(_, at)| at);
            if let Some(at) = deadline {
                sleep.as_mut().reset(at);
            }

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = commands.recv() => self.on_command(command).await,
                Some(event) = events.recv() => self.on_event(event).await,
                _ = &mut sleep, if deadline.is_some() => self.on_timer().await,
                else => break,
            };

            if let Err(err) = result {
                if let Error::ConflictingDecision {
                    height,
                    ours,
                    theirs,
                } = err
                {
                    error!("[BFT-{}] {}", self.id(), err);
                    self.decisions
                        .terminate(Terminal::Conflict {
                            height,
                            ours,
                            theirs,
                        })
                        .await;
                    break;
                }
                if err.is_fatal() {
                    error!("[BFT-{}] halting: {}", self.id(), err);
                    break;
                }
                debug!("[BFT-{}] {}", self.id(), err);
            }
        }

        self.shutdown.cancel();
        self.decisions.terminate(Terminal::Shutdown).await;
        info!("[BFT-{}] stopped at height {}", self.id(), self.round_state.height());
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Propose { state, reply } => {
                let result = self.propose(state).await;
                let _ = reply.send(result);
                Ok(())
            }
            Command::AddPeer(handle) => {
                info!(
                    "[BFT-{}] added peer {} ({:?})",
                    self.id(),
                    handle.id(),
                    handle.remote_addr()
                );
                let latest = self.decided.values().next_back().map(|(_, frame)| frame);
                for frame in latest.into_iter().chain(self.recent.iter()) {
                    handle.send(frame.clone())?;
                }
                self.peers.insert(handle.id(), handle);
                Ok(())
            }
        }
    }

    async fn propose(&mut self, state: State) -> Result<()> {
        if !self.round_state.has_candidate() {
            let actions = self.round_state.propose(state)?;
            return self.apply(actions).await;
        }

        if !self.codec.capabilities().validate(&state) {
            return Err(Error::InvalidState);
        }
        if self.pending.len() >= self.limits.max_pending_proposals {
            return Err(Error::TooManyPendingProposals {
                limit: self.limits.max_pending_proposals,
            });
        }
        debug!(
            "[BFT-{}] queueing proposal behind height {}",
            self.id(),
            self.round_state.height()
        );
        self.pending.push_back(state);
        Ok(())
    }

    async fn on_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Frame { peer, bytes } => {
                let signed = match self.codec.decode(&bytes) {
                    Ok(signed) => signed,
                    Err(err) => {
                        warn!("[BFT-{}] undecodable frame from peer {}: {}", self.id(), peer, err);
                        return Ok(());
                    }
                };
                self.on_signed(peer, signed).await
            }
            PeerEvent::Closed(peer) => {
                if self.peers.remove(&peer).is_some() {
                    info!("[BFT-{}] peer {} disconnected", self.id(), peer);
                }
                self.caught_up.retain(|(p, _)| *p != peer);
                Ok(())
            }
        }
    }

    async fn on_signed(&mut self, peer: PeerId, signed: SignedMessage) -> Result<()> {
        let height = signed.message.height();
        let current = self.round_state.height();

        if height < current {
            return self.catch_up(peer, height, &signed);
        }
        if height == current.saturating_add(1) {
            self.codec.verify(&signed)?;
            if self.future.len() < self.limits.future_message_limit {
                self.future.push((peer, signed));
            } else {
                debug!("[BFT-{}] future buffer full, dropping message", self.id());
            }
            return Ok(());
        }

        match self.round_state.on_message(signed) {
            Ok(actions) => self.apply(actions).await,
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                debug!(
                    "[BFT-{}] dropping message from peer {}: {}",
                    self.id(),
                    peer,
                    err
                );
                Ok(())
            }
        }
    }

    /// Answers a participant still working on a height we decided, once per
    /// peer and height, with our `Decide` for it.
    fn catch_up(&mut self, peer: PeerId, height: Height, signed: &SignedMessage) -> Result<()> {
        let (decision, frame) = match self.decided.get(&height) {
            Some(decided) => decided,
            None => {
                debug!(
                    "[BFT-{}] peer {} is at height {}, beyond our history",
                    self.id(),
                    peer,
                    height
                );
                return Ok(());
            }
        };
        if let Message::Decide { .. } = signed.message {
            return decision.check_agreement(
                &signed.message,
                self.codec.participants(),
                self.codec.capabilities(),
            );
        }
        self.codec.verify(signed)?;
        if self.caught_up.contains(&(peer, height)) {
            return Ok(());
        }
        if let Some(handle) = self.peers.get(&peer) {
            debug!(
                "[BFT-{}] sending decision of height {} to peer {}",
                self.id(),
                height,
                peer
            );
            handle.send(frame.clone())?;
            self.caught_up.insert((peer, height));
        }
        Ok(())
    }

    async fn on_timer(&mut self) -> Result<()> {
        match self.timer.take() {
            Some((step, _)) => {
                let actions = self.round_state.on_timeout(step)?;
                self.apply(actions).await
            }
            None => Ok(()),
        }
    }

    /// Carries out actions, moving on to the next height for every decision.
    async fn apply(&mut self, mut actions: Vec<Action>) -> Result<()> {
        while let Some(decision) = self.perform(actions)? {
            actions = self.advance(decision).await?;
        }
        Ok(())
    }

    fn perform(&mut self, actions: Vec<Action>) -> Result<Option<Decision>> {
        let mut decided = None;
        for action in actions {
            match action {
                Action::Broadcast(signed) => self.broadcast(&signed)?,
                Action::ScheduleTimeout { step, after } => {
                    self.timer = Some((step, Instant::now() + after));
                }
                Action::Decide(decision) => decided = Some(decision),
            }
        }
        Ok(decided)
    }

    fn broadcast(&mut self, signed: &SignedMessage) -> Result<()> {
        let frame = self.codec.encode(signed)?;
        for handle in self.peers.values() {
            if let Err(err) = handle.send(frame.clone()) {
                debug!("[BFT-{}] peer {}: {}", self.id(), handle.id(), err);
            }
        }
        if self.recent.len() == RECENT_FRAMES {
            self.recent.pop_front();
        }
        self.recent.push_back(frame);
        Ok(())
    }

    async fn advance(&mut self, decision: Decision) -> Result<Vec<Action>> {
        info!(
            "[BFT-{}] height {} confirmed {:?}",
            self.id(),
            decision.height(),
            decision.hash()
        );
        self.decisions.publish(decision.confirmed.clone()).await;

        let decided = decision.height();
        let height = decided
            .checked_add(1)
            .ok_or(Error::HeightExhausted { height: decided })?;
        let announcement = self.codec.sign(decision.to_message())?;
        let frame = self.codec.encode(&announcement)?;
        let previous_state = decision.confirmed.state.clone();
        self.decided.insert(decided, (decision, frame));
        while self.decided.len() > self.limits.decision_history {
            self.decided.pop_first();
        }
        let history = &self.decided;
        self.caught_up.retain(|(_, h)| history.contains_key(h));
        self.recent.clear();
        self.timer = None;
        self.round_state = RoundState::new(
            self.codec.clone(),
            self.timing,
            self.limits.round_lookahead,
            height,
            Some(previous_state),
        );

        let mut actions = Vec::new();
        while let Some(state) = self.pending.pop_front() {
            match self.round_state.propose(state) {
                Ok(proposed) => {
                    actions.extend(proposed);
                    break;
                }
                Err(err) => warn!("[BFT-{}] dropping queued proposal: {}", self.id(), err),
            }
        }

        for (peer, signed) in std::mem::take(&mut self.future) {
            match self.round_state.on_message(signed) {
                Ok(replayed) => actions.extend(replayed),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => debug!(
                    "[BFT-{}] dropping buffered message from peer {}: {}",
                    self.id(),
                    peer,
                    err
                ),
            }
        }

        actions.extend(self.round_state.start()?);
        Ok(actions)
    }
}
