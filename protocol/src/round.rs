//! Exchange signed packets with the other participants of a session.
//!
//! A [Round] owns the local participant's view of the network for one session: it signs and
//! sends packets, and it filters, verifies, and buffers everything that arrives. Packets are
//! buffered by `(sender, phase)` as soon as they are received, so a peer that runs ahead never
//! causes its packets to be lost and a receive never returns a packet stamped for another phase.
//!
//! # Filtering
//!
//! An inbound message is dropped when it:
//! - exceeds the maximum message size or cannot be decoded,
//! - claims a sender other than the transport-level origin,
//! - comes from a participant that is not part of the session,
//! - carries an invalid signature (which covers packets replayed from another session, as the
//!   signing namespace is bound to the session),
//! - belongs to an earlier attempt, or
//! - is addressed to another participant.
//!
//! A packet signed for this session but stamped with another one is provably malformed and is
//! kept as evidence, once per sender and attempt. Packets for a later attempt are held until
//! [Round::advance] reaches it.

use crate::{
    blame::{Accusation, Evidence, Fault},
    metrics::{DropLabel, FaultLabel, Metrics, PhaseLabel},
    Error, Packet, Phase, Players, SessionId, Signed,
};
use bytes::Bytes;
use commonware_codec::{Decode, Encode};
use commonware_cryptography::{PublicKey, Signer};
use coinshuffle_p2p::{Channel, Inbox, Listener, Session};
use futures::FutureExt;
use std::{
    cmp::Ordering,
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    mem,
    sync::Arc,
    time::Duration,
};
use tokio::{
    select,
    sync::watch,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

/// Packets for later attempts held per participant.
const FUTURE_PACKETS_PER_PLAYER: usize = 16;

/// Cancels every [Round] (and [crate::Machine]) watching the paired [Aborted].
#[derive(Clone, Debug)]
pub struct Aborter {
    sender: Arc<watch::Sender<bool>>,
}

impl Aborter {
    /// Create a new [Aborter] and the [Aborted] signal it controls.
    pub fn new() -> (Self, Aborted) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                sender: Arc::new(sender),
            },
            Aborted { receiver },
        )
    }

    /// Request cancellation. Calling this more than once has no further effect.
    pub fn abort(&self) {
        self.sender.send_replace(true);
    }
}

/// Signal observed by cancellable operations.
#[derive(Clone, Debug)]
pub struct Aborted {
    receiver: watch::Receiver<bool>,
}

impl Aborted {
    /// Returns whether cancellation was requested.
    pub fn is_aborted(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if every [Aborter] is dropped without aborting.
    pub async fn wait(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Configuration for a [Round].
#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace packets are signed under (see [crate::packet_namespace]).
    pub namespace: Vec<u8>,

    /// Session every packet must belong to.
    pub session: SessionId,

    /// Default time to wait for a receive to complete.
    pub timeout: Duration,

    /// Largest message accepted from the network (in bytes).
    pub max_message_size: usize,
}

/// The local participant's connection to the rest of a session.
pub struct Round<C: Signer, T: Channel<PublicKey = C::PublicKey>> {
    crypto: C,
    namespace: Vec<u8>,
    session: SessionId,
    timeout: Duration,
    max_message_size: usize,

    channel: T,
    sessions: BTreeMap<C::PublicKey, T::Session>,
    inbox: Inbox<C::PublicKey>,
    inbox_closed: bool,
    aborted: Aborted,

    attempt: u32,
    phase: Phase,
    players: Players<C::PublicKey>,

    pending: BTreeMap<(C::PublicKey, Phase), Signed<C::PublicKey>>,
    consumed: BTreeMap<(C::PublicKey, Phase), Signed<C::PublicKey>>,
    conflicts: BTreeMap<(C::PublicKey, Phase), Signed<C::PublicKey>>,
    reported: BTreeSet<(C::PublicKey, Phase)>,
    misstamped: BTreeSet<C::PublicKey>,
    sent: Vec<Signed<C::PublicKey>>,
    future: Vec<Signed<C::PublicKey>>,
    evidence: Vec<Accusation<C::PublicKey>>,
    interrupted: Option<C::PublicKey>,

    metrics: Metrics,
}

impl<C: Signer, T: Channel<PublicKey = C::PublicKey>> Round<C, T> {
    /// Register with `channel` and start the first attempt with `players`.
    pub fn new(
        cfg: Config,
        crypto: C,
        mut channel: T,
        players: Players<C::PublicKey>,
        aborted: Aborted,
        metrics: Metrics,
    ) -> Result<Self, Error<C::PublicKey>> {
        if players.me() != &crypto.public_key() {
            return Err(Error::NotParticipating);
        }
        let (listener, inbox) = Listener::new();
        if !channel.listen(listener) {
            return Err(Error::AlreadyListening);
        }
        Ok(Self {
            crypto,
            namespace: cfg.namespace,
            session: cfg.session,
            timeout: cfg.timeout,
            max_message_size: cfg.max_message_size,

            channel,
            sessions: BTreeMap::new(),
            inbox,
            inbox_closed: false,
            aborted,

            attempt: 0,
            phase: Phase::Announcement,
            players,

            pending: BTreeMap::new(),
            consumed: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            reported: BTreeSet::new(),
            misstamped: BTreeSet::new(),
            sent: Vec::new(),
            future: Vec::new(),
            evidence: Vec::new(),
            interrupted: None,

            metrics,
        })
    }

    /// Participants of the current attempt.
    pub fn players(&self) -> &Players<C::PublicKey> {
        &self.players
    }

    /// Participants (excluding self) ranked within `[from, to]`.
    pub fn player_set(&self, from: usize, to: usize) -> Vec<C::PublicKey> {
        self.players.player_set(from, to)
    }

    /// Current attempt (0 for the first run).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Session of this round.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Namespace packets are signed under.
    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    /// Default receive timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns whether the round was canceled.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_aborted()
    }

    /// Move to `next` within the current attempt.
    pub fn set_phase(&mut self, next: Phase) -> Result<(), Error<C::PublicKey>> {
        if !self.phase.can_transition(next) {
            return Err(Error::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(attempt = self.attempt, from = %self.phase, to = %next, "phase transition");
        self.phase = next;
        Ok(())
    }

    /// Start the next attempt with `players`.
    ///
    /// Everything buffered for the previous attempt is discarded. Packets that arrived early for
    /// the new attempt become available immediately.
    pub fn advance(&mut self, players: Players<C::PublicKey>) -> Result<(), Error<C::PublicKey>> {
        if players.me() != self.players.me() {
            return Err(Error::NotParticipating);
        }
        self.attempt += 1;
        self.phase = Phase::Announcement;
        self.players = players;
        self.pending.clear();
        self.consumed.clear();
        self.conflicts.clear();
        self.reported.clear();
        self.misstamped.clear();
        self.sent.clear();
        self.evidence.clear();
        self.interrupted = None;
        debug!(attempt = self.attempt, players = self.players.len(), "advanced attempt");

        for signed in mem::take(&mut self.future) {
            if signed.packet.attempt > self.attempt {
                self.future.push(signed);
            } else if signed.packet.attempt == self.attempt
                && self.players.contains(signed.sender())
            {
                self.accept(signed);
            }
        }
        Ok(())
    }

    /// Build a packet stamped with the current session, attempt, and phase.
    pub fn packet(
        &self,
        recipient: Option<C::PublicKey>,
        payload: Bytes,
    ) -> Packet<C::PublicKey> {
        Packet {
            session: self.session,
            attempt: self.attempt,
            phase: self.phase,
            sender: self.players.me().clone(),
            recipient,
            payload,
        }
    }

    /// Sign and send `packet` to its recipient.
    ///
    /// Fails without sending anything if the recipient is missing, is self, or is not a
    /// participant.
    pub async fn send(
        &mut self,
        packet: Packet<C::PublicKey>,
    ) -> Result<(), Error<C::PublicKey>> {
        let Some(recipient) = packet.recipient.clone() else {
            return Err(Error::MissingRecipient);
        };
        if &recipient == self.players.me() {
            return Err(Error::SelfAddressed);
        }
        if !self.players.contains(&recipient) {
            return Err(Error::UnknownPlayer(recipient));
        }
        if &packet.sender != self.players.me() {
            return Err(Error::InvalidPacket("sender is not self"));
        }
        if self.aborted.is_aborted() {
            return Err(Error::Canceled);
        }
        let signed = Signed::sign(&self.crypto, &self.namespace, packet);
        self.deliver(&recipient, signed.encode().into()).await?;
        self.record_sent(signed);
        Ok(())
    }

    /// Sign `payload` once and send it to every other participant.
    ///
    /// Returns the participants the packet was handed to. Failing to reach one participant does
    /// not prevent delivery to the others.
    pub async fn broadcast(
        &mut self,
        payload: Bytes,
    ) -> Result<Vec<C::PublicKey>, Error<C::PublicKey>> {
        if self.aborted.is_aborted() {
            return Err(Error::Canceled);
        }
        let signed = Signed::sign(&self.crypto, &self.namespace, self.packet(None, payload));
        let message: Bytes = signed.encode().into();
        let mut delivered = Vec::new();
        for peer in self.players.others() {
            match self.deliver(&peer, message.clone()).await {
                Ok(()) => delivered.push(peer),
                Err(err) => warn!(?peer, ?err, "failed to deliver broadcast"),
            }
        }
        self.record_sent(signed);
        Ok(delivered)
    }

    /// Wait for `key`'s packet for `phase`, using the default timeout.
    pub async fn receive_from(
        &mut self,
        key: &C::PublicKey,
        phase: Phase,
    ) -> Result<Signed<C::PublicKey>, Error<C::PublicKey>> {
        self.receive_from_within(key, phase, self.timeout).await
    }

    /// Wait up to `timeout` for `key`'s packet for `phase`.
    pub async fn receive_from_within(
        &mut self,
        key: &C::PublicKey,
        phase: Phase,
        timeout: Duration,
    ) -> Result<Signed<C::PublicKey>, Error<C::PublicKey>> {
        let keys = [key.clone()];
        let mut received = self.gather(&keys, phase, false, timeout).await?;
        received.remove(key).ok_or_else(|| Error::Timeout {
            phase,
            missing: keys.to_vec(),
        })
    }

    /// Wait for one packet for `phase` from each of `keys`.
    ///
    /// All keys share a single deadline. When `detect` is set, any participant among `keys` seen
    /// signing two distinct packets for `phase` is recorded as evidence (see
    /// [Round::take_evidence]). Otherwise the first packet is kept and the rest are ignored.
    pub async fn receive_from_multiple(
        &mut self,
        keys: &[C::PublicKey],
        phase: Phase,
        detect: bool,
    ) -> Result<BTreeMap<C::PublicKey, Signed<C::PublicKey>>, Error<C::PublicKey>> {
        self.gather(keys, phase, detect, self.timeout).await
    }

    /// Take whatever packets for `phase` have already arrived from `keys`, without waiting.
    pub fn drain(
        &mut self,
        keys: &[C::PublicKey],
        phase: Phase,
    ) -> BTreeMap<C::PublicKey, Signed<C::PublicKey>> {
        self.flush();
        let mut received = BTreeMap::new();
        for key in keys {
            let slot = (key.clone(), phase);
            if let Some(signed) = self.pending.remove(&slot) {
                self.consumed.insert(slot, signed.clone());
                received.insert(key.clone(), signed);
            }
        }
        received
    }

    /// Everything sent and received during the current attempt, excluding blame rounds.
    ///
    /// Conflicting packets are included, so that others can see the equivocation.
    pub fn transcript(&self) -> Vec<Signed<C::PublicKey>> {
        self.consumed
            .values()
            .chain(self.pending.values())
            .chain(self.conflicts.values())
            .chain(self.sent.iter())
            .filter(|signed| !signed.phase().is_blame())
            .cloned()
            .collect()
    }

    /// Every packet for `phase` held (sent or received) during the current attempt.
    pub fn held(&self, phase: Phase) -> Vec<Signed<C::PublicKey>> {
        self.consumed
            .values()
            .chain(self.pending.values())
            .chain(self.conflicts.values())
            .chain(self.sent.iter())
            .filter(|signed| signed.phase() == phase)
            .cloned()
            .collect()
    }

    /// The packet sent for `phase`, if any.
    pub fn sent(&self, phase: Phase) -> Option<&Signed<C::PublicKey>> {
        self.sent.iter().find(|signed| signed.phase() == phase)
    }

    /// Record an accusation for the current attempt.
    pub fn accuse(&mut self, accusation: Accusation<C::PublicKey>) {
        debug!(
            accused = ?accusation.accused,
            fault = %accusation.fault,
            "recorded accusation"
        );
        self.metrics
            .accusations
            .get_or_create(&FaultLabel::from(accusation.fault))
            .inc();
        self.evidence.push(accusation);
    }

    /// Returns whether any accusation is waiting to be taken.
    pub fn has_evidence(&self) -> bool {
        !self.evidence.is_empty()
    }

    /// Take every accusation recorded during the current attempt.
    pub fn take_evidence(&mut self) -> Vec<Accusation<C::PublicKey>> {
        mem::take(&mut self.evidence)
    }

    /// Close every open session.
    pub fn close(&mut self) {
        for session in self.sessions.values_mut() {
            session.close();
        }
        self.sessions.clear();
    }

    async fn gather(
        &mut self,
        keys: &[C::PublicKey],
        phase: Phase,
        detect: bool,
        timeout: Duration,
    ) -> Result<BTreeMap<C::PublicKey, Signed<C::PublicKey>>, Error<C::PublicKey>> {
        for key in keys {
            if key == self.players.me() {
                return Err(Error::SelfAddressed);
            }
            if !self.players.contains(key) {
                return Err(Error::UnknownPlayer(key.clone()));
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.flush();
            if self.aborted.is_aborted() {
                return Err(Error::Canceled);
            }
            if !phase.is_blame() {
                if let Some(by) = &self.interrupted {
                    return Err(Error::Interrupted { by: by.clone() });
                }
            }
            let missing: Vec<_> = keys
                .iter()
                .filter(|key| !self.pending.contains_key(&((*key).clone(), phase)))
                .cloned()
                .collect();
            if missing.is_empty() {
                if detect {
                    self.detect(keys, phase);
                }
                return Ok(self.drain(keys, phase));
            }

            select! {
                _ = self.aborted.wait() => {
                    return Err(Error::Canceled);
                },
                message = self.inbox.recv(), if !self.inbox_closed => {
                    match message {
                        Some((origin, message)) => self.ingest(origin, message),
                        None => {
                            debug!("inbox closed");
                            self.inbox_closed = true;
                        }
                    }
                },
                _ = sleep_until(deadline) => {
                    if detect {
                        self.detect(keys, phase);
                    }
                    debug!(%phase, missing = missing.len(), "receive timed out");
                    return Err(Error::Timeout { phase, missing });
                },
            }
        }
    }

    /// Ingest every message already waiting in the inbox.
    fn flush(&mut self) {
        while !self.inbox_closed {
            match self.inbox.recv().now_or_never() {
                Some(Some((origin, message))) => self.ingest(origin, message),
                Some(None) => self.inbox_closed = true,
                None => break,
            }
        }
    }

    fn detect(&mut self, keys: &[C::PublicKey], phase: Phase) {
        for key in keys {
            let slot = (key.clone(), phase);
            if self.reported.contains(&slot) {
                continue;
            }
            let Some(second) = self.conflicts.get(&slot) else {
                continue;
            };
            let Some(first) = self.pending.get(&slot).or_else(|| self.consumed.get(&slot)) else {
                continue;
            };
            let accusation = Accusation {
                accused: key.clone(),
                fault: Fault::EquivocationFailure,
                evidence: Evidence::Conflict(first.clone(), second.clone()),
            };
            self.reported.insert(slot);
            self.accuse(accusation);
        }
    }

    fn dropped(&self, origin: &C::PublicKey, reason: &'static str) {
        trace!(?origin, reason, "dropped message");
        self.metrics
            .dropped
            .get_or_create(&DropLabel::new(reason))
            .inc();
    }

    fn ingest(&mut self, origin: C::PublicKey, message: Bytes) {
        if message.len() > self.max_message_size {
            return self.dropped(&origin, "too_large");
        }
        let Ok(signed) = Signed::<C::PublicKey>::decode_cfg(message, &self.max_message_size) else {
            return self.dropped(&origin, "undecodable");
        };
        if signed.sender() != &origin {
            return self.dropped(&origin, "wrong_origin");
        }
        if !self.players.contains(&origin) {
            return self.dropped(&origin, "unknown_sender");
        }
        if !signed.verify(&self.namespace) {
            return self.dropped(&origin, "invalid_signature");
        }
        if signed.packet.session != self.session {
            if !self.misstamped.insert(origin.clone()) {
                return self.dropped(&origin, "misstamped");
            }
            self.accuse(Accusation {
                accused: origin,
                fault: Fault::MalformedPacket,
                evidence: Evidence::Malformed(signed),
            });
            return;
        }
        match signed.packet.attempt.cmp(&self.attempt) {
            Ordering::Less => return self.dropped(&origin, "stale"),
            Ordering::Greater => {
                let cap = self.players.len() * FUTURE_PACKETS_PER_PLAYER;
                if self.future.len() >= cap {
                    return self.dropped(&origin, "backlog");
                }
                self.future.push(signed);
                return;
            }
            Ordering::Equal => {}
        }
        self.accept(signed);
    }

    /// Buffer a verified packet of the current attempt.
    fn accept(&mut self, signed: Signed<C::PublicKey>) {
        let origin = signed.sender().clone();
        if let Some(recipient) = &signed.packet.recipient {
            if recipient != self.players.me() {
                return self.dropped(&origin, "misaddressed");
            }
        }
        let phase = signed.phase();
        let slot = (origin.clone(), phase);
        let existing = self.pending.get(&slot).or_else(|| self.consumed.get(&slot));
        if let Some(existing) = existing {
            if existing != &signed {
                if let Entry::Vacant(entry) = self.conflicts.entry(slot) {
                    debug!(?origin, %phase, "conflicting packet");
                    entry.insert(signed);
                }
            }
            return;
        }
        if phase.is_blame() && !self.phase.is_blame() && self.interrupted.is_none() {
            debug!(?origin, "interrupted by blame");
            self.interrupted = Some(origin);
        }
        self.metrics
            .received
            .get_or_create(&PhaseLabel::from(phase))
            .inc();
        self.pending.insert(slot, signed);
    }

    fn record_sent(&mut self, signed: Signed<C::PublicKey>) {
        self.metrics
            .sent
            .get_or_create(&PhaseLabel::from(signed.phase()))
            .inc();
        self.sent.push(signed);
    }

    async fn deliver(
        &mut self,
        recipient: &C::PublicKey,
        message: Bytes,
    ) -> Result<(), Error<C::PublicKey>> {
        let session = match self.sessions.entry(recipient.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let session = self
                    .channel
                    .connect(recipient)
                    .await
                    .map_err(|err| Error::Transport(err.to_string()))?;
                entry.insert(session)
            }
        };
        if let Err(err) = session.send(message).await {
            self.sessions.remove(recipient);
            return Err(Error::Transport(err.to_string()));
        }
        Ok(())
    }
}
