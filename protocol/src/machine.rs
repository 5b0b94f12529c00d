//! Drive one participant through a shuffle session.

use crate::{
    blame::{judge, resolve, Accusation, Context, Evidence, Fault, Resolution},
    coin::{Coin, Input},
    message::{check_digest, Announced},
    metrics::Metrics,
    packet_namespace,
    round::{self, Aborter, Round},
    transaction_namespace, Config, Error, Limits, Message, Phase, Players, Signed,
};
use bytes::Bytes;
use coinshuffle_cryptography::{DecryptionKey, EncryptionKey};
use commonware_codec::Encode;
use commonware_cryptography::{PublicKey, Signer, Verifier};
use coinshuffle_p2p::Channel;
use rand::{seq::SliceRandom, CryptoRng, Rng};
use std::{
    collections::{BTreeMap, BTreeSet},
    marker::PhantomData,
    mem,
};
use tracing::{debug, info, warn};

type Msg<P, D> = Message<P, <D as DecryptionKey>::EncryptionKey>;

/// What the local participant brings to the shuffle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Contribution {
    /// Coin funding the participant's share of the transaction.
    pub input: Bytes,
    /// Fresh address that receives the shuffled amount.
    pub output: Bytes,
    /// Optional address receiving whatever `input` holds beyond the amount.
    pub change: Option<Bytes>,
}

/// Result of a session that ran to completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome<P: PublicKey, X> {
    /// The transaction was submitted.
    Completed {
        transaction: X,
        /// Number of attempts made (including the successful one).
        attempts: u32,
        /// Participants excluded along the way, with the fault that excluded them.
        excluded: BTreeMap<P, Fault>,
    },
    /// The session stopped without a transaction.
    Aborted {
        attempts: u32,
        /// Participants convicted in the final attempt.
        convicted: BTreeMap<P, Fault>,
    },
}

/// Why an attempt stopped early.
enum Stop<P: PublicKey> {
    /// Evidence (or an inconsistency) requires a blame exchange.
    Blame(&'static str),
    Error(Error<P>),
}

impl<P: PublicKey> From<Error<P>> for Stop<P> {
    fn from(err: Error<P>) -> Self {
        Stop::Error(err)
    }
}

/// State created for a single attempt.
struct Attempt<P: PublicKey, D: DecryptionKey> {
    key: D,
    announcements: BTreeMap<P, Announced<D::EncryptionKey>>,
}

/// One participant of a shuffle session.
pub struct Machine<E, C, D, T, K>
where
    E: Rng + CryptoRng + Send + 'static,
    C: Signer,
    D: DecryptionKey,
    T: Channel<PublicKey = C::PublicKey>,
    K: Coin<PublicKey = C::PublicKey>,
{
    context: E,
    crypto: C,
    coin: K,
    round: Round<C, T>,
    contribution: Contribution,

    amount: u64,
    min_players: usize,
    max_attempts: u32,
    corroboration_rounds: u8,
    limits: Limits,
    transaction_namespace: Vec<u8>,

    excluded: BTreeMap<C::PublicKey, Fault>,
    metrics: Metrics,

    _decryption_key: PhantomData<D>,
}

impl<E, C, D, T, K> Machine<E, C, D, T, K>
where
    E: Rng + CryptoRng + Send + 'static,
    C: Signer,
    D: DecryptionKey,
    T: Channel<PublicKey = C::PublicKey>,
    K: Coin<PublicKey = C::PublicKey>,
{
    /// Create a participant and the [Aborter] that cancels it.
    ///
    /// `participants` must include the local participant. Listening on `channel` starts
    /// immediately, so packets from faster peers are buffered until [Machine::run] is called.
    pub fn new(
        context: E,
        cfg: Config,
        crypto: C,
        coin: K,
        channel: T,
        participants: Vec<C::PublicKey>,
        contribution: Contribution,
    ) -> Result<(Self, Aborter), Error<C::PublicKey>> {
        cfg.validate().map_err(Error::InvalidConfig)?;
        let players = Players::new(participants, crypto.public_key())?;
        if players.len() < cfg.min_players {
            return Err(Error::InvalidConfig("too few participants"));
        }
        if players.len() > cfg.max_players {
            return Err(Error::InvalidConfig("too many participants"));
        }

        // Initialize metrics
        let metrics = {
            let mut registry = cfg
                .registry
                .lock()
                .map_err(|_| Error::InvalidConfig("registry poisoned"))?;
            Metrics::init(&mut registry)
        };

        let (aborter, aborted) = Aborter::new();
        let round = Round::new(
            round::Config {
                namespace: packet_namespace(&cfg.namespace, &cfg.session),
                session: cfg.session,
                timeout: cfg.timeout,
                max_message_size: cfg.max_message_size,
            },
            crypto.clone(),
            channel,
            players,
            aborted,
            metrics.clone(),
        )?;
        Ok((
            Self {
                context,
                crypto,
                coin,
                round,
                contribution,

                amount: cfg.amount,
                min_players: cfg.min_players,
                max_attempts: cfg.max_attempts,
                corroboration_rounds: cfg.max_corroboration_rounds,
                limits: cfg.limits(),
                transaction_namespace: transaction_namespace(&cfg.namespace),

                excluded: BTreeMap::new(),
                metrics,

                _decryption_key: PhantomData,
            },
            aborter,
        ))
    }

    /// Metrics of this participant.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run attempts until a transaction is submitted or the session is aborted.
    ///
    /// Protocol faults of other participants never surface as an [Error]: they are resolved by
    /// excluding the faulty participants and retrying, or by returning [Outcome::Aborted].
    pub async fn run(
        mut self,
    ) -> Result<Outcome<C::PublicKey, K::Transaction>, Error<C::PublicKey>> {
        let me = self.crypto.public_key();
        self.coin
            .verify_input(&me, &self.contribution.input, self.amount)
            .map_err(Error::LocalInput)?;
        let result = self.attempts().await;
        self.round.close();
        result
    }

    async fn attempts(
        &mut self,
    ) -> Result<Outcome<C::PublicKey, K::Transaction>, Error<C::PublicKey>> {
        loop {
            let attempt = self.round.attempt();
            self.metrics.attempts.inc();
            info!(
                attempt,
                players = self.round.players().len(),
                rank = self.round.players().my_rank(),
                "starting attempt"
            );
            let mut state = Attempt {
                key: D::from_rng(&mut self.context),
                announcements: BTreeMap::new(),
            };
            match self.attempt(&mut state).await {
                Ok(transaction) => {
                    info!(attempt, "submitted transaction");
                    return Ok(Outcome::Completed {
                        transaction,
                        attempts: attempt + 1,
                        excluded: mem::take(&mut self.excluded),
                    });
                }
                Err(Stop::Blame(reason)) => debug!(attempt, reason, "attempt failed"),
                Err(Stop::Error(Error::Timeout { phase, missing })) => {
                    for accused in missing {
                        self.round.accuse(Accusation {
                            accused,
                            fault: Fault::NoResponse,
                            evidence: Evidence::Silence { phase },
                        });
                    }
                }
                Err(Stop::Error(Error::Interrupted { by })) => {
                    debug!(attempt, ?by, "interrupted by blame")
                }
                Err(Stop::Error(err)) => return Err(err),
            }

            let convicted = self.blame(&state).await?;
            match resolve(
                &convicted,
                self.round.players(),
                self.min_players,
                attempt,
                self.max_attempts,
            ) {
                Resolution::Retry(players) => {
                    for (player, fault) in &convicted {
                        warn!(attempt, ?player, %fault, "excluding participant");
                    }
                    self.excluded.extend(convicted);
                    self.round.advance(players)?;
                }
                Resolution::Abort => {
                    warn!(attempt, convicted = convicted.len(), "aborting session");
                    return Ok(Outcome::Aborted {
                        attempts: attempt + 1,
                        convicted,
                    });
                }
            }
        }
    }

    async fn attempt(
        &mut self,
        state: &mut Attempt<C::PublicKey, D>,
    ) -> Result<K::Transaction, Stop<C::PublicKey>> {
        self.announce(state).await?;
        let outputs = self.shuffle(state).await?;
        self.check(state, &outputs).await?;
        self.sign(state, outputs).await
    }

    fn ensure_clean(&self, reason: &'static str) -> Result<(), Stop<C::PublicKey>> {
        if self.round.has_evidence() {
            return Err(Stop::Blame(reason));
        }
        Ok(())
    }

    fn malformed(&mut self, accused: C::PublicKey, signed: Signed<C::PublicKey>) {
        self.round.accuse(Accusation {
            accused,
            fault: Fault::MalformedPacket,
            evidence: Evidence::Malformed(signed),
        });
    }

    /// Announcements in rank order.
    fn ordered(
        &self,
        state: &Attempt<C::PublicKey, D>,
    ) -> Result<Vec<Announced<D::EncryptionKey>>, Error<C::PublicKey>> {
        self.round
            .players()
            .all()
            .iter()
            .map(|player| {
                state
                    .announcements
                    .get(player)
                    .cloned()
                    .ok_or(Error::InvalidPacket("missing announcement"))
            })
            .collect()
    }

    async fn announce(
        &mut self,
        state: &mut Attempt<C::PublicKey, D>,
    ) -> Result<(), Stop<C::PublicKey>> {
        let announced = Announced {
            encryption_key: state.key.encryption_key(),
            input: self.contribution.input.clone(),
            change: self.contribution.change.clone(),
        };
        let message: Msg<C::PublicKey, D> = Message::Announcement(announced.clone());
        self.round.broadcast(message.encode().into()).await?;
        state
            .announcements
            .insert(self.round.players().me().clone(), announced);

        let others = self.round.players().others();
        let received = self
            .round
            .receive_from_multiple(&others, Phase::Announcement, true)
            .await?;
        for (sender, signed) in received {
            let announced = match Msg::<C::PublicKey, D>::from_packet(&signed, self.limits) {
                Ok(Message::Announcement(announced)) => announced,
                _ => {
                    self.malformed(sender, signed);
                    continue;
                }
            };
            if let Err(err) = self
                .coin
                .verify_input(&sender, &announced.input, self.amount)
            {
                debug!(?sender, %err, "rejected input");
                self.round.accuse(Accusation {
                    accused: sender.clone(),
                    fault: err.fault(),
                    evidence: Evidence::Announcement(signed),
                });
            }
            state.announcements.insert(sender, announced);
        }
        self.ensure_clean("invalid announcement")
    }

    /// Remove this participant's layer from every entry handed over by the predecessor.
    fn peel(
        &self,
        key: &D,
        signed: &Signed<C::PublicKey>,
        rank: usize,
    ) -> Result<Vec<Bytes>, &'static str> {
        let Ok(Message::Shuffle(list)) = Msg::<C::PublicKey, D>::from_packet(signed, self.limits)
        else {
            return Err("malformed shuffle");
        };
        if list.len() != rank - 1 {
            return Err("wrong number of entries");
        }
        let mut seen = BTreeSet::new();
        let mut peeled = Vec::with_capacity(rank);
        for entry in &list {
            let inner = Bytes::from(key.decrypt(entry).map_err(|_| "undecryptable entry")?);
            if !seen.insert(inner.clone()) {
                return Err("duplicate entry");
            }
            peeled.push(inner);
        }
        Ok(peeled)
    }

    async fn shuffle(
        &mut self,
        state: &Attempt<C::PublicKey, D>,
    ) -> Result<Vec<Bytes>, Stop<C::PublicKey>> {
        self.round.set_phase(Phase::Shuffling)?;
        let players = self.round.players().clone();
        let n = players.len();
        let rank = players.my_rank();
        let timeout = self.round.timeout();

        // Rank r waits for the r - 1 hops before it
        let mut list = match players.predecessor() {
            None => Vec::new(),
            Some(predecessor) => {
                let signed = self
                    .round
                    .receive_from_within(predecessor, Phase::Shuffling, timeout * (rank - 1) as u32)
                    .await?;
                match self.peel(&state.key, &signed, rank) {
                    Ok(list) => list,
                    Err(reason) => {
                        warn!(?predecessor, reason, "invalid shuffle");
                        let announcement = self
                            .round
                            .sent(Phase::Announcement)
                            .cloned()
                            .ok_or(Error::<C::PublicKey>::InvalidPacket("announcement not sent"))?;
                        self.round.accuse(Accusation {
                            accused: predecessor.clone(),
                            fault: Fault::ShuffleFailure,
                            evidence: Evidence::Shuffle {
                                shuffle: signed,
                                announcement,
                                key: Bytes::copy_from_slice(state.key.as_ref()),
                            },
                        });
                        return Err(Stop::Blame(reason));
                    }
                }
            }
        };

        // Seal the output for every later rank, the last rank innermost
        let mut entry = self.contribution.output.to_vec();
        for later in (rank + 1..=n).rev() {
            let announced = players
                .key(later)
                .and_then(|key| state.announcements.get(key))
                .ok_or(Error::<C::PublicKey>::InvalidPacket("missing announcement"))?;
            entry = announced
                .encryption_key
                .encrypt(&mut self.context, &entry)
                .map_err(Error::<C::PublicKey>::Crypto)?;
        }
        list.push(Bytes::from(entry));
        list.shuffle(&mut self.context);
        self.ensure_clean("evidence during shuffle")?;

        let outputs = match players.successor() {
            Some(successor) => {
                let message: Msg<C::PublicKey, D> = Message::Shuffle(list);
                let packet = self.round.packet(Some(successor.clone()), message.encode().into());
                match self.round.send(packet).await {
                    Ok(()) => {}
                    Err(Error::Transport(reason)) => {
                        warn!(?successor, reason, "failed to hand over shuffle")
                    }
                    Err(err) => return Err(err.into()),
                }
                self.round.set_phase(Phase::BroadcastOutput)?;

                // Wait for the remaining hops and the broadcast
                let last = players.last();
                let signed = self
                    .round
                    .receive_from_within(last, Phase::BroadcastOutput, timeout * n as u32)
                    .await?;
                match Msg::<C::PublicKey, D>::from_packet(&signed, self.limits) {
                    Ok(Message::Output(outputs)) => outputs,
                    _ => {
                        self.malformed(last.clone(), signed);
                        return Err(Stop::Blame("malformed output"));
                    }
                }
            }
            None => {
                self.round.set_phase(Phase::BroadcastOutput)?;
                let message: Msg<C::PublicKey, D> = Message::Output(list.clone());
                self.round.broadcast(message.encode().into()).await?;
                list
            }
        };

        let distinct: BTreeSet<_> = outputs.iter().collect();
        if outputs.len() != n
            || distinct.len() != n
            || !outputs.contains(&self.contribution.output)
        {
            warn!(entries = outputs.len(), distinct = distinct.len(), "rejected output list");
            return Err(Stop::Blame("rejected output list"));
        }
        Ok(outputs)
    }

    async fn check(
        &mut self,
        state: &Attempt<C::PublicKey, D>,
        outputs: &[Bytes],
    ) -> Result<(), Stop<C::PublicKey>> {
        self.round.set_phase(Phase::EquivocationCheck)?;
        let ordered = self.ordered(state)?;
        let digest = check_digest(
            &self.round.session(),
            self.round.attempt(),
            &ordered,
            outputs,
        );
        let message: Msg<C::PublicKey, D> = Message::Check(digest);
        self.round.broadcast(message.encode().into()).await?;

        let others = self.round.players().others();
        let received = self
            .round
            .receive_from_multiple(&others, Phase::EquivocationCheck, true)
            .await?;
        let mut mismatched = false;
        for (sender, signed) in received {
            match Msg::<C::PublicKey, D>::from_packet(&signed, self.limits) {
                Ok(Message::Check(theirs)) if theirs == digest => {}
                Ok(Message::Check(_)) => {
                    warn!(?sender, "equivocation check mismatch");
                    mismatched = true;
                }
                _ => self.malformed(sender, signed),
            }
        }
        if mismatched {
            return Err(Stop::Blame("equivocation check mismatch"));
        }
        self.ensure_clean("invalid check")
    }

    async fn sign(
        &mut self,
        state: &Attempt<C::PublicKey, D>,
        outputs: Vec<Bytes>,
    ) -> Result<K::Transaction, Stop<C::PublicKey>> {
        self.round.set_phase(Phase::VerificationAndSubmission)?;
        let inputs: Vec<_> = self
            .round
            .players()
            .all()
            .iter()
            .zip(self.ordered(state)?)
            .map(|(owner, announced)| Input {
                owner: owner.clone(),
                coin: announced.input,
                change: announced.change,
            })
            .collect();
        let transaction = self.coin.build(&inputs, &outputs, self.amount);
        let payload = self.coin.payload(&transaction);
        let share = self.crypto.sign(Some(&self.transaction_namespace), &payload);
        let message: Msg<C::PublicKey, D> = Message::Share(share.clone());
        self.round.broadcast(message.encode().into()).await?;

        let others = self.round.players().others();
        let received = self
            .round
            .receive_from_multiple(&others, Phase::VerificationAndSubmission, true)
            .await?;
        let mut shares = vec![(self.round.players().me().clone(), share)];
        for (sender, signed) in received {
            match Msg::<C::PublicKey, D>::from_packet(&signed, self.limits) {
                Ok(Message::Share(signature))
                    if sender.verify(Some(&self.transaction_namespace), &payload, &signature) =>
                {
                    shares.push((sender, signature));
                }
                _ => {
                    warn!(?sender, "invalid share");
                    self.round.accuse(Accusation {
                        accused: sender,
                        fault: Fault::MalformedPacket,
                        evidence: Evidence::Share(signed),
                    });
                }
            }
        }
        self.ensure_clean("invalid share")?;

        self.coin
            .submit(transaction.clone(), shares)
            .await
            .map_err(|err| Error::<C::PublicKey>::Submission(err.to_string()))?;
        self.round.set_phase(Phase::Completed)?;
        Ok(transaction)
    }

    /// Wait for every other participant's packet of a blame round, proceeding without the
    /// missing ones once the timeout elapses.
    async fn exchange(&mut self, phase: Phase) -> Result<(), Error<C::PublicKey>> {
        let others = self.round.players().others();
        match self.round.receive_from_multiple(&others, phase, true).await {
            Ok(_) => Ok(()),
            Err(Error::Timeout { missing, .. }) => {
                debug!(%phase, missing = missing.len(), "blame round incomplete");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Exchange accusations, reveals, and relays, then judge the attempt.
    async fn blame(
        &mut self,
        state: &Attempt<C::PublicKey, D>,
    ) -> Result<BTreeMap<C::PublicKey, Fault>, Error<C::PublicKey>> {
        let attempt = self.round.attempt();
        self.metrics.blame_rounds.inc();
        self.round.set_phase(Phase::Blame(0))?;
        let accusations = self.round.take_evidence();
        info!(
            attempt,
            from = ?self.round.players().me(),
            accusations = accusations.len(),
            "entering blame"
        );
        let message: Msg<C::PublicKey, D> = Message::Blame {
            accusations,
            decryption_key: Some(Bytes::copy_from_slice(state.key.as_ref())),
            transcript: self.round.transcript(),
        };
        self.round.broadcast(message.encode().into()).await?;
        self.exchange(Phase::Blame(0)).await?;

        // Relay what was heard so silence can be corroborated
        for round in 1..=self.corroboration_rounds {
            self.round.set_phase(Phase::Blame(round))?;
            let mut relayed = self.round.held(Phase::Blame(0));
            if round > 1 {
                relayed.extend(self.round.held(Phase::Blame(round - 1)));
            }
            let message: Msg<C::PublicKey, D> = Message::Relay(relayed);
            self.round.broadcast(message.encode().into()).await?;
            self.exchange(Phase::Blame(round)).await?;
        }

        let mut blame = Vec::new();
        for round in 0..=self.corroboration_rounds {
            for signed in self.round.held(Phase::Blame(round)) {
                if round > 0 {
                    if let Ok(Message::Relay(relayed)) =
                        Msg::<C::PublicKey, D>::from_packet(&signed, self.limits)
                    {
                        blame.extend(relayed);
                    }
                }
                blame.push(signed);
            }
        }
        let ctx = Context {
            namespace: self.round.namespace(),
            transaction_namespace: &self.transaction_namespace,
            session: self.round.session(),
            attempt,
            amount: self.amount,
            players: self.round.players(),
            coin: &self.coin,
            limits: self.limits,
            corroboration_rounds: self.corroboration_rounds,
        };
        let convicted = judge::<D, K>(&ctx, &blame);
        debug!(attempt, convicted = convicted.len(), "judged attempt");
        Ok(convicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        coin::InputError,
        mocks::{self, Ledger, Transaction},
        Packet, SessionId,
    };
    use coinshuffle_cryptography::x25519;
    use commonware_codec::Decode;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey as Identity},
        PrivateKeyExt,
    };
    use coinshuffle_p2p::{
        simulated::{self, Network},
        Listener, Session,
    };
    use rand::{rngs::StdRng, SeedableRng};
    use std::{future::Future, sync::Arc, time::Duration};
    use tokio::time::Instant;

    const NAMESPACE: &[u8] = b"test";
    const AMOUNT: u64 = 100;
    const TIMEOUT: Duration = Duration::from_secs(5);

    type Key = x25519::DecryptionKey;
    type TestMachine<T, K> = Machine<StdRng, PrivateKey, Key, T, K>;
    type Rule = Arc<dyn Fn(&Identity, &mut Packet<Identity>) + Send + Sync>;

    fn config() -> Config {
        let mut cfg = Config::new(NAMESPACE, SessionId::new(b"machine"), AMOUNT);
        cfg.timeout = TIMEOUT;
        cfg
    }

    /// Accepts any input, so a participant can announce coins it cannot spend.
    #[derive(Clone)]
    struct Lenient(Ledger<Identity>);

    impl Coin for Lenient {
        type PublicKey = Identity;
        type Transaction = Transaction<Identity>;
        type Error = mocks::Error;

        fn verify_input(&self, _: &Identity, _: &Bytes, _: u64) -> Result<(), InputError> {
            Ok(())
        }

        fn build(
            &self,
            inputs: &[Input<Identity>],
            outputs: &[Bytes],
            amount: u64,
        ) -> Transaction<Identity> {
            self.0.build(inputs, outputs, amount)
        }

        fn payload(&self, transaction: &Transaction<Identity>) -> Bytes {
            self.0.payload(transaction)
        }

        fn submit(
            &self,
            transaction: Transaction<Identity>,
            shares: Vec<(Identity, <Identity as Verifier>::Signature)>,
        ) -> impl Future<Output = Result<(), mocks::Error>> + Send {
            self.0.submit(transaction, shares)
        }
    }

    /// Rewrites (and re-signs) outgoing packets before they reach the network.
    #[derive(Clone)]
    struct Tamper {
        inner: simulated::Channel<Identity>,
        signer: PrivateKey,
        rule: Rule,
    }

    struct Tampered {
        inner: simulated::Session<Identity>,
        peer: Identity,
        signer: PrivateKey,
        rule: Rule,
    }

    impl Channel for Tamper {
        type PublicKey = Identity;
        type Session = Tampered;
        type Error = simulated::Error;

        fn listen(&mut self, listener: Listener<Identity>) -> bool {
            self.inner.listen(listener)
        }

        fn connect(
            &mut self,
            peer: &Identity,
        ) -> impl Future<Output = Result<Tampered, simulated::Error>> + Send {
            let signer = self.signer.clone();
            let rule = self.rule.clone();
            let recipient = peer.clone();
            let connecting = self.inner.connect(peer);
            async move {
                Ok(Tampered {
                    inner: connecting.await?,
                    peer: recipient,
                    signer,
                    rule,
                })
            }
        }
    }

    impl Session for Tampered {
        type Error = simulated::Error;

        fn send(
            &mut self,
            message: Bytes,
        ) -> impl Future<Output = Result<(), simulated::Error>> + Send {
            let message = match Signed::<Identity>::decode_cfg(message.clone(), &usize::MAX) {
                Ok(signed) => {
                    let mut packet = signed.packet.clone();
                    (self.rule)(&self.peer, &mut packet);
                    if packet == signed.packet {
                        message
                    } else {
                        Signed::sign(
                            &self.signer,
                            &packet_namespace(NAMESPACE, &signed.packet.session),
                            packet,
                        )
                        .encode()
                        .into()
                    }
                }
                Err(_) => message,
            };
            self.inner.send(message)
        }

        fn close(&mut self) {
            self.inner.close()
        }

        fn closed(&self) -> bool {
            self.inner.closed()
        }
    }

    struct Fixture {
        network: Network<Identity>,
        ledger: Ledger<Identity>,
        signers: Vec<PrivateKey>,
        contributions: Vec<Contribution>,
    }

    impl Fixture {
        /// `n` funded participants sorted by rank.
        fn new(n: u64) -> Self {
            let network = Network::new(simulated::Config::default());
            let ledger = Ledger::default();
            let mut signers: Vec<_> = (0..n).map(PrivateKey::from_seed).collect();
            signers.sort_by_key(|signer| signer.public_key());
            let contributions = signers
                .iter()
                .enumerate()
                .map(|(index, signer)| Contribution {
                    input: ledger.fund(&signer.public_key(), AMOUNT),
                    output: Bytes::from(format!("output-{index}")),
                    change: None,
                })
                .collect();
            Self {
                network,
                ledger,
                signers,
                contributions,
            }
        }

        fn key(&self, index: usize) -> Identity {
            self.signers[index].public_key()
        }

        fn participants(&self) -> Vec<Identity> {
            self.signers.iter().map(|signer| signer.public_key()).collect()
        }

        fn machine<T, K>(&self, index: usize, coin: K, channel: T) -> (TestMachine<T, K>, Aborter)
        where
            T: Channel<PublicKey = Identity>,
            K: Coin<PublicKey = Identity>,
        {
            Machine::new(
                StdRng::seed_from_u64(index as u64),
                config(),
                self.signers[index].clone(),
                coin,
                channel,
                self.participants(),
                self.contributions[index].clone(),
            )
            .unwrap()
        }

        fn honest(
            &self,
            index: usize,
        ) -> TestMachine<simulated::Channel<Identity>, Ledger<Identity>> {
            let channel = self.network.channel(self.key(index));
            self.machine(index, self.ledger.clone(), channel).0
        }

        fn tampering(&self, index: usize, rule: Rule) -> TestMachine<Tamper, Ledger<Identity>> {
            let channel = Tamper {
                inner: self.network.channel(self.key(index)),
                signer: self.signers[index].clone(),
                rule,
            };
            self.machine(index, self.ledger.clone(), channel).0
        }

        fn outputs(&self) -> Vec<Bytes> {
            let mut outputs: Vec<_> = self
                .contributions
                .iter()
                .map(|contribution| contribution.output.clone())
                .collect();
            outputs.sort();
            outputs
        }
    }

    /// Run honest participants to completion and return the set they agreed to exclude.
    async fn complete(
        machines: Vec<TestMachine<simulated::Channel<Identity>, Ledger<Identity>>>,
        attempts: u32,
    ) -> BTreeMap<Identity, Fault> {
        let handles: Vec<_> = machines
            .into_iter()
            .map(|machine| tokio::spawn(machine.run()))
            .collect();
        let mut excluded = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Outcome::Completed {
                    attempts: made,
                    excluded: set,
                    ..
                } => {
                    assert_eq!(made, attempts);
                    excluded.push(set);
                }
                outcome => panic!("unexpected outcome: {outcome:?}"),
            }
        }
        assert!(excluded.windows(2).all(|pair| pair[0] == pair[1]));
        excluded.pop().unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_honest_sessions() {
        for n in 2..=5 {
            let fixture = Fixture::new(n);
            let machines: Vec<_> = (0..n as usize).map(|i| fixture.honest(i)).collect();
            let handles: Vec<_> = machines
                .into_iter()
                .map(|machine| tokio::spawn(machine.run()))
                .collect();
            let mut transactions = Vec::new();
            for handle in handles {
                match handle.await.unwrap().unwrap() {
                    Outcome::Completed {
                        transaction,
                        attempts,
                        excluded,
                    } => {
                        assert_eq!(attempts, 1);
                        assert!(excluded.is_empty());
                        transactions.push(transaction);
                    }
                    outcome => panic!("unexpected outcome: {outcome:?}"),
                }
            }

            // Everyone built and submitted the same transaction
            assert!(transactions.windows(2).all(|pair| pair[0] == pair[1]));
            let submitted = fixture.ledger.submitted();
            assert_eq!(submitted, vec![transactions[0].clone()]);

            // Inputs follow rank order and every output made it
            let transaction = &submitted[0];
            let owners: Vec<_> = transaction
                .inputs
                .iter()
                .map(|input| input.owner.clone())
                .collect();
            assert_eq!(owners, fixture.participants());
            let mut outputs = transaction.outputs.clone();
            outputs.sort();
            assert_eq!(outputs, fixture.outputs());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_participant_excluded() {
        let fixture = Fixture::new(4);
        let silent = 2;

        // Registered, but never speaks
        let (listener, _inbox) = Listener::new();
        let mut channel = fixture.network.channel(fixture.key(silent));
        assert!(channel.listen(listener));

        let machines = (0..4)
            .filter(|index| *index != silent)
            .map(|index| fixture.honest(index))
            .collect();
        let excluded = complete(machines, 2).await;
        assert_eq!(
            excluded,
            BTreeMap::from([(fixture.key(silent), Fault::NoResponse)])
        );

        let submitted = fixture.ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].inputs.len(), 3);
        assert!(!submitted[0]
            .outputs
            .contains(&fixture.contributions[silent].output));
    }

    #[tokio::test(start_paused = true)]
    async fn test_underfunded_participant_excluded() {
        let mut fixture = Fixture::new(3);
        let cheat = 1;
        fixture.contributions[cheat].input = fixture.ledger.fund(&fixture.key(cheat), AMOUNT - 1);

        let channel = fixture.network.channel(fixture.key(cheat));
        let (machine, _) = fixture.machine(cheat, Lenient(fixture.ledger.clone()), channel);
        let cheat_handle = tokio::spawn(machine.run());
        let machines = [0, 2].into_iter().map(|index| fixture.honest(index)).collect();
        let excluded = complete(machines, 2).await;
        assert_eq!(
            excluded,
            BTreeMap::from([(fixture.key(cheat), Fault::InsufficientFunds)])
        );

        // The cheat sees nothing wrong with its own input and gives up
        assert!(matches!(
            cheat_handle.await.unwrap(),
            Ok(Outcome::Aborted { attempts: 1, .. })
        ));
        assert_eq!(fixture.ledger.submitted()[0].inputs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equivocating_participant_excluded() {
        let fixture = Fixture::new(3);
        let (cheat, victim) = (0, 2);
        let victim_key = fixture.key(victim);
        let limits = config().limits();

        // Announce a different change address to the victim only
        let rule: Rule = Arc::new(move |recipient, packet| {
            if packet.phase != Phase::Announcement || recipient != &victim_key {
                return;
            }
            let Ok(Message::Announcement(mut announced)) =
                Msg::<Identity, Key>::decode_cfg(packet.payload.clone(), &limits)
            else {
                return;
            };
            announced.change = Some(Bytes::from_static(b"equivocated"));
            let message: Msg<Identity, Key> = Message::Announcement(announced);
            packet.payload = message.encode().into();
        });
        let cheat_handle = tokio::spawn(fixture.tampering(cheat, rule).run());
        let machines = [1, 2].into_iter().map(|index| fixture.honest(index)).collect();
        let excluded = complete(machines, 2).await;
        assert_eq!(
            excluded,
            BTreeMap::from([(fixture.key(cheat), Fault::EquivocationFailure)])
        );
        assert!(matches!(
            cheat_handle.await.unwrap(),
            Ok(Outcome::Aborted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_equivocating_output_excluded() {
        let fixture = Fixture::new(4);
        let (cheat, victim) = (3, 1);
        let victim_key = fixture.key(victim);
        let limits = config().limits();

        // The last rank broadcasts a different output list to the victim only
        let rule: Rule = Arc::new(move |recipient, packet| {
            if packet.phase != Phase::BroadcastOutput || recipient != &victim_key {
                return;
            }
            let Ok(Message::Output(mut outputs)) =
                Msg::<Identity, Key>::decode_cfg(packet.payload.clone(), &limits)
            else {
                return;
            };
            outputs[0] = Bytes::from_static(b"swapped");
            let message: Msg<Identity, Key> = Message::Output(outputs);
            packet.payload = message.encode().into();
        });
        let cheat_handle = tokio::spawn(fixture.tampering(cheat, rule).run());
        let machines = [0, 1, 2]
            .into_iter()
            .map(|index| fixture.honest(index))
            .collect();
        let excluded = complete(machines, 2).await;
        assert_eq!(
            excluded,
            BTreeMap::from([(fixture.key(cheat), Fault::EquivocationFailure)])
        );
        assert!(matches!(
            cheat_handle.await.unwrap(),
            Ok(Outcome::Aborted { .. })
        ));

        let submitted = fixture.ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(!submitted[0]
            .outputs
            .contains(&fixture.contributions[cheat].output));
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_list_excluded() {
        let fixture = Fixture::new(4);
        let cheat = 1;
        let limits = config().limits();

        // Replace an entry of the list handed to rank 3
        let rule: Rule = Arc::new(move |_, packet| {
            if packet.phase != Phase::Shuffling {
                return;
            }
            let Ok(Message::Shuffle(mut list)) =
                Msg::<Identity, Key>::decode_cfg(packet.payload.clone(), &limits)
            else {
                return;
            };
            list[0] = Bytes::from_static(b"corrupted");
            let message: Msg<Identity, Key> = Message::Shuffle(list);
            packet.payload = message.encode().into();
        });
        let cheat_handle = tokio::spawn(fixture.tampering(cheat, rule).run());
        let machines = [0, 2, 3]
            .into_iter()
            .map(|index| fixture.honest(index))
            .collect();
        let excluded = complete(machines, 2).await;
        assert_eq!(excluded.len(), 1);
        assert!(excluded.contains_key(&fixture.key(cheat)));
        assert!(matches!(
            cheat_handle.await.unwrap(),
            Ok(Outcome::Aborted { .. })
        ));

        let submitted = fixture.ledger.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].outputs.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_remaining_aborts() {
        let fixture = Fixture::new(2);
        let outcome = fixture.honest(0).run().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Aborted {
                attempts: 1,
                convicted: BTreeMap::from([(fixture.key(1), Fault::NoResponse)]),
            }
        );
        assert!(fixture.ledger.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_shortfall() {
        let mut fixture = Fixture::new(2);
        fixture.contributions[0].input = fixture.ledger.fund(&fixture.key(0), AMOUNT - 1);
        let result = fixture.honest(0).run().await;
        assert!(matches!(
            result,
            Err(Error::LocalInput(InputError::Insufficient))
        ));
        assert_eq!(fixture.network.total_deliveries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let fixture = Fixture::new(3);
        let channel = fixture.network.channel(fixture.key(0));
        let (machine, aborter) = fixture.machine(0, fixture.ledger.clone(), channel);
        let start = Instant::now();
        let handle = tokio::spawn(machine.run());
        tokio::time::sleep(TIMEOUT / 2).await;
        aborter.abort();
        assert!(matches!(handle.await.unwrap(), Err(Error::Canceled)));
        assert!(start.elapsed() < TIMEOUT);
    }

    #[test]
    fn test_invalid_participants() {
        let fixture = Fixture::new(3);
        let outsider = PrivateKey::from_seed(99);
        let result = Machine::<_, _, Key, _, _>::new(
            StdRng::seed_from_u64(0),
            config(),
            outsider.clone(),
            fixture.ledger.clone(),
            fixture.network.channel(outsider.public_key()),
            fixture.participants(),
            fixture.contributions[0].clone(),
        );
        assert!(matches!(result, Err(Error::NotParticipating)));

        let result = Machine::<_, _, Key, _, _>::new(
            StdRng::seed_from_u64(0),
            config(),
            fixture.signers[0].clone(),
            fixture.ledger.clone(),
            fixture.network.channel(fixture.key(0)),
            vec![fixture.key(0)],
            fixture.contributions[0].clone(),
        );
        assert!(matches!(
            result,
            Err(Error::InvalidConfig("too few participants"))
        ));
    }

    #[test]
    fn test_poisoned_registry() {
        let fixture = Fixture::new(2);
        let cfg = config();
        let registry = cfg.registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = registry.lock().unwrap();
            panic!("poison the registry");
        })
        .join();
        assert!(cfg.registry.is_poisoned());

        let result = Machine::<_, _, Key, _, _>::new(
            StdRng::seed_from_u64(0),
            cfg,
            fixture.signers[0].clone(),
            fixture.ledger.clone(),
            fixture.network.channel(fixture.key(0)),
            fixture.participants(),
            fixture.contributions[0].clone(),
        );
        assert!(matches!(
            result,
            Err(Error::InvalidConfig("registry poisoned"))
        ));
    }
}
