//! Judge an attempt from the blame packets exchanged about it.

use super::{verdict, Accusation, Context, Evidence, Fault, Verdict};
use crate::{
    coin::{Coin, Input},
    message::{check_digest, Announced},
    Message, Phase, Signed,
};
use bytes::Bytes;
use coinshuffle_cryptography::DecryptionKey;
use commonware_cryptography::PublicKey;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Packets of one attempt indexed by sender and phase.
///
/// A sender is expected to sign at most one packet per phase. When a [Pool] holds more than one
/// distinct packet for the same slot, the sender equivocated and [Pool::get] returns nothing.
#[derive(Clone, Debug)]
pub struct Pool<P: PublicKey> {
    packets: BTreeMap<(P, Phase), Vec<Signed<P>>>,
}

impl<P: PublicKey> Default for Pool<P> {
    fn default() -> Self {
        Self {
            packets: BTreeMap::new(),
        }
    }
}

impl<P: PublicKey> Pool<P> {
    /// Add a packet (duplicates are ignored).
    ///
    /// Callers are expected to have checked authenticity (see [Context::authentic]).
    pub fn insert(&mut self, signed: Signed<P>) {
        let slot = self
            .packets
            .entry((signed.sender().clone(), signed.phase()))
            .or_default();
        if !slot.contains(&signed) {
            slot.push(signed);
        }
    }

    /// The only packet `sender` signed for `phase`.
    pub fn get(&self, sender: &P, phase: Phase) -> Option<&Signed<P>> {
        match self.packets.get(&(sender.clone(), phase)) {
            Some(slot) if slot.len() == 1 => slot.first(),
            _ => None,
        }
    }

    /// Whether any packet `sender` signed for `phase` is held.
    pub fn holds(&self, sender: &P, phase: Phase) -> bool {
        self.packets.contains_key(&(sender.clone(), phase))
    }

    /// Unambiguous packets of `phase`, by sender.
    pub fn phase(&self, phase: Phase) -> impl Iterator<Item = (&P, &Signed<P>)> {
        self.packets
            .iter()
            .filter(move |((_, p), slot)| *p == phase && slot.len() == 1)
            .map(|((sender, _), slot)| (sender, &slot[0]))
    }

    /// Pairs of distinct packets signed by the same sender for the same phase.
    pub fn conflicts(&self) -> impl Iterator<Item = (&Signed<P>, &Signed<P>)> {
        self.packets
            .values()
            .filter(|slot| slot.len() > 1)
            .map(|slot| (&slot[0], &slot[1]))
    }
}

/// Round-0 blame message of one participant.
struct Reveal<P: PublicKey> {
    accusations: Vec<Accusation<P>>,
    decryption_key: Option<Bytes>,
    transcript: Vec<Signed<P>>,
}

/// Result of replaying the shuffle with revealed keys.
#[derive(Debug, PartialEq, Eq)]
struct Replay<P> {
    /// First participant found to have corrupted the list.
    convicted: Option<(P, Fault)>,
    /// Whether the replay reached a conclusion (a conviction, or a fully verified list).
    conclusive: bool,
}

impl<P> Replay<P> {
    fn convict(player: P, fault: Fault) -> Self {
        Self {
            convicted: Some((player, fault)),
            conclusive: true,
        }
    }

    fn inconclusive() -> Self {
        Self {
            convicted: None,
            conclusive: false,
        }
    }
}

/// Convictions, keeping the first fault found for each participant.
struct Convictions<P: PublicKey> {
    convicted: BTreeMap<P, Fault>,
}

impl<P: PublicKey> Convictions<P> {
    fn convict(&mut self, player: &P, fault: Fault, reason: &'static str) {
        if !self.convicted.contains_key(player) {
            debug!(?player, %fault, reason, "convicted");
            self.convicted.insert(player.clone(), fault);
        }
    }
}

/// Determine who caused an attempt to fail from the `blame` packets held after the last round.
///
/// The result depends only on `ctx` and the set of packets in `blame`, so participants holding
/// the same packets reach the same conclusion.
pub fn judge<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    blame: &[Signed<K::PublicKey>],
) -> BTreeMap<K::PublicKey, Fault> {
    let mut convictions = Convictions {
        convicted: BTreeMap::new(),
    };

    // Blame packets that conflict are equivocation in their own right
    let mut rounds = Pool::default();
    for signed in blame {
        let known = matches!(
            signed.phase(),
            Phase::Blame(round) if round <= ctx.corroboration_rounds
        );
        if known && ctx.authentic(signed) {
            rounds.insert(signed.clone());
        }
    }
    for (first, _) in rounds.conflicts() {
        convictions.convict(first.sender(), Fault::EquivocationFailure, "conflicting blame");
    }

    // Open every round-0 message
    let mut reveals = BTreeMap::new();
    for (sender, signed) in rounds.phase(Phase::Blame(0)) {
        match Message::<K::PublicKey, D::EncryptionKey>::from_packet(signed, ctx.limits) {
            Ok(Message::Blame {
                accusations,
                decryption_key,
                transcript,
            }) => {
                reveals.insert(
                    sender.clone(),
                    Reveal {
                        accusations,
                        decryption_key,
                        transcript,
                    },
                );
            }
            _ => convictions.convict(sender, Fault::MalformedPacket, "malformed blame"),
        }
    }

    // Merge everything the attempt produced, as revealed by its participants
    let mut heard = Pool::default();
    for reveal in reveals.values() {
        for signed in &reveal.transcript {
            if !signed.phase().is_blame() && ctx.authentic(signed) {
                heard.insert(signed.clone());
            }
        }
    }
    for (first, _) in heard.conflicts() {
        convictions.convict(first.sender(), Fault::EquivocationFailure, "conflicting packets");
    }
    let mut announcements = BTreeMap::new();
    for (sender, signed) in heard.phase(Phase::Announcement) {
        match Message::<K::PublicKey, D::EncryptionKey>::from_packet(signed, ctx.limits) {
            Ok(Message::Announcement(announced)) => {
                announcements.insert(sender.clone(), announced);
            }
            _ => convictions.convict(sender, Fault::MalformedPacket, "malformed announcement"),
        }
    }

    // Replay the shuffle with the revealed keys
    let replay = replay::<D, K>(ctx, &heard, &announcements, &reveals);
    if let Some((player, fault)) = &replay.convicted {
        convictions.convict(player, *fault, "replay");
    }

    // With the announcements and output agreed, every digest can be checked
    let agreed = agreed::<D, K>(ctx, &heard, &announcements);
    if let Some((ordered, outputs)) = &agreed {
        let expected = check_digest(&ctx.session, ctx.attempt, ordered, outputs);
        for (sender, signed) in heard.phase(Phase::EquivocationCheck) {
            match Message::<K::PublicKey, D::EncryptionKey>::from_packet(signed, ctx.limits) {
                Ok(Message::Check(digest)) if digest == expected => {}
                _ => convictions.convict(sender, Fault::MalformedPacket, "misreported check"),
            }
        }
    }
    let payload = agreed.map(|(ordered, outputs)| {
        let inputs: Vec<_> = ctx
            .players
            .all()
            .iter()
            .zip(ordered)
            .map(|(owner, announced)| Input {
                owner: owner.clone(),
                coin: announced.input,
                change: announced.change,
            })
            .collect();
        ctx.coin
            .payload(&ctx.coin.build(&inputs, &outputs, ctx.amount))
    });

    // Examine every accusation
    for (accuser, reveal) in &reveals {
        for accusation in &reveal.accusations {
            match verdict::<D, K>(ctx, payload.as_ref(), accuser, accusation) {
                Verdict::Accept => {
                    convictions.convict(&accusation.accused, accusation.fault, "accusation")
                }
                Verdict::Reject => {}
                Verdict::Forged => {
                    convictions.convict(accuser, Fault::MalformedPacket, "forged accusation")
                }
                Verdict::Corroborate => {
                    if let Some(fault) =
                        corroborate(ctx, &heard, &reveals, &replay, accuser, accusation)
                    {
                        convictions.convict(&accusation.accused, fault, "corroborated");
                    }
                }
            }
        }
    }

    // Silence during blame is judged from what others relayed in the following round. A packet
    // held by the judge (directly or through any relay) clears its sender of silence, and a
    // single reporter lacking it is not enough to convict.
    for round in 0..ctx.corroboration_rounds {
        let mut reports: BTreeMap<&K::PublicKey, BTreeSet<K::PublicKey>> = BTreeMap::new();
        for (reporter, signed) in rounds.phase(Phase::Blame(round + 1)) {
            let Ok(Message::Relay(relayed)) =
                Message::<K::PublicKey, D::EncryptionKey>::from_packet(signed, ctx.limits)
            else {
                convictions.convict(reporter, Fault::MalformedPacket, "malformed relay");
                continue;
            };
            let held = relayed
                .iter()
                .filter(|packet| packet.phase() == Phase::Blame(round) && ctx.authentic(packet))
                .map(|packet| packet.sender().clone())
                .collect();
            reports.insert(reporter, held);
        }
        for player in ctx.players.all() {
            let lackers = reports
                .iter()
                .filter(|(reporter, held)| **reporter != player && !held.contains(player))
                .count();
            if lackers == 0 {
                continue;
            }
            if !rounds.holds(player, Phase::Blame(round)) {
                convictions.convict(player, Fault::NoResponse, "silent during blame");
            } else if lackers > 1 {
                convictions.convict(player, Fault::EquivocationFailure, "selective during blame");
            }
        }
    }

    convictions.convicted
}

/// Announcements in rank order and the output list, if every participant's is known.
fn agreed<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    heard: &Pool<K::PublicKey>,
    announcements: &BTreeMap<K::PublicKey, Announced<D::EncryptionKey>>,
) -> Option<(Vec<Announced<D::EncryptionKey>>, Vec<Bytes>)> {
    let ordered = ctx
        .players
        .all()
        .iter()
        .map(|player| announcements.get(player).cloned())
        .collect::<Option<Vec<_>>>()?;
    let output = heard.get(ctx.players.last(), Phase::BroadcastOutput)?;
    match Message::<K::PublicKey, D::EncryptionKey>::from_packet(output, ctx.limits) {
        Ok(Message::Output(outputs)) => Some((ordered, outputs)),
        _ => None,
    }
}

/// Decide an accusation that could not be settled from its own evidence.
fn corroborate<K: Coin>(
    ctx: &Context<'_, K>,
    heard: &Pool<K::PublicKey>,
    reveals: &BTreeMap<K::PublicKey, Reveal<K::PublicKey>>,
    replay: &Replay<K::PublicKey>,
    accuser: &K::PublicKey,
    accusation: &Accusation<K::PublicKey>,
) -> Option<Fault> {
    let accused = &accusation.accused;
    match &accusation.evidence {
        // The replay attributes corrupted entries to whoever introduced them. Without it, the
        // predecessor that handed over the list is held responsible.
        Evidence::Shuffle { .. } => (!replay.conclusive).then_some(Fault::ShuffleFailure),

        // The accused's own reveal (or anyone else's) shows whether the list was handed over
        Evidence::Silence {
            phase: Phase::Shuffling,
        } => match heard.get(accused, Phase::Shuffling) {
            Some(signed) if signed.packet.recipient.as_ref() == Some(accuser) => None,
            _ => Some(Fault::NoResponse),
        },

        // Broadcasts are checked against what everyone else heard
        Evidence::Silence { phase } => {
            let mut holders = 0;
            let mut lackers = 0;
            for (witness, reveal) in reveals {
                if witness == accuser || witness == accused {
                    continue;
                }
                let held = reveal.transcript.iter().any(|signed| {
                    signed.sender() == accused && signed.phase() == *phase && ctx.authentic(signed)
                });
                if held {
                    holders += 1;
                } else {
                    lackers += 1;
                }
            }
            match (holders, lackers) {
                (0, 0) => None,
                (0, _) => Some(Fault::NoResponse),
                (_, 0) => None,
                _ => Some(Fault::EquivocationFailure),
            }
        }
        _ => None,
    }
}

/// Replay the shuffle rank by rank, tracking which rank introduced each entry.
///
/// At rank `r`, every entry of the incoming list must peel with `r`'s revealed key, and `r`'s
/// outgoing list must hold exactly `r` distinct entries: every peeled entry plus one new one. An
/// entry that fails to peel is blamed on the rank that introduced it.
fn replay<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    heard: &Pool<K::PublicKey>,
    announcements: &BTreeMap<K::PublicKey, Announced<D::EncryptionKey>>,
    reveals: &BTreeMap<K::PublicKey, Reveal<K::PublicKey>>,
) -> Replay<K::PublicKey> {
    let players = ctx.players;
    let n = players.len();
    let mut incoming: Vec<(Bytes, usize)> = Vec::new();
    for rank in 1..=n {
        let Some(player) = players.key(rank) else {
            return Replay::inconclusive();
        };
        let (Some(announced), Some(revealed)) = (
            announcements.get(player),
            reveals
                .get(player)
                .and_then(|reveal| reveal.decryption_key.as_ref()),
        ) else {
            return Replay::inconclusive();
        };
        let key = match D::try_from(revealed.as_ref()) {
            Ok(key) if key.encryption_key() == announced.encryption_key => key,
            _ => return Replay::convict(player.clone(), Fault::ShuffleFailure),
        };

        // Peel this rank's layer
        let mut origins = BTreeMap::new();
        for (entry, origin) in &incoming {
            let Ok(inner) = key.decrypt(entry) else {
                return blame_origin(players, *origin);
            };
            if let Some(previous) = origins.insert(Bytes::from(inner), *origin) {
                return blame_origin(players, previous.max(*origin));
            }
        }

        // Find what this rank handed on
        let (phase, recipient) = if rank < n {
            (Phase::Shuffling, players.key(rank + 1))
        } else {
            (Phase::BroadcastOutput, None)
        };
        let Some(signed) = heard.get(player, phase) else {
            return Replay::inconclusive();
        };
        if signed.packet.recipient.as_ref() != recipient {
            return Replay::inconclusive();
        }
        let decoded = Message::<K::PublicKey, D::EncryptionKey>::from_packet(signed, ctx.limits);
        let list = match decoded {
            Ok(Message::Shuffle(list)) if rank < n => list,
            Ok(Message::Output(list)) if rank == n => list,
            _ => return Replay::convict(player.clone(), Fault::MalformedPacket),
        };
        let distinct: BTreeSet<_> = list.iter().collect();
        if list.len() != rank
            || distinct.len() != list.len()
            || origins.keys().any(|inner| !distinct.contains(inner))
        {
            return Replay::convict(player.clone(), Fault::ShuffleFailure);
        }
        incoming = list
            .into_iter()
            .map(|entry| {
                let origin = origins.get(&entry).copied().unwrap_or(rank);
                (entry, origin)
            })
            .collect();
    }
    Replay {
        convicted: None,
        conclusive: true,
    }
}

fn blame_origin<P: PublicKey>(players: &crate::Players<P>, origin: usize) -> Replay<P> {
    match players.key(origin) {
        Some(player) => Replay::convict(player.clone(), Fault::ShuffleFailure),
        None => Replay::inconclusive(),
    }
}
