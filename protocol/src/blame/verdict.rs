use super::{Accusation, Context, Evidence, Fault, Verdict};
use crate::{coin::Coin, Message, Phase, Signed};
use bytes::Bytes;
use coinshuffle_cryptography::DecryptionKey;
use commonware_cryptography::Verifier;
use std::collections::BTreeSet;

type Msg<K, D> = Message<<K as Coin>::PublicKey, <D as DecryptionKey>::EncryptionKey>;

/// Examine `accusation`, raised by `accuser`, on its own.
///
/// `payload` is the signing payload of the transaction the attempt would have produced, if it
/// could be reconstructed from the packets heard.
pub fn verdict<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    payload: Option<&Bytes>,
    accuser: &K::PublicKey,
    accusation: &Accusation<K::PublicKey>,
) -> Verdict {
    let accused = &accusation.accused;
    if accused == accuser || !ctx.players.contains(accused) {
        return Verdict::Reject;
    }
    match accusation.evidence.fault() {
        Some(fault) if fault != accusation.fault => return Verdict::Forged,
        None if !matches!(
            accusation.fault,
            Fault::InsufficientFunds | Fault::DuplicateRegistration
        ) =>
        {
            return Verdict::Forged
        }
        _ => {}
    }

    match &accusation.evidence {
        Evidence::Announcement(signed) => {
            announcement::<D, K>(ctx, accused, accusation.fault, signed)
        }
        Evidence::Malformed(signed) => malformed::<D, K>(ctx, accused, signed),
        Evidence::Share(signed) => share::<D, K>(ctx, payload, accused, signed),
        Evidence::Conflict(first, second) => conflict(ctx, accused, first, second),
        Evidence::Shuffle {
            shuffle,
            announcement,
            key,
        } => shuffled::<D, K>(ctx, accuser, accused, shuffle, announcement, key),
        Evidence::Silence { phase } => silence(ctx, accuser, accused, *phase),
    }
}

fn from_accused<K: Coin>(
    ctx: &Context<'_, K>,
    accused: &K::PublicKey,
    signed: &Signed<K::PublicKey>,
    phase: Phase,
) -> bool {
    signed.sender() == accused && signed.phase() == phase && ctx.authentic(signed)
}

fn announcement<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    accused: &K::PublicKey,
    fault: Fault,
    signed: &Signed<K::PublicKey>,
) -> Verdict {
    if !from_accused(ctx, accused, signed, Phase::Announcement) {
        return Verdict::Reject;
    }
    let Ok(Msg::<K, D>::Announcement(announced)) = Message::from_packet(signed, ctx.limits) else {
        return Verdict::Reject;
    };
    match ctx.coin.verify_input(accused, &announced.input, ctx.amount) {
        Err(err) if err.fault() == fault => Verdict::Accept,
        _ => Verdict::Reject,
    }
}

fn malformed<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    accused: &K::PublicKey,
    signed: &Signed<K::PublicKey>,
) -> Verdict {
    if signed.sender() != accused || !signed.verify(ctx.namespace) {
        return Verdict::Reject;
    }
    if signed.packet.session != ctx.session {
        return Verdict::Accept;
    }
    if signed.packet.attempt != ctx.attempt {
        return Verdict::Reject;
    }
    match Msg::<K, D>::from_packet(signed, ctx.limits) {
        Err(_) => Verdict::Accept,
        Ok(_) => Verdict::Forged,
    }
}

fn share<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    payload: Option<&Bytes>,
    accused: &K::PublicKey,
    signed: &Signed<K::PublicKey>,
) -> Verdict {
    if !from_accused(ctx, accused, signed, Phase::VerificationAndSubmission) {
        return Verdict::Reject;
    }
    let Some(payload) = payload else {
        return Verdict::Reject;
    };
    match Msg::<K, D>::from_packet(signed, ctx.limits) {
        Ok(Message::Share(signature)) => {
            if accused.verify(Some(ctx.transaction_namespace), payload, &signature) {
                Verdict::Reject
            } else {
                Verdict::Accept
            }
        }
        _ => Verdict::Accept,
    }
}

fn conflict<K: Coin>(
    ctx: &Context<'_, K>,
    accused: &K::PublicKey,
    first: &Signed<K::PublicKey>,
    second: &Signed<K::PublicKey>,
) -> Verdict {
    if !from_accused(ctx, accused, first, first.phase())
        || !from_accused(ctx, accused, second, second.phase())
    {
        return Verdict::Reject;
    }
    if first.phase() != second.phase() || first.packet == second.packet {
        return Verdict::Forged;
    }
    Verdict::Accept
}

fn shuffled<D: DecryptionKey, K: Coin>(
    ctx: &Context<'_, K>,
    accuser: &K::PublicKey,
    accused: &K::PublicKey,
    shuffle: &Signed<K::PublicKey>,
    announcement: &Signed<K::PublicKey>,
    key: &Bytes,
) -> Verdict {
    let (Some(rank), Some(accused_rank)) = (ctx.players.rank(accuser), ctx.players.rank(accused))
    else {
        return Verdict::Reject;
    };
    if accused_rank + 1 != rank {
        return Verdict::Forged;
    }
    if !from_accused(ctx, accused, shuffle, Phase::Shuffling)
        || shuffle.packet.recipient.as_ref() != Some(accuser)
        || !from_accused(ctx, accuser, announcement, Phase::Announcement)
    {
        return Verdict::Reject;
    }
    let Ok(Msg::<K, D>::Announcement(announced)) = Message::from_packet(announcement, ctx.limits)
    else {
        return Verdict::Reject;
    };
    let Ok(key) = D::try_from(key.as_ref()) else {
        return Verdict::Forged;
    };
    if key.encryption_key() != announced.encryption_key {
        return Verdict::Forged;
    }

    // Faults visible in the list itself belong to the accused
    let Ok(Message::Shuffle(list)) = Msg::<K, D>::from_packet(shuffle, ctx.limits) else {
        return Verdict::Accept;
    };
    if list.len() != rank - 1 || list.iter().collect::<BTreeSet<_>>().len() != list.len() {
        return Verdict::Accept;
    }

    // Entries that do not peel may have been corrupted by any earlier rank
    let mut peeled = BTreeSet::new();
    for entry in &list {
        match key.decrypt(entry) {
            Ok(inner) => {
                if !peeled.insert(inner) {
                    return Verdict::Corroborate;
                }
            }
            Err(_) => return Verdict::Corroborate,
        }
    }
    Verdict::Forged
}

fn silence<K: Coin>(
    ctx: &Context<'_, K>,
    accuser: &K::PublicKey,
    accused: &K::PublicKey,
    phase: Phase,
) -> Verdict {
    match phase {
        Phase::Shuffling => {
            let (Some(rank), Some(accused_rank)) =
                (ctx.players.rank(accuser), ctx.players.rank(accused))
            else {
                return Verdict::Reject;
            };
            if accused_rank + 1 == rank {
                Verdict::Corroborate
            } else {
                Verdict::Forged
            }
        }
        Phase::BroadcastOutput => {
            if accused == ctx.players.last() {
                Verdict::Corroborate
            } else {
                Verdict::Forged
            }
        }
        Phase::Announcement | Phase::EquivocationCheck | Phase::VerificationAndSubmission => {
            Verdict::Corroborate
        }
        Phase::Blame(_) | Phase::Completed => Verdict::Reject,
    }
}
