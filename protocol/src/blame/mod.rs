//! Attribute a failed attempt to the participants that caused it.
//!
//! When an attempt fails, every participant moves to [Phase::Blame]. In round 0 each one
//! broadcasts its [Accusation]s, the ephemeral decryption key of the attempt, and every packet it
//! heard. The following corroboration rounds relay the blame packets heard in the previous round,
//! so that silence can be confirmed by third parties rather than taken on an accuser's word.
//!
//! Judging is a pure function of the blame packets a participant holds once the last round ends
//! (see [judge]). Honest participants holding the same packets convict the same set, which
//! [resolve] turns into a retry (without the convicted) or an abort.
//!
//! # Verdicts
//!
//! Each accusation is examined on its own (see [verdict]):
//! - Self-certifying evidence (signed announcements, malformed or conflicting packets, invalid
//!   shares) is checked directly and either accepted or rejected.
//! - Evidence that is signed by the accused but does not show what the accuser claims is
//!   [Verdict::Forged], and convicts the accuser instead.
//! - Silence and undecryptable shuffle entries cannot be proven by one participant. They are
//!   [Verdict::Corroborate]d against the transcripts of the others and a replay of the shuffle.

use crate::{coin::Coin, Limits, Phase, Players, SessionId, Signed};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::PublicKey;
use std::{collections::BTreeMap, fmt::Display};

mod transcript;
pub use transcript::{judge, Pool};
mod verdict;
pub use verdict::verdict;

/// Misbehavior a participant can be convicted of.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fault {
    /// Announced an input that cannot cover the amount.
    InsufficientFunds,
    /// Announced an input that is spent or not owned by the announcer.
    DuplicateRegistration,
    /// Sent a packet that cannot be decoded or is stamped with the wrong phase, or
    /// carries an invalid signature share. Also applied to accusers that submit forged evidence.
    MalformedPacket,
    /// Corrupted, dropped, or duplicated entries of the shuffled list.
    ShuffleFailure,
    /// Sent conflicting packets for the same phase.
    EquivocationFailure,
    /// Withheld a packet it was required to send.
    NoResponse,
}

const INSUFFICIENT_FUNDS_TAG: u8 = 0;
const DUPLICATE_REGISTRATION_TAG: u8 = 1;
const MALFORMED_PACKET_TAG: u8 = 2;
const SHUFFLE_FAILURE_TAG: u8 = 3;
const EQUIVOCATION_FAILURE_TAG: u8 = 4;
const NO_RESPONSE_TAG: u8 = 5;

impl Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::InsufficientFunds => write!(f, "insufficient_funds"),
            Fault::DuplicateRegistration => write!(f, "duplicate_registration"),
            Fault::MalformedPacket => write!(f, "malformed_packet"),
            Fault::ShuffleFailure => write!(f, "shuffle_failure"),
            Fault::EquivocationFailure => write!(f, "equivocation_failure"),
            Fault::NoResponse => write!(f, "no_response"),
        }
    }
}

impl Write for Fault {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(match self {
            Fault::InsufficientFunds => INSUFFICIENT_FUNDS_TAG,
            Fault::DuplicateRegistration => DUPLICATE_REGISTRATION_TAG,
            Fault::MalformedPacket => MALFORMED_PACKET_TAG,
            Fault::ShuffleFailure => SHUFFLE_FAILURE_TAG,
            Fault::EquivocationFailure => EQUIVOCATION_FAILURE_TAG,
            Fault::NoResponse => NO_RESPONSE_TAG,
        });
    }
}

impl FixedSize for Fault {
    const SIZE: usize = 1;
}

impl Read for Fault {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            INSUFFICIENT_FUNDS_TAG => Ok(Fault::InsufficientFunds),
            DUPLICATE_REGISTRATION_TAG => Ok(Fault::DuplicateRegistration),
            MALFORMED_PACKET_TAG => Ok(Fault::MalformedPacket),
            SHUFFLE_FAILURE_TAG => Ok(Fault::ShuffleFailure),
            EQUIVOCATION_FAILURE_TAG => Ok(Fault::EquivocationFailure),
            NO_RESPONSE_TAG => Ok(Fault::NoResponse),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

/// Material supporting an [Accusation].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evidence<P: PublicKey> {
    /// The accused's announcement, whose input failed verification.
    Announcement(Signed<P>),
    /// A packet from the accused that could not be decoded or was stamped for another session.
    Malformed(Signed<P>),
    /// The accused's signature share, which does not verify over the transaction.
    Share(Signed<P>),
    /// Two distinct packets the accused signed for the same phase.
    Conflict(Signed<P>, Signed<P>),
    /// The shuffled list the accused handed to the accuser, the accuser's announcement, and the
    /// accuser's decryption key, which together show the list could not be processed.
    Shuffle {
        shuffle: Signed<P>,
        announcement: Signed<P>,
        key: Bytes,
    },
    /// Nothing was heard from the accused in `phase`.
    Silence { phase: Phase },
}

const ANNOUNCEMENT_EVIDENCE_TAG: u8 = 0;
const MALFORMED_EVIDENCE_TAG: u8 = 1;
const SHARE_EVIDENCE_TAG: u8 = 2;
const CONFLICT_EVIDENCE_TAG: u8 = 3;
const SHUFFLE_EVIDENCE_TAG: u8 = 4;
const SILENCE_EVIDENCE_TAG: u8 = 5;

impl<P: PublicKey> Evidence<P> {
    /// The fault this kind of evidence can support.
    ///
    /// Announcement evidence may support either [Fault::InsufficientFunds] or
    /// [Fault::DuplicateRegistration] and returns `None`.
    pub fn fault(&self) -> Option<Fault> {
        match self {
            Evidence::Announcement(_) => None,
            Evidence::Malformed(_) | Evidence::Share(_) => Some(Fault::MalformedPacket),
            Evidence::Conflict(..) => Some(Fault::EquivocationFailure),
            Evidence::Shuffle { .. } => Some(Fault::ShuffleFailure),
            Evidence::Silence { .. } => Some(Fault::NoResponse),
        }
    }
}

impl<P: PublicKey> Write for Evidence<P> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Evidence::Announcement(signed) => {
                buf.put_u8(ANNOUNCEMENT_EVIDENCE_TAG);
                signed.write(buf);
            }
            Evidence::Malformed(signed) => {
                buf.put_u8(MALFORMED_EVIDENCE_TAG);
                signed.write(buf);
            }
            Evidence::Share(signed) => {
                buf.put_u8(SHARE_EVIDENCE_TAG);
                signed.write(buf);
            }
            Evidence::Conflict(first, second) => {
                buf.put_u8(CONFLICT_EVIDENCE_TAG);
                first.write(buf);
                second.write(buf);
            }
            Evidence::Shuffle {
                shuffle,
                announcement,
                key,
            } => {
                buf.put_u8(SHUFFLE_EVIDENCE_TAG);
                shuffle.write(buf);
                announcement.write(buf);
                key.write(buf);
            }
            Evidence::Silence { phase } => {
                buf.put_u8(SILENCE_EVIDENCE_TAG);
                phase.write(buf);
            }
        }
    }
}

impl<P: PublicKey> EncodeSize for Evidence<P> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Evidence::Announcement(signed)
            | Evidence::Malformed(signed)
            | Evidence::Share(signed) => signed.encode_size(),
            Evidence::Conflict(first, second) => first.encode_size() + second.encode_size(),
            Evidence::Shuffle {
                shuffle,
                announcement,
                key,
            } => shuffle.encode_size() + announcement.encode_size() + key.encode_size(),
            Evidence::Silence { phase } => phase.encode_size(),
        }
    }
}

/// Reads evidence whose embedded payloads are at most `max_size` bytes.
impl<P: PublicKey> Read for Evidence<P> {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_size: &usize) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            ANNOUNCEMENT_EVIDENCE_TAG => Ok(Evidence::Announcement(Signed::read_cfg(
                buf, max_size,
            )?)),
            MALFORMED_EVIDENCE_TAG => Ok(Evidence::Malformed(Signed::read_cfg(buf, max_size)?)),
            SHARE_EVIDENCE_TAG => Ok(Evidence::Share(Signed::read_cfg(buf, max_size)?)),
            CONFLICT_EVIDENCE_TAG => Ok(Evidence::Conflict(
                Signed::read_cfg(buf, max_size)?,
                Signed::read_cfg(buf, max_size)?,
            )),
            SHUFFLE_EVIDENCE_TAG => Ok(Evidence::Shuffle {
                shuffle: Signed::read_cfg(buf, max_size)?,
                announcement: Signed::read_cfg(buf, max_size)?,
                key: Bytes::read_cfg(buf, &(..=*max_size).into())?,
            }),
            SILENCE_EVIDENCE_TAG => Ok(Evidence::Silence {
                phase: Phase::read(buf)?,
            }),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

/// A claim that `accused` committed `fault`, backed by `evidence`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accusation<P: PublicKey> {
    pub accused: P,
    pub fault: Fault,
    pub evidence: Evidence<P>,
}

impl<P: PublicKey> Write for Accusation<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.accused.write(buf);
        self.fault.write(buf);
        self.evidence.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for Accusation<P> {
    fn encode_size(&self) -> usize {
        self.accused.encode_size() + self.fault.encode_size() + self.evidence.encode_size()
    }
}

impl<P: PublicKey> Read for Accusation<P> {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_size: &usize) -> Result<Self, CodecError> {
        Ok(Self {
            accused: P::read(buf)?,
            fault: Fault::read(buf)?,
            evidence: Evidence::read_cfg(buf, max_size)?,
        })
    }
}

/// Outcome of examining a single [Accusation].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The evidence proves the fault.
    Accept,
    /// The evidence does not prove the fault.
    Reject,
    /// The evidence is signed by the accused but contradicts the accusation, so the accuser is
    /// convicted of [Fault::MalformedPacket].
    Forged,
    /// The evidence is plausible but must be confirmed by other participants.
    Corroborate,
}

/// Everything needed to judge packets of one attempt.
#[derive(Clone)]
pub struct Context<'a, K: Coin> {
    /// Namespace packets are signed under.
    pub namespace: &'a [u8],
    /// Namespace signature shares are signed under.
    pub transaction_namespace: &'a [u8],
    pub session: SessionId,
    pub attempt: u32,
    /// Value every participant contributes.
    pub amount: u64,
    pub players: &'a Players<K::PublicKey>,
    pub coin: &'a K,
    pub limits: Limits,
    /// Number of corroboration rounds that follow round 0.
    pub corroboration_rounds: u8,
}

impl<K: Coin> Context<'_, K> {
    /// Returns whether `signed` is a correctly signed packet of this attempt from a participant.
    pub fn authentic(&self, signed: &Signed<K::PublicKey>) -> bool {
        signed.packet.session == self.session
            && signed.packet.attempt == self.attempt
            && self.players.contains(signed.sender())
            && signed.verify(self.namespace)
    }
}

/// What to do after judging an attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution<P: PublicKey> {
    /// Start a new attempt with the remaining participants.
    Retry(Players<P>),
    /// Stop without a transaction.
    Abort,
}

/// Decide whether to retry without the `convicted` participants.
///
/// A retry requires at least one conviction (otherwise the same attempt would fail again), that
/// the local participant is not among the convicted, that at least `min_players` remain, and that
/// `attempt` is not the last one allowed.
pub fn resolve<P: PublicKey>(
    convicted: &BTreeMap<P, Fault>,
    players: &Players<P>,
    min_players: usize,
    attempt: u32,
    max_attempts: u32,
) -> Resolution<P> {
    if convicted.is_empty() || attempt.saturating_add(1) >= max_attempts {
        return Resolution::Abort;
    }
    let Ok(remaining) = players.exclude(convicted.keys()) else {
        return Resolution::Abort;
    };
    if remaining.len() < min_players {
        return Resolution::Abort;
    }
    Resolution::Retry(remaining)
}
