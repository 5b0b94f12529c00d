//! Session identifiers, phases, and the signed packet envelope.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{Hasher, PublicKey, Sha256, Signer, Verifier};
use commonware_utils::hex;
use std::fmt::{Debug, Display};

/// Length of a [SessionId].
const SESSION_LENGTH: usize = 32;

/// Opaque token correlating every packet of one shuffle.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; SESSION_LENGTH]);

impl SessionId {
    /// Derive a [SessionId] from a human-readable label.
    pub fn new(label: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"coinshuffle/session/");
        hasher.update(label);
        let digest = hasher.finalize();
        let mut raw = [0u8; SESSION_LENGTH];
        raw.copy_from_slice(&digest);
        Self(raw)
    }
}

impl From<[u8; SESSION_LENGTH]> for SessionId {
    fn from(value: [u8; SESSION_LENGTH]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Write for SessionId {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for SessionId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; SESSION_LENGTH]>::read(buf)?))
    }
}

impl FixedSize for SessionId {
    const SIZE: usize = SESSION_LENGTH;
}

/// Step of a shuffle attempt.
///
/// Phases are ordered: within one attempt a participant only ever moves to a later phase (see
/// [Phase::can_transition]). A retry starts a new attempt, which begins again at
/// [Phase::Announcement].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Broadcast an ephemeral encryption key and an input commitment.
    Announcement,
    /// Pass the layered-encrypted output list along the rank chain.
    Shuffling,
    /// The last rank broadcasts the decrypted output list.
    BroadcastOutput,
    /// Broadcast a digest of everything received so far.
    EquivocationCheck,
    /// Broadcast a signature share over the agreed transaction.
    VerificationAndSubmission,
    /// Resolve a fault.
    ///
    /// Round 0 exchanges accusations and reveals, later rounds relay what was heard in earlier
    /// ones so that silence can be corroborated.
    Blame(u8),
    /// The transaction was submitted.
    Completed,
}

const ANNOUNCEMENT_TAG: u8 = 0;
const SHUFFLING_TAG: u8 = 1;
const BROADCAST_OUTPUT_TAG: u8 = 2;
const EQUIVOCATION_CHECK_TAG: u8 = 3;
const VERIFICATION_TAG: u8 = 4;
const BLAME_TAG: u8 = 5;
const COMPLETED_TAG: u8 = 6;

impl Phase {
    /// Returns whether a participant in `self` may move to `next` within the same attempt.
    pub fn can_transition(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Completed, _) => false,
            (Blame(round), Blame(next)) => round.checked_add(1) == Some(next),
            (Blame(_), _) => false,
            (_, Blame(0)) => true,
            (Announcement, Shuffling)
            | (Shuffling, BroadcastOutput)
            | (BroadcastOutput, EquivocationCheck)
            | (EquivocationCheck, VerificationAndSubmission)
            | (VerificationAndSubmission, Completed) => true,
            _ => false,
        }
    }

    /// Returns whether this is one of the [Phase::Blame] rounds.
    pub fn is_blame(self) -> bool {
        matches!(self, Phase::Blame(_))
    }

    /// Returns whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed)
    }

    fn tag(self) -> u8 {
        match self {
            Phase::Announcement => ANNOUNCEMENT_TAG,
            Phase::Shuffling => SHUFFLING_TAG,
            Phase::BroadcastOutput => BROADCAST_OUTPUT_TAG,
            Phase::EquivocationCheck => EQUIVOCATION_CHECK_TAG,
            Phase::VerificationAndSubmission => VERIFICATION_TAG,
            Phase::Blame(_) => BLAME_TAG,
            Phase::Completed => COMPLETED_TAG,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Announcement => write!(f, "announcement"),
            Phase::Shuffling => write!(f, "shuffling"),
            Phase::BroadcastOutput => write!(f, "broadcast_output"),
            Phase::EquivocationCheck => write!(f, "equivocation_check"),
            Phase::VerificationAndSubmission => write!(f, "verification_and_submission"),
            Phase::Blame(round) => write!(f, "blame_{round}"),
            Phase::Completed => write!(f, "completed"),
        }
    }
}

impl Write for Phase {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.tag());
        if let Phase::Blame(round) = self {
            buf.put_u8(*round);
        }
    }
}

impl EncodeSize for Phase {
    fn encode_size(&self) -> usize {
        match self {
            Phase::Blame(_) => 2,
            _ => 1,
        }
    }
}

impl Read for Phase {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            ANNOUNCEMENT_TAG => Ok(Phase::Announcement),
            SHUFFLING_TAG => Ok(Phase::Shuffling),
            BROADCAST_OUTPUT_TAG => Ok(Phase::BroadcastOutput),
            EQUIVOCATION_CHECK_TAG => Ok(Phase::EquivocationCheck),
            VERIFICATION_TAG => Ok(Phase::VerificationAndSubmission),
            BLAME_TAG => Ok(Phase::Blame(u8::read(buf)?)),
            COMPLETED_TAG => Ok(Phase::Completed),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

/// Immutable envelope for a single protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Packet<P: PublicKey> {
    /// Session this packet belongs to.
    pub session: SessionId,
    /// Attempt of the session (0 for the first run, incremented on every retry).
    pub attempt: u32,
    /// Phase the sender was in when producing the packet.
    pub phase: Phase,
    /// Participant that produced the packet.
    pub sender: P,
    /// Intended recipient, or `None` for a packet broadcast to every participant.
    pub recipient: Option<P>,
    /// Encoded [crate::Message].
    pub payload: Bytes,
}

impl<P: PublicKey> Write for Packet<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.session.write(buf);
        self.attempt.write(buf);
        self.phase.write(buf);
        self.sender.write(buf);
        self.recipient.write(buf);
        self.payload.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for Packet<P> {
    fn encode_size(&self) -> usize {
        self.session.encode_size()
            + self.attempt.encode_size()
            + self.phase.encode_size()
            + self.sender.encode_size()
            + self.recipient.encode_size()
            + self.payload.encode_size()
    }
}

/// Reads a packet whose payload is at most `max_payload` bytes.
impl<P: PublicKey> Read for Packet<P> {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, CodecError> {
        Ok(Self {
            session: SessionId::read(buf)?,
            attempt: u32::read(buf)?,
            phase: Phase::read(buf)?,
            sender: P::read(buf)?,
            recipient: Option::<P>::read(buf)?,
            payload: Bytes::read_cfg(buf, &(..=*max_payload).into())?,
        })
    }
}

/// A [Packet] with its sender's signature.
///
/// Because the signature covers the whole envelope, a [Signed] packet is self-certifying: anyone
/// holding it can prove what the sender said, in which session, attempt, and phase.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signed<P: PublicKey> {
    pub packet: Packet<P>,
    pub signature: P::Signature,
}

impl<P: PublicKey> Signed<P> {
    /// Sign `packet` with `signer`.
    ///
    /// `namespace` must be the packet namespace of the session (see [crate::packet_namespace]).
    pub fn sign<C: Signer<PublicKey = P, Signature = P::Signature>>(
        signer: &C,
        namespace: &[u8],
        packet: Packet<P>,
    ) -> Self {
        let signature = signer.sign(Some(namespace), &packet.encode());
        Self { packet, signature }
    }

    /// Returns whether the signature was produced by the packet's sender.
    pub fn verify(&self, namespace: &[u8]) -> bool {
        let message = self.packet.encode();
        self.packet
            .sender
            .verify(Some(namespace), &message, &self.signature)
    }

    /// Sender of the packet.
    pub fn sender(&self) -> &P {
        &self.packet.sender
    }

    /// Phase of the packet.
    pub fn phase(&self) -> Phase {
        self.packet.phase
    }
}

impl<P: PublicKey> Write for Signed<P> {
    fn write(&self, buf: &mut impl BufMut) {
        self.packet.write(buf);
        self.signature.write(buf);
    }
}

impl<P: PublicKey> EncodeSize for Signed<P> {
    fn encode_size(&self) -> usize {
        self.packet.encode_size() + self.signature.encode_size()
    }
}

impl<P: PublicKey> Read for Signed<P> {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, CodecError> {
        let packet = Packet::read_cfg(buf, max_payload)?;
        let signature = P::Signature::read(buf)?;
        Ok(Self { packet, signature })
    }
}
