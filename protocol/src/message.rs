//! Payloads carried inside a [crate::Packet].

use crate::{blame::Accusation, Phase, SessionId, Signed};
use bytes::{Buf, BufMut, Bytes};
use coinshuffle_cryptography::EncryptionKey;
use commonware_codec::{Decode, Encode, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher, PublicKey,
};

/// Maximum number of packets a single participant may contribute to a list (transcripts, relays,
/// accusations).
const PACKETS_PER_PLAYER: usize = 8;

/// Bounds applied when decoding untrusted messages.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Maximum number of participants in a session.
    pub max_players: usize,
    /// Maximum size of a single encoded packet (and of any byte string inside it).
    pub max_message_size: usize,
}

impl Limits {
    /// Maximum number of packets in a transcript, relay, or accusation list.
    pub fn max_packets(&self) -> usize {
        self.max_players.saturating_mul(PACKETS_PER_PLAYER)
    }
}

/// Content of a packet.
///
/// Each variant belongs to exactly one phase (see [Message::phase_matches]); a packet whose
/// payload does not match its stamped phase is malformed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message<P: PublicKey, E: EncryptionKey> {
    /// Ephemeral encryption key and input commitment.
    Announcement(Announced<E>),
    /// Layered-encrypted output list passed along the rank chain.
    Shuffle(Vec<Bytes>),
    /// Fully decrypted output list broadcast by the last rank.
    Output(Vec<Bytes>),
    /// Digest over the announcements and output list a participant holds.
    Check(Digest),
    /// Signature over the transaction's signing payload.
    Share(P::Signature),
    /// Accusations, the ephemeral decryption key, and everything heard this attempt.
    Blame {
        accusations: Vec<Accusation<P>>,
        decryption_key: Option<Bytes>,
        transcript: Vec<Signed<P>>,
    },
    /// Blame packets heard in earlier blame rounds.
    Relay(Vec<Signed<P>>),
}

/// What a participant committed to during [Phase::Announcement].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Announced<E: EncryptionKey> {
    /// Ephemeral key that peels this participant's layer during shuffling.
    pub encryption_key: E,
    /// Coin funding the participant's share of the transaction.
    pub input: Bytes,
    /// Optional address receiving the input's surplus.
    pub change: Option<Bytes>,
}

impl<E: EncryptionKey> Write for Announced<E> {
    fn write(&self, buf: &mut impl BufMut) {
        self.encryption_key.write(buf);
        self.input.write(buf);
        self.change.write(buf);
    }
}

impl<E: EncryptionKey> EncodeSize for Announced<E> {
    fn encode_size(&self) -> usize {
        self.encryption_key.encode_size() + self.input.encode_size() + self.change.encode_size()
    }
}

impl<E: EncryptionKey> Read for Announced<E> {
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_size: &usize) -> Result<Self, CodecError> {
        Ok(Self {
            encryption_key: E::read(buf)?,
            input: Bytes::read_cfg(buf, &(..=*max_size).into())?,
            change: Option::<Bytes>::read_cfg(buf, &(..=*max_size).into())?,
        })
    }
}

/// Digest over the announcements (in rank order) and output list of one attempt.
///
/// Participants that heard the same announcements and the same output list compute the same
/// digest, so comparing digests detects equivocation that no single participant can see.
pub fn check_digest<E: EncryptionKey>(
    session: &SessionId,
    attempt: u32,
    announcements: &[Announced<E>],
    outputs: &[Bytes],
) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(CHECK_PREFIX);
    hasher.update(session.as_ref());
    hasher.update(&attempt.to_be_bytes());
    for announced in announcements {
        hasher.update(&announced.encode());
    }
    hasher.update(&outputs.to_vec().encode());
    hasher.finalize()
}

const CHECK_PREFIX: &[u8] = b"coinshuffle/check/";

const ANNOUNCEMENT_TAG: u8 = 0;
const SHUFFLE_TAG: u8 = 1;
const OUTPUT_TAG: u8 = 2;
const CHECK_TAG: u8 = 3;
const SHARE_TAG: u8 = 4;
const BLAME_TAG: u8 = 5;
const RELAY_TAG: u8 = 6;

impl<P: PublicKey, E: EncryptionKey> Message<P, E> {
    /// Returns whether this message may be sent in `phase`.
    pub fn phase_matches(&self, phase: Phase) -> bool {
        matches!(
            (self, phase),
            (Message::Announcement(_), Phase::Announcement)
                | (Message::Shuffle(_), Phase::Shuffling)
                | (Message::Output(_), Phase::BroadcastOutput)
                | (Message::Check(_), Phase::EquivocationCheck)
                | (Message::Share(_), Phase::VerificationAndSubmission)
                | (Message::Blame { .. }, Phase::Blame(0))
        ) || matches!((self, phase), (Message::Relay(_), Phase::Blame(round)) if round > 0)
    }

    /// Decode the payload of `signed` and check it against the packet's phase.
    pub fn from_packet(signed: &Signed<P>, limits: Limits) -> Result<Self, CodecError> {
        let message = Self::decode_cfg(signed.packet.payload.clone(), &limits)?;
        if !message.phase_matches(signed.packet.phase) {
            return Err(CodecError::Invalid("Message", "phase mismatch"));
        }
        Ok(message)
    }
}

impl<P: PublicKey, E: EncryptionKey> Write for Message<P, E> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Message::Announcement(announced) => {
                buf.put_u8(ANNOUNCEMENT_TAG);
                announced.write(buf);
            }
            Message::Shuffle(list) => {
                buf.put_u8(SHUFFLE_TAG);
                list.write(buf);
            }
            Message::Output(list) => {
                buf.put_u8(OUTPUT_TAG);
                list.write(buf);
            }
            Message::Check(digest) => {
                buf.put_u8(CHECK_TAG);
                digest.write(buf);
            }
            Message::Share(signature) => {
                buf.put_u8(SHARE_TAG);
                signature.write(buf);
            }
            Message::Blame {
                accusations,
                decryption_key,
                transcript,
            } => {
                buf.put_u8(BLAME_TAG);
                accusations.write(buf);
                decryption_key.write(buf);
                transcript.write(buf);
            }
            Message::Relay(packets) => {
                buf.put_u8(RELAY_TAG);
                packets.write(buf);
            }
        }
    }
}

impl<P: PublicKey, E: EncryptionKey> EncodeSize for Message<P, E> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Announcement(announced) => announced.encode_size(),
            Message::Shuffle(list) | Message::Output(list) => list.encode_size(),
            Message::Check(digest) => digest.encode_size(),
            Message::Share(signature) => signature.encode_size(),
            Message::Blame {
                accusations,
                decryption_key,
                transcript,
            } => {
                accusations.encode_size() + decryption_key.encode_size() + transcript.encode_size()
            }
            Message::Relay(packets) => packets.encode_size(),
        }
    }
}

impl<P: PublicKey, E: EncryptionKey> Read for Message<P, E> {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let size = limits.max_message_size;
        let players = limits.max_players;
        let packets = limits.max_packets();
        match u8::read(buf)? {
            ANNOUNCEMENT_TAG => Ok(Message::Announcement(Announced::read_cfg(buf, &size)?)),
            SHUFFLE_TAG => Ok(Message::Shuffle(Vec::<Bytes>::read_cfg(
                buf,
                &((..=players).into(), (..=size).into()),
            )?)),
            OUTPUT_TAG => Ok(Message::Output(Vec::<Bytes>::read_cfg(
                buf,
                &((..=players).into(), (..=size).into()),
            )?)),
            CHECK_TAG => Ok(Message::Check(Digest::read(buf)?)),
            SHARE_TAG => Ok(Message::Share(P::Signature::read(buf)?)),
            BLAME_TAG => Ok(Message::Blame {
                accusations: Vec::<Accusation<P>>::read_cfg(buf, &((..=packets).into(), size))?,
                decryption_key: Option::<Bytes>::read_cfg(buf, &(..=size).into())?,
                transcript: Vec::<Signed<P>>::read_cfg(buf, &((..=packets).into(), size))?,
            }),
            RELAY_TAG => Ok(Message::Relay(Vec::<Signed<P>>::read_cfg(
                buf,
                &((..=packets).into(), size),
            )?)),
            tag => Err(CodecError::InvalidEnum(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blame::{Evidence, Fault},
        Packet,
    };
    use coinshuffle_cryptography::{x25519, DecryptionKey};
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey as Identity},
        sha256::hash,
        PrivateKeyExt, Signer,
    };
    use rand::{rngs::StdRng, SeedableRng};

    type Msg = Message<Identity, x25519::EncryptionKey>;

    const LIMITS: Limits = Limits {
        max_players: 4,
        max_message_size: 1024,
    };

    fn signed(signer: &PrivateKey, phase: Phase, payload: Bytes) -> Signed<Identity> {
        Signed::sign(
            signer,
            b"test_PACKET",
            Packet {
                session: SessionId::new(b"message"),
                attempt: 0,
                phase,
                sender: signer.public_key(),
                recipient: None,
                payload,
            },
        )
    }

    #[test]
    fn test_codec() {
        let mut rng = StdRng::seed_from_u64(0);
        let signer = PrivateKey::from_seed(0);
        let encryption_key = x25519::DecryptionKey::from_rng(&mut rng).encryption_key();
        let packet = signed(&signer, Phase::Announcement, Bytes::from_static(b"payload"));
        let messages: Vec<Msg> = vec![
            Message::Announcement(Announced {
                encryption_key,
                input: Bytes::from_static(b"coin"),
                change: Some(Bytes::from_static(b"change")),
            }),
            Message::Shuffle(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
            Message::Output(vec![]),
            Message::Check(hash(b"check")),
            Message::Share(signer.sign(Some(b"tx"), b"payload")),
            Message::Blame {
                accusations: vec![Accusation {
                    accused: signer.public_key(),
                    fault: Fault::NoResponse,
                    evidence: Evidence::Silence {
                        phase: Phase::Announcement,
                    },
                }],
                decryption_key: Some(Bytes::from_static(&[7; 32])),
                transcript: vec![packet.clone()],
            },
            Message::Relay(vec![packet]),
        ];
        for message in messages {
            let encoded = message.encode();
            assert_eq!(encoded.len(), message.encode_size());
            assert_eq!(Msg::decode_cfg(encoded, &LIMITS).unwrap(), message);
        }
    }

    #[test]
    fn test_phase_matches() {
        let relay: Msg = Message::Relay(vec![]);
        assert!(relay.phase_matches(Phase::Blame(1)));
        assert!(!relay.phase_matches(Phase::Blame(0)));

        let blame: Msg = Message::Blame {
            accusations: vec![],
            decryption_key: None,
            transcript: vec![],
        };
        assert!(blame.phase_matches(Phase::Blame(0)));
        assert!(!blame.phase_matches(Phase::Blame(1)));

        let check: Msg = Message::Check(hash(b"check"));
        assert!(check.phase_matches(Phase::EquivocationCheck));
        assert!(!check.phase_matches(Phase::Announcement));
    }

    #[test]
    fn test_from_packet_rejects_phase_mismatch() {
        let signer = PrivateKey::from_seed(0);
        let check: Msg = Message::Check(hash(b"check"));
        let packet = signed(&signer, Phase::Shuffling, check.encode().into());
        assert!(matches!(
            Msg::from_packet(&packet, LIMITS),
            Err(CodecError::Invalid("Message", "phase mismatch"))
        ));
        let packet = signed(&signer, Phase::EquivocationCheck, check.encode().into());
        assert_eq!(Msg::from_packet(&packet, LIMITS).unwrap(), check);
    }

    #[test]
    fn test_list_bound() {
        let list: Msg = Message::Shuffle(vec![Bytes::new(); 5]);
        assert!(matches!(
            Msg::decode_cfg(list.encode(), &LIMITS),
            Err(CodecError::InvalidLength(5))
        ));
    }
}
