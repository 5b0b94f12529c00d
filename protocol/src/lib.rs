//! Jointly build a transaction that unlinks inputs from outputs without a trusted coordinator.
//!
//! # Overview
//!
//! Each participant of a session contributes one input coin and one fresh output address. The
//! participants pass a list of layered ciphertexts along a chain ordered by public key, each
//! peeling one layer, adding its own sealed output, and shuffling. The last participant learns
//! the full set of output addresses but not who contributed which, broadcasts it, and everyone
//! signs a transaction spending all inputs to all outputs.
//!
//! A session proceeds through the following phases:
//!
//! 1. **Announcement**: every participant broadcasts a fresh encryption key and its input.
//! 2. **Shuffling**: the layered list moves down the chain, one participant at a time.
//! 3. **Broadcast Output**: the last participant broadcasts the decrypted outputs.
//! 4. **Equivocation Check**: every participant broadcasts a digest of what it saw.
//! 5. **Verification and Submission**: every participant signs and submits the transaction.
//!
//! Any failure (a missing packet, an invalid input, a corrupted list, or a digest mismatch)
//! sends every participant into **Blame**. There, participants reveal their decryption keys and
//! everything they received during the attempt. Every honest participant judges the same
//! evidence with the same rules ([blame::judge]), so all of them exclude the same participants
//! and retry with fresh keys.
//!
//! # Architecture
//!
//! A [Machine] drives one participant through a session. It talks to its peers through a
//! [Round], which signs and routes [Packet]s over any [coinshuffle_p2p::Channel] and filters
//! everything that arrives: packets of another session, attempt, or phase, unsigned or
//! misaddressed packets, and packets from non-participants never reach the [Machine]. Two
//! distinct packets from the same sender for the same slot are kept as evidence of
//! equivocation.
//!
//! The chain the transaction is built for is abstracted by [coin::Coin].
//!
//! # Status
//!
//! `coinshuffle-protocol` is **ALPHA** software and is not yet recommended for production use.

use commonware_cryptography::PublicKey;
use commonware_utils::union;
use thiserror::Error;

pub mod blame;
pub mod coin;
mod config;
pub use config::{Config, MAX_CORROBORATION_ROUNDS};
mod machine;
pub use machine::{Contribution, Machine, Outcome};
pub mod message;
pub use message::{Announced, Limits, Message};
pub mod metrics;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
mod players;
pub use players::Players;
pub mod round;
pub use round::{Aborted, Aborter, Round};
mod types;
pub use types::{Packet, Phase, SessionId, Signed};

/// Suffix appended to the session namespace for packet signatures.
const PACKET_SUFFIX: &[u8] = b"_PACKET";

/// Suffix appended to the session namespace for transaction signatures.
const TRANSACTION_SUFFIX: &[u8] = b"_TRANSACTION";

/// Namespace packets of `session` are signed with.
///
/// Bound to the session, so a packet signed during one session never verifies in another.
pub fn packet_namespace(namespace: &[u8], session: &SessionId) -> Vec<u8> {
    union(&union(namespace, PACKET_SUFFIX), session.as_ref())
}

/// Namespace transaction shares of a session are signed with.
///
/// Distinct from [packet_namespace] so a share can never be replayed as a packet (or vice versa).
pub fn transaction_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, TRANSACTION_SUFFIX)
}

/// Errors that can occur when running a session.
#[derive(Error, Debug)]
pub enum Error<P: PublicKey> {
    #[error("timed out in {phase} waiting for {} players", .missing.len())]
    Timeout { phase: Phase, missing: Vec<P> },
    #[error("interrupted by blame from {by:?}")]
    Interrupted { by: P },
    #[error("canceled")]
    Canceled,
    #[error("self-addressed packet")]
    SelfAddressed,
    #[error("missing recipient")]
    MissingRecipient,
    #[error("unknown player: {0:?}")]
    UnknownPlayer(P),
    #[error("not participating")]
    NotParticipating,
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("already listening")]
    AlreadyListening,
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("local input rejected: {0}")]
    LocalInput(coin::InputError),
    #[error("crypto failed: {0}")]
    Crypto(#[from] coinshuffle_cryptography::Error),
    #[error("submission failed: {0}")]
    Submission(String),
}
