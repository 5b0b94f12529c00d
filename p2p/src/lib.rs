//! Deliver shuffle packets between participants over interchangeable transports.
//!
//! A transport is anything that implements [Channel]: it registers a local [Listener] to receive
//! inbound messages and opens a [Session] to each peer it needs to reach. The protocol never
//! inspects how bytes move, so in-process, TCP, or browser-socket backends are selected at
//! construction time and used through the same contract.
//!
//! Delivery into a [Listener] never blocks: messages queue in an unbounded buffer until the
//! owner of the paired [Inbox] consumes them.
//!
//! # Status
//!
//! `coinshuffle-p2p` is **ALPHA** software and is not yet recommended for production use.

use bytes::Bytes;
use commonware_cryptography::PublicKey;
use futures::{channel::mpsc, StreamExt};
use std::{error::Error as StdError, fmt::Debug, future::Future};

pub mod simulated;

/// Tuple representing a message received from a given public key.
///
/// The public key is the transport-level origin of the message, which the receiver must still
/// match against whatever identity the message itself claims.
pub type Message<P> = (P, Bytes);

/// Handle a transport uses to hand inbound messages to a local participant.
#[derive(Clone, Debug)]
pub struct Listener<P: PublicKey> {
    sender: mpsc::UnboundedSender<Message<P>>,
}

impl<P: PublicKey> Listener<P> {
    /// Create a new [Listener] and the [Inbox] that drains it.
    pub fn new() -> (Self, Inbox<P>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, Inbox { receiver })
    }

    /// Deliver a message from `origin`.
    ///
    /// Returns `false` if the paired [Inbox] has been dropped.
    pub fn deliver(&self, origin: P, message: Bytes) -> bool {
        self.sender.unbounded_send((origin, message)).is_ok()
    }

    /// Returns whether the paired [Inbox] has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Receiving half of a [Listener].
#[derive(Debug)]
pub struct Inbox<P: PublicKey> {
    receiver: mpsc::UnboundedReceiver<Message<P>>,
}

impl<P: PublicKey> Inbox<P> {
    /// Wait for the next inbound message.
    ///
    /// Returns `None` once every [Listener] clone has been dropped and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Message<P>> {
        self.receiver.next().await
    }
}

/// An open, directed connection to a single peer.
pub trait Session: Send + 'static {
    /// Error that can occur when sending a message.
    type Error: Debug + StdError + Send + Sync;

    /// Send a message to the peer.
    ///
    /// Success means the transport accepted the message, not that the peer processed it.
    fn send(&mut self, message: Bytes) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Close the session. Subsequent sends fail.
    fn close(&mut self);

    /// Returns whether the session has been closed.
    fn closed(&self) -> bool;
}

/// A transport capable of reaching other participants.
pub trait Channel: Clone + Send + 'static {
    /// Public key type used to identify peers.
    type PublicKey: PublicKey;

    /// Session type opened by [Channel::connect].
    type Session: Session;

    /// Error that can occur when connecting to a peer.
    type Error: Debug + StdError + Send + Sync;

    /// Register the [Listener] that receives all messages addressed to the local participant.
    ///
    /// Returns `false` if a listener is already registered.
    fn listen(&mut self, listener: Listener<Self::PublicKey>) -> bool;

    /// Open a [Session] to `peer`.
    fn connect(
        &mut self,
        peer: &Self::PublicKey,
    ) -> impl Future<Output = Result<Self::Session, Self::Error>> + Send;
}
