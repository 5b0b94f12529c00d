//! Deliver messages between in-process participants.
//!
//! Every participant obtains a [Channel] from a shared [Network]. The [Network] owns an explicit
//! registry of listeners (there is no process-wide state), so independent simulations can run
//! side by side in the same process.
//!
//! Links are directed and can be severed at any time to model a participant that goes silent
//! towards some (or all) of its peers. Messages sent over a severed link are silently dropped,
//! exactly as they would be by a peer that never sent them.
//!
//! # Example
//!
//! ```rust
//! use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};
//! use coinshuffle_p2p::{simulated::{Config, Network}, Channel, Listener, Session};
//! use bytes::Bytes;
//!
//! # futures::executor::block_on(async {
//! let network = Network::new(Config::default());
//! let alice = PrivateKey::from_seed(0).public_key();
//! let bob = PrivateKey::from_seed(1).public_key();
//!
//! let mut alice_channel = network.channel(alice.clone());
//! let mut bob_channel = network.channel(bob.clone());
//! let (listener, mut inbox) = Listener::new();
//! assert!(bob_channel.listen(listener));
//!
//! let mut session = alice_channel.connect(&bob).await.unwrap();
//! session.send(Bytes::from_static(b"hello")).await.unwrap();
//! let (origin, message) = inbox.recv().await.unwrap();
//! assert_eq!(origin, alice);
//! assert_eq!(message, Bytes::from_static(b"hello"));
//! # });
//! ```

mod network;
pub use network::{Channel, Config, Network, Session};

use thiserror::Error;

/// Errors that can occur when interacting with the simulated network.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("not valid to connect to self")]
    ConnectingSelf,
    #[error("peer not registered")]
    UnknownPeer,
    #[error("peer stopped listening")]
    PeerClosed,
    #[error("session closed")]
    SessionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Channel as _, Listener, Session as _};
    use bytes::Bytes;
    use commonware_cryptography::{
        ed25519::{PrivateKey, PublicKey},
        PrivateKeyExt, Signer,
    };

    fn key(seed: u64) -> PublicKey {
        PrivateKey::from_seed(seed).public_key()
    }

    fn register(network: &Network<PublicKey>, me: PublicKey) -> crate::Inbox<PublicKey> {
        let mut channel = network.channel(me);
        let (listener, inbox) = Listener::new();
        assert!(channel.listen(listener));
        inbox
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let _a_inbox = register(&network, a.clone());
        let mut b_inbox = register(&network, b.clone());

        let mut session = network.channel(a.clone()).connect(&b).await.unwrap();
        session.send(Bytes::from_static(b"one")).await.unwrap();
        session.send(Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(b_inbox.recv().await.unwrap(), (a.clone(), Bytes::from_static(b"one")));
        assert_eq!(b_inbox.recv().await.unwrap(), (a.clone(), Bytes::from_static(b"two")));
        assert_eq!(network.deliveries(&a, &b), 2);
        assert_eq!(network.deliveries(&b, &a), 0);
        assert_eq!(network.total_deliveries(), 2);
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let network = Network::new(Config::default());
        let a = key(0);
        let mut channel = network.channel(a.clone());
        let (first, _first_inbox) = Listener::new();
        let (second, _second_inbox) = Listener::new();
        assert!(channel.listen(first));
        assert!(!channel.listen(second));
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let _a_inbox = register(&network, a.clone());

        let mut channel = network.channel(a.clone());
        assert_eq!(channel.connect(&a).await.unwrap_err(), Error::ConnectingSelf);
        assert_eq!(channel.connect(&b).await.unwrap_err(), Error::UnknownPeer);
    }

    #[tokio::test]
    async fn test_sever_and_restore() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let _a_inbox = register(&network, a.clone());
        let mut b_inbox = register(&network, b.clone());
        let mut session = network.channel(a.clone()).connect(&b).await.unwrap();

        // Severed links drop silently
        network.sever(a.clone(), b.clone());
        session.send(Bytes::from_static(b"lost")).await.unwrap();
        assert_eq!(network.deliveries(&a, &b), 0);

        network.restore(a.clone(), b.clone());
        session.send(Bytes::from_static(b"found")).await.unwrap();
        assert_eq!(b_inbox.recv().await.unwrap(), (a.clone(), Bytes::from_static(b"found")));
        assert_eq!(network.deliveries(&a, &b), 1);
    }

    #[tokio::test]
    async fn test_isolate() {
        let network = Network::new(Config::default());
        let (a, b, c) = (key(0), key(1), key(2));
        let _a_inbox = register(&network, a.clone());
        let _b_inbox = register(&network, b.clone());
        let _c_inbox = register(&network, c.clone());

        network.isolate(a.clone());
        let mut channel = network.channel(a.clone());
        for peer in [b.clone(), c.clone()] {
            let mut session = channel.connect(&peer).await.unwrap();
            session.send(Bytes::from_static(b"silent")).await.unwrap();
        }
        assert_eq!(network.total_deliveries(), 0);

        // Inbound links are untouched
        let mut session = network.channel(b.clone()).connect(&a).await.unwrap();
        session.send(Bytes::from_static(b"heard")).await.unwrap();
        assert_eq!(network.deliveries(&b, &a), 1);
    }

    #[tokio::test]
    async fn test_closed_session() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let _b_inbox = register(&network, b.clone());
        let mut session = network.channel(a.clone()).connect(&b).await.unwrap();
        assert!(!session.closed());
        session.close();
        assert!(session.closed());
        assert_eq!(
            session.send(Bytes::from_static(b"late")).await.unwrap_err(),
            Error::SessionClosed
        );
        assert_eq!(network.total_deliveries(), 0);
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let network = Network::new(Config {
            max_message_size: 4,
        });
        let (a, b) = (key(0), key(1));
        let _b_inbox = register(&network, b.clone());
        let mut session = network.channel(a.clone()).connect(&b).await.unwrap();
        assert_eq!(
            session.send(Bytes::from_static(b"12345")).await.unwrap_err(),
            Error::MessageTooLarge(5)
        );
    }

    #[tokio::test]
    async fn test_dropped_inbox() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let b_inbox = register(&network, b.clone());
        let mut session = network.channel(a.clone()).connect(&b).await.unwrap();
        drop(b_inbox);
        assert_eq!(
            session.send(Bytes::from_static(b"gone")).await.unwrap_err(),
            Error::PeerClosed
        );
    }

    #[tokio::test]
    async fn test_deregister() {
        let network = Network::new(Config::default());
        let (a, b) = (key(0), key(1));
        let _b_inbox = register(&network, b.clone());
        network.deregister(&b);
        let mut channel = network.channel(a.clone());
        assert_eq!(channel.connect(&b).await.unwrap_err(), Error::UnknownPeer);

        // Listening again after deregistration succeeds
        let _b_inbox = register(&network, b.clone());
        assert!(channel.connect(&b).await.is_ok());
    }
}
