//! Implementation of a `simulated` network.

use super::Error;
use crate::Listener;
use bytes::Bytes;
use commonware_cryptography::PublicKey;
use futures::future::ready;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{Arc, Mutex},
};
use tracing::debug;

/// Default maximum size of a single message (in bytes).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for a `simulated` network.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum size of a single message (in bytes).
    pub max_message_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Shared state of a simulated network.
#[derive(Debug)]
struct Registry<P: PublicKey> {
    max_message_size: usize,
    listeners: BTreeMap<P, Listener<P>>,
    severed: BTreeSet<(P, P)>,
    isolated: BTreeSet<P>,
    deliveries: BTreeMap<(P, P), usize>,
}

impl<P: PublicKey> Registry<P> {
    fn deliver(&mut self, origin: &P, recipient: &P, message: Bytes) -> Result<(), Error> {
        if message.len() > self.max_message_size {
            return Err(Error::MessageTooLarge(message.len()));
        }
        if self.isolated.contains(origin)
            || self
                .severed
                .contains(&(origin.clone(), recipient.clone()))
        {
            debug!(?origin, ?recipient, reason = "severed", "dropping message");
            return Ok(());
        }
        let Some(listener) = self.listeners.get(recipient) else {
            return Err(Error::UnknownPeer);
        };
        if !listener.deliver(origin.clone(), message) {
            return Err(Error::PeerClosed);
        }
        *self
            .deliveries
            .entry((origin.clone(), recipient.clone()))
            .or_default() += 1;
        Ok(())
    }
}

/// Implementation of a `simulated` network.
///
/// Cloning a [Network] yields another handle to the same registry.
#[derive(Clone, Debug)]
pub struct Network<P: PublicKey> {
    registry: Arc<Mutex<Registry<P>>>,
}

impl<P: PublicKey> Network<P> {
    /// Create a new simulated network.
    pub fn new(cfg: Config) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                max_message_size: cfg.max_message_size,
                listeners: BTreeMap::new(),
                severed: BTreeSet::new(),
                isolated: BTreeSet::new(),
                deliveries: BTreeMap::new(),
            })),
        }
    }

    /// Returns the [Channel] used by `me` to reach the other participants.
    pub fn channel(&self, me: P) -> Channel<P> {
        Channel {
            me,
            registry: self.registry.clone(),
        }
    }

    /// Drop every message sent from `origin` to `recipient` until [Network::restore] is called.
    pub fn sever(&self, origin: P, recipient: P) {
        self.registry
            .lock()
            .unwrap()
            .severed
            .insert((origin, recipient));
    }

    /// Undo a previous [Network::sever].
    pub fn restore(&self, origin: P, recipient: P) {
        self.registry
            .lock()
            .unwrap()
            .severed
            .remove(&(origin, recipient));
    }

    /// Drop every message sent by `origin`.
    pub fn isolate(&self, origin: P) {
        self.registry.lock().unwrap().isolated.insert(origin);
    }

    /// Remove the listener registered by `peer`, if any.
    pub fn deregister(&self, peer: &P) {
        self.registry.lock().unwrap().listeners.remove(peer);
    }

    /// Number of messages delivered from `origin` to `recipient`.
    pub fn deliveries(&self, origin: &P, recipient: &P) -> usize {
        self.registry
            .lock()
            .unwrap()
            .deliveries
            .get(&(origin.clone(), recipient.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Number of messages delivered between any pair of participants.
    pub fn total_deliveries(&self) -> usize {
        self.registry.lock().unwrap().deliveries.values().sum()
    }
}

/// A participant's view of a simulated [Network].
#[derive(Clone, Debug)]
pub struct Channel<P: PublicKey> {
    me: P,
    registry: Arc<Mutex<Registry<P>>>,
}

impl<P: PublicKey> crate::Channel for Channel<P> {
    type PublicKey = P;
    type Session = Session<P>;
    type Error = Error;

    fn listen(&mut self, listener: Listener<P>) -> bool {
        let mut registry = self.registry.lock().unwrap();
        if let Some(existing) = registry.listeners.get(&self.me) {
            if !existing.is_closed() {
                return false;
            }
        }
        registry.listeners.insert(self.me.clone(), listener);
        true
    }

    fn connect(&mut self, peer: &P) -> impl Future<Output = Result<Session<P>, Error>> + Send {
        if peer == &self.me {
            return ready(Err(Error::ConnectingSelf));
        }
        if !self.registry.lock().unwrap().listeners.contains_key(peer) {
            return ready(Err(Error::UnknownPeer));
        }
        ready(Ok(Session {
            me: self.me.clone(),
            peer: peer.clone(),
            registry: self.registry.clone(),
            closed: false,
        }))
    }
}

/// A directed connection between two participants of a simulated [Network].
#[derive(Debug)]
pub struct Session<P: PublicKey> {
    me: P,
    peer: P,
    registry: Arc<Mutex<Registry<P>>>,
    closed: bool,
}

impl<P: PublicKey> crate::Session for Session<P> {
    type Error = Error;

    fn send(&mut self, message: Bytes) -> impl Future<Output = Result<(), Error>> + Send {
        if self.closed {
            return ready(Err(Error::SessionClosed));
        }
        let result = self
            .registry
            .lock()
            .unwrap()
            .deliver(&self.me, &self.peer, message);
        ready(result)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn closed(&self) -> bool {
        self.closed
    }
}
