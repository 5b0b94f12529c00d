use crate::{Limits, SessionId};
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Largest number of corroboration rounds a session may run.
pub const MAX_CORROBORATION_ROUNDS: u8 = 4;

/// Smallest supported message size (in bytes).
const MIN_MESSAGE_SIZE: usize = 1024;

/// Configuration for a [crate::Machine].
///
/// Every participant of a session must use the same values (other than `timeout`, which only
/// affects how long this participant waits).
#[derive(Clone, Debug)]
pub struct Config {
    /// Registry that session metrics are added to.
    pub registry: Arc<Mutex<Registry>>,

    /// Prefix for all signed messages to prevent replay attacks.
    pub namespace: Vec<u8>,

    /// Identifier shared by every participant of this shuffle.
    pub session: SessionId,

    /// Value each participant moves from its input to its output.
    pub amount: u64,

    /// How long to wait for a single packet (or a single hop of the shuffle chain).
    pub timeout: Duration,

    /// Fewest participants a retry may continue with.
    pub min_players: usize,

    /// Most participants a session may have.
    pub max_players: usize,

    /// Number of attempts (including the first) before giving up.
    pub max_attempts: u32,

    /// Number of relay rounds that follow the first blame round.
    ///
    /// Silence in the last round can never be corroborated, so at least one round is needed to
    /// convict participants that stop responding during blame.
    pub max_corroboration_rounds: u8,

    /// Largest packet accepted from the network (in bytes).
    pub max_message_size: usize,
}

impl Config {
    /// Create a configuration with default limits and a fresh registry.
    pub fn new(namespace: &[u8], session: SessionId, amount: u64) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            namespace: namespace.to_vec(),
            session,
            amount,
            timeout: Duration::from_secs(10),
            min_players: 2,
            max_players: 64,
            max_attempts: 4,
            max_corroboration_rounds: 1,
            max_message_size: 1024 * 1024,
        }
    }

    /// Check that the configuration can run a session.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.amount == 0 {
            return Err("amount must be positive");
        }
        if self.timeout.is_zero() {
            return Err("timeout must be positive");
        }
        if self.min_players < 2 {
            return Err("min_players must be at least 2");
        }
        if self.max_players < self.min_players {
            return Err("max_players must be at least min_players");
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be positive");
        }
        if self.max_corroboration_rounds > MAX_CORROBORATION_ROUNDS {
            return Err("too many corroboration rounds");
        }
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err("max_message_size too small");
        }
        Ok(())
    }

    /// Bounds applied when decoding packets of this session.
    pub fn limits(&self) -> Limits {
        Limits {
            max_players: self.max_players,
            max_message_size: self.max_message_size,
        }
    }
}
