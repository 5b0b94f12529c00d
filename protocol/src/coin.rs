//! Interface to the ledger whose coins are being shuffled.

use crate::blame::Fault;
use bytes::Bytes;
use commonware_cryptography::{PublicKey, Verifier};
use std::{error::Error as StdError, fmt::Debug, future::Future};
use thiserror::Error;

/// Reasons an announced input cannot fund the transaction.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("insufficient funds")]
    Insufficient,
    #[error("input already spent")]
    Spent,
    #[error("input not owned by announcer")]
    Unowned,
}

impl InputError {
    /// The fault an announcer is convicted of for announcing such an input.
    pub fn fault(&self) -> Fault {
        match self {
            InputError::Insufficient => Fault::InsufficientFunds,
            InputError::Spent | InputError::Unowned => Fault::DuplicateRegistration,
        }
    }
}

/// A participant's contribution to the joint transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Input<P: PublicKey> {
    /// Participant that owns `coin`.
    pub owner: P,
    /// Ledger-specific reference to the coin being spent.
    pub coin: Bytes,
    /// Address receiving whatever `coin` holds beyond the shuffled amount.
    pub change: Option<Bytes>,
}

/// A ledger on which a shuffle transaction can be built and submitted.
///
/// Every honest participant must build byte-identical transactions from the same inputs and
/// outputs, so [Coin::build] and [Coin::payload] must be deterministic.
pub trait Coin: Clone + Send + Sync + 'static {
    /// Identity that owns coins and signs transactions.
    type PublicKey: PublicKey;

    /// An unsigned transaction.
    type Transaction: Clone + Debug + Send + Sync + 'static;

    /// Error returned when a transaction is not accepted.
    type Error: Debug + StdError + Send + Sync;

    /// Check that `owner` can spend `coin` and that it holds at least `amount`.
    fn verify_input(
        &self,
        owner: &Self::PublicKey,
        coin: &Bytes,
        amount: u64,
    ) -> Result<(), InputError>;

    /// Build the transaction spending `inputs` (in rank order) into `outputs` (in shuffled
    /// order), moving `amount` from each input to each output.
    fn build(
        &self,
        inputs: &[Input<Self::PublicKey>],
        outputs: &[Bytes],
        amount: u64,
    ) -> Self::Transaction;

    /// Bytes every input owner signs to authorize `transaction`.
    fn payload(&self, transaction: &Self::Transaction) -> Bytes;

    /// Submit `transaction` together with one signature per input owner.
    ///
    /// Submitting a transaction that was already accepted succeeds, as every participant submits
    /// the same transaction.
    fn submit(
        &self,
        transaction: Self::Transaction,
        shares: Vec<(
            Self::PublicKey,
            <Self::PublicKey as Verifier>::Signature,
        )>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
