//! In-memory ledger for exercising shuffles without a real chain.

use crate::coin::{Coin, Input, InputError};
use bytes::{BufMut, Bytes, BytesMut};
use commonware_codec::Write;
use commonware_cryptography::{PublicKey, Verifier};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Errors returned by [Ledger::submit].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown coin")]
    UnknownCoin,
    #[error("coin already spent")]
    AlreadySpent,
    #[error("missing signature share")]
    MissingShare,
}

/// A transaction built by [Ledger].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction<P: PublicKey> {
    pub inputs: Vec<Input<P>>,
    pub outputs: Vec<Bytes>,
    pub amount: u64,
}

#[derive(Debug)]
struct Entry<P> {
    owner: P,
    value: u64,
    spent: bool,
}

#[derive(Debug)]
struct State<P: PublicKey> {
    next: u64,
    coins: BTreeMap<Bytes, Entry<P>>,
    submitted: Vec<Transaction<P>>,
}

/// Shared in-memory ledger.
///
/// Clones share state, so every participant of a test can hold its own handle.
#[derive(Clone, Debug)]
pub struct Ledger<P: PublicKey> {
    state: Arc<Mutex<State<P>>>,
}

impl<P: PublicKey> Default for Ledger<P> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next: 0,
                coins: BTreeMap::new(),
                submitted: Vec::new(),
            })),
        }
    }
}

impl<P: PublicKey> Ledger<P> {
    /// Create a coin worth `value` owned by `owner` and return its reference.
    pub fn fund(&self, owner: &P, value: u64) -> Bytes {
        let mut state = self.state.lock().unwrap();
        let coin = Bytes::copy_from_slice(&state.next.to_be_bytes());
        state.next += 1;
        state.coins.insert(
            coin.clone(),
            Entry {
                owner: owner.clone(),
                value,
                spent: false,
            },
        );
        coin
    }

    /// Mark `coin` as spent.
    pub fn spend(&self, coin: &Bytes) {
        if let Some(coin) = self.state.lock().unwrap().coins.get_mut(coin) {
            coin.spent = true;
        }
    }

    /// Transactions accepted so far.
    pub fn submitted(&self) -> Vec<Transaction<P>> {
        self.state.lock().unwrap().submitted.clone()
    }
}

impl<P: PublicKey> Coin for Ledger<P> {
    type PublicKey = P;
    type Transaction = Transaction<P>;
    type Error = Error;

    fn verify_input(&self, owner: &P, coin: &Bytes, amount: u64) -> Result<(), InputError> {
        let state = self.state.lock().unwrap();
        let Some(coin) = state.coins.get(coin) else {
            return Err(InputError::Unowned);
        };
        if &coin.owner != owner {
            return Err(InputError::Unowned);
        }
        if coin.spent {
            return Err(InputError::Spent);
        }
        if coin.value < amount {
            return Err(InputError::Insufficient);
        }
        Ok(())
    }

    fn build(&self, inputs: &[Input<P>], outputs: &[Bytes], amount: u64) -> Transaction<P> {
        Transaction {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            amount,
        }
    }

    fn payload(&self, transaction: &Transaction<P>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(transaction.amount);
        buf.put_u32(transaction.inputs.len() as u32);
        for input in &transaction.inputs {
            input.owner.write(&mut buf);
            input.coin.write(&mut buf);
            input.change.write(&mut buf);
        }
        transaction.outputs.write(&mut buf);
        buf.freeze()
    }

    fn submit(
        &self,
        transaction: Transaction<P>,
        shares: Vec<(P, P::Signature)>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        let result = self.accept(transaction, shares);
        async move { result }
    }
}

impl<P: PublicKey> Ledger<P> {
    fn accept(
        &self,
        transaction: Transaction<P>,
        shares: Vec<(P, <P as Verifier>::Signature)>,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.submitted.contains(&transaction) {
            return Ok(());
        }
        for input in &transaction.inputs {
            if !shares.iter().any(|(signer, _)| signer == &input.owner) {
                return Err(Error::MissingShare);
            }
            match state.coins.get(&input.coin) {
                None => return Err(Error::UnknownCoin),
                Some(coin) if coin.spent => return Err(Error::AlreadySpent),
                Some(_) => {}
            }
        }
        for input in &transaction.inputs {
            if let Some(coin) = state.coins.get_mut(&input.coin) {
                coin.spent = true;
            }
        }
        state.submitted.push(transaction);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt, Signer};

    #[test]
    fn test_verify_input() {
        let ledger = Ledger::default();
        let owner = PrivateKey::from_seed(0).public_key();
        let other = PrivateKey::from_seed(1).public_key();
        let coin = ledger.fund(&owner, 10);
        assert_eq!(ledger.verify_input(&owner, &coin, 10), Ok(()));
        assert_eq!(
            ledger.verify_input(&owner, &coin, 11),
            Err(InputError::Insufficient)
        );
        assert_eq!(
            ledger.verify_input(&other, &coin, 1),
            Err(InputError::Unowned)
        );
        ledger.spend(&coin);
        assert_eq!(ledger.verify_input(&owner, &coin, 1), Err(InputError::Spent));
    }

    #[tokio::test]
    async fn test_submit() {
        let ledger = Ledger::default();
        let signer = PrivateKey::from_seed(0);
        let owner = signer.public_key();
        let coin = ledger.fund(&owner, 10);
        let transaction = ledger.build(
            &[Input {
                owner: owner.clone(),
                coin: coin.clone(),
                change: None,
            }],
            &[Bytes::from_static(b"out")],
            10,
        );
        let share = signer.sign(None, &ledger.payload(&transaction));

        assert_eq!(
            ledger.submit(transaction.clone(), vec![]).await,
            Err(Error::MissingShare)
        );
        ledger
            .submit(transaction.clone(), vec![(owner.clone(), share.clone())])
            .await
            .unwrap();

        // Resubmitting the same transaction is harmless
        ledger
            .submit(transaction.clone(), vec![(owner.clone(), share)])
            .await
            .unwrap();
        assert_eq!(ledger.submitted(), vec![transaction]);
        assert_eq!(ledger.verify_input(&owner, &coin, 1), Err(InputError::Spent));
    }
}
