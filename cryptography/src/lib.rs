//! Seal output addresses during a coin shuffle.
//!
//! Participants are identified and authenticated with `commonware-cryptography` signing keys.
//! This crate adds the piece the shuffle needs on top of them: an [EncryptionKey]/[DecryptionKey]
//! pair that carries the layered encryption of output addresses.
//!
//! The [x25519] backend implements sealed boxes (ephemeral X25519 + HKDF-SHA256 +
//! ChaCha20-Poly1305).
//!
//! # Status
//!
//! `coinshuffle-cryptography` is **ALPHA** software and is not yet recommended for production use.

use commonware_codec::{Encode, FixedSize, ReadExt};
use rand::{CryptoRng, Rng};
use std::{
    fmt::{Debug, Display},
    hash::Hash,
};
use thiserror::Error;

pub mod x25519;

/// Errors that can occur when decoding keys or opening ciphertexts.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid private key length")]
    InvalidPrivateKeyLength,
    #[error("invalid public key length")]
    InvalidPublicKeyLength,
    #[error("ciphertext too short: {0}")]
    CiphertextTooShort(usize),
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// A public key that seals messages to the holder of the matching [DecryptionKey].
///
/// Encryption keys are announced on the wire, so they encode to a fixed number of bytes and
/// compare by that encoding.
pub trait EncryptionKey:
    Clone
    + Send
    + Sync
    + 'static
    + Eq
    + Ord
    + Hash
    + Debug
    + Display
    + AsRef<[u8]>
    + Encode
    + ReadExt
    + FixedSize
{
    /// Seal `plaintext` so that only the holder of the matching [DecryptionKey] can open it.
    fn encrypt<R: Rng + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// The secret half of an ephemeral encryption key pair.
///
/// Decryption keys are created fresh for every shuffle attempt. They are only ever disclosed
/// when an attempt is abandoned, so that other participants can replay the shuffle.
pub trait DecryptionKey:
    Clone + Send + Sync + 'static + AsRef<[u8]> + for<'a> TryFrom<&'a [u8], Error = Error>
{
    /// The [EncryptionKey] matching this key.
    type EncryptionKey: EncryptionKey;

    /// Generate a fresh key.
    fn from_rng<R: Rng + CryptoRng>(rng: &mut R) -> Self;

    /// Returns the [EncryptionKey] matching this key.
    fn encryption_key(&self) -> Self::EncryptionKey;

    /// Open a ciphertext produced by [EncryptionKey::encrypt].
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}
