//! Sealed boxes over X25519.
//!
//! Each ciphertext carries a fresh ephemeral public key followed by a ChaCha20-Poly1305 sealed
//! payload. The symmetric key is derived with HKDF-SHA256 from the Diffie-Hellman output, salted
//! with a fixed prefix and both public keys. A fresh key is derived for every ciphertext, so a
//! zero nonce is never reused under the same key.

use crate::Error;
use bytes::{Buf, BufMut};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{Hasher as _, Sha256};
use commonware_utils::hex;
use hkdf::Hkdf;
use rand::{CryptoRng, Rng};
use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
    ops::Deref,
};
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::Zeroize;

const KEY_LENGTH: usize = 32;
const CHACHA_KEY_SIZE: usize = 32;
const TAG_LENGTH: usize = 16;

/// Prefix hashed into every salt so derived keys never collide with another application's.
const BASE_KDF_PREFIX: &[u8] = b"coinshuffle/KDF/v1/";
const SEAL_INFO: &[u8] = b"seal";

/// Secret half of an ephemeral X25519 key pair.
#[derive(Clone)]
pub struct DecryptionKey {
    raw: [u8; KEY_LENGTH],
    secret: StaticSecret,
}

impl crate::DecryptionKey for DecryptionKey {
    type EncryptionKey = EncryptionKey;

    fn from_rng<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        Self {
            raw: secret.to_bytes(),
            secret,
        }
    }

    fn encryption_key(&self) -> EncryptionKey {
        EncryptionKey::from(x25519_dalek::PublicKey::from(&self.secret))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        if ciphertext.len() < KEY_LENGTH + TAG_LENGTH {
            return Err(Error::CiphertextTooShort(ciphertext.len()));
        }
        let (ephemeral, sealed) = ciphertext.split_at(KEY_LENGTH);
        let ephemeral = EncryptionKey::try_from(ephemeral)?;
        let recipient = crate::DecryptionKey::encryption_key(self);
        let shared = self.secret.diffie_hellman(&ephemeral.key);
        if !shared.was_contributory() {
            return Err(Error::KeyDerivation);
        }
        let cipher = derive(shared.as_bytes(), &ephemeral, &recipient)?;
        cipher
            .decrypt(&Nonce::default(), sealed)
            .map_err(|_| Error::DecryptionFailed)
    }
}

impl Drop for DecryptionKey {
    fn drop(&mut self) {
        self.raw.zeroize();
    }
}

impl AsRef<[u8]> for DecryptionKey {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl TryFrom<&[u8]> for DecryptionKey {
    type Error = Error;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; KEY_LENGTH] = value
            .try_into()
            .map_err(|_| Error::InvalidPrivateKeyLength)?;
        Ok(Self {
            raw,
            secret: StaticSecret::from(raw),
        })
    }
}

impl Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DecryptionKey({})",
            crate::DecryptionKey::encryption_key(self)
        )
    }
}

/// Public half of an ephemeral X25519 key pair.
#[derive(Clone, Copy)]
pub struct EncryptionKey {
    raw: [u8; KEY_LENGTH],
    key: x25519_dalek::PublicKey,
}

impl crate::EncryptionKey for EncryptionKey {
    fn encrypt<R: Rng + CryptoRng>(&self, rng: &mut R, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let secret = EphemeralSecret::random_from_rng(rng);
        let ephemeral = EncryptionKey::from(x25519_dalek::PublicKey::from(&secret));
        let shared = secret.diffie_hellman(&self.key);
        if !shared.was_contributory() {
            return Err(Error::KeyDerivation);
        }
        let cipher = derive(shared.as_bytes(), &ephemeral, self)?;
        let sealed = cipher
            .encrypt(&Nonce::default(), plaintext)
            .map_err(|_| Error::EncryptionFailed)?;

        let mut ciphertext = Vec::with_capacity(KEY_LENGTH + sealed.len());
        ciphertext.extend_from_slice(&ephemeral.raw);
        ciphertext.extend_from_slice(&sealed);
        Ok(ciphertext)
    }
}

impl Write for EncryptionKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.raw.write(buf);
    }
}

impl Read for EncryptionKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let raw = <[u8; KEY_LENGTH]>::read(buf)?;
        Ok(Self::from(x25519_dalek::PublicKey::from(raw)))
    }
}

impl FixedSize for EncryptionKey {
    const SIZE: usize = KEY_LENGTH;
}

impl From<x25519_dalek::PublicKey> for EncryptionKey {
    fn from(key: x25519_dalek::PublicKey) -> Self {
        Self {
            raw: key.to_bytes(),
            key,
        }
    }
}

impl TryFrom<&[u8]> for EncryptionKey {
    type Error = Error;
    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let raw: [u8; KEY_LENGTH] = value
            .try_into()
            .map_err(|_| Error::InvalidPublicKeyLength)?;
        Ok(Self::from(x25519_dalek::PublicKey::from(raw)))
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for EncryptionKey {}

impl Hash for EncryptionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl Ord for EncryptionKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl PartialOrd for EncryptionKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl AsRef<[u8]> for EncryptionKey {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl Deref for EncryptionKey {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.raw
    }
}

impl Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw))
    }
}

impl Display for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw))
    }
}

/// Derive the cipher for a single sealed box.
fn derive(
    ikm: &[u8],
    ephemeral: &EncryptionKey,
    recipient: &EncryptionKey,
) -> Result<ChaCha20Poly1305, Error> {
    let mut hasher = Sha256::new();
    hasher.update(BASE_KDF_PREFIX);
    hasher.update(ephemeral);
    hasher.update(recipient);
    let salt = hasher.finalize();
    let hk = Hkdf::<sha2::Sha256>::new(Some(salt.as_ref()), ikm);
    let mut okm = [0u8; CHACHA_KEY_SIZE];
    hk.expand(SEAL_INFO, &mut okm)
        .map_err(|_| Error::KeyDerivation)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&okm).map_err(|_| Error::KeyDerivation);
    okm.zeroize();
    cipher
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DecryptionKey as _, EncryptionKey as _};
    use commonware_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_seal_open() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng);
        let ciphertext = key
            .encryption_key()
            .encrypt(&mut rng, b"output address")
            .unwrap();
        assert_eq!(ciphertext.len(), KEY_LENGTH + b"output address".len() + TAG_LENGTH);
        assert_eq!(key.decrypt(&ciphertext).unwrap(), b"output address");
    }

    #[test]
    fn test_ciphertexts_are_randomized() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng).encryption_key();
        let a = key.encrypt(&mut rng, b"same").unwrap();
        let b = key.encrypt(&mut rng, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng);
        let other = DecryptionKey::from_rng(&mut rng);
        let ciphertext = key.encryption_key().encrypt(&mut rng, b"secret").unwrap();
        assert_eq!(other.decrypt(&ciphertext), Err(Error::DecryptionFailed));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng);
        let mut ciphertext = key.encryption_key().encrypt(&mut rng, b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert_eq!(key.decrypt(&ciphertext), Err(Error::DecryptionFailed));
    }

    #[test]
    fn test_short_ciphertext() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng);
        assert_eq!(key.decrypt(&[0u8; 10]), Err(Error::CiphertextTooShort(10)));
    }

    #[test]
    fn test_layered_encryption() {
        let mut rng = StdRng::seed_from_u64(0);
        let inner = DecryptionKey::from_rng(&mut rng);
        let outer = DecryptionKey::from_rng(&mut rng);
        let sealed = inner.encryption_key().encrypt(&mut rng, b"addr").unwrap();
        let sealed = outer.encryption_key().encrypt(&mut rng, &sealed).unwrap();
        let peeled = outer.decrypt(&sealed).unwrap();
        assert_eq!(inner.decrypt(&peeled).unwrap(), b"addr");
    }

    #[test]
    fn test_encryption_key_codec() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng).encryption_key();
        let encoded = key.encode();
        assert_eq!(encoded.len(), EncryptionKey::SIZE);
        assert_eq!(EncryptionKey::decode(encoded).unwrap(), key);
        assert!(matches!(
            EncryptionKey::decode(&[0u8; 31][..]),
            Err(CodecError::EndOfBuffer)
        ));
    }

    #[test]
    fn test_revealed_key_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let key = DecryptionKey::from_rng(&mut rng);
        let revealed = DecryptionKey::try_from(key.as_ref()).unwrap();
        assert_eq!(revealed.encryption_key(), key.encryption_key());
        assert!(matches!(
            DecryptionKey::try_from(&[0u8; 31][..]),
            Err(Error::InvalidPrivateKeyLength)
        ));
    }
}
