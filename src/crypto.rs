//! Firmware signature verification and the AES output whitener.
//!
//! Firmware images carry a detached OpenPGP signature made by the vendor
//! key. [`PgpKeyring`] checks it against an armored public key block that
//! the caller supplies. [`Whitener`] encrypts the random stream with
//! AES-128 in CFB mode under a key read from the device itself, which
//! decorrelates the output for consumers that are picky about it. It is not
//! meant to provide confidentiality.

use std::io::{self, Cursor, Write};

use aes::Aes128;
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::BufEncryptor;
use pgp::types::KeyTrait;
use pgp::{Deserializable, SignedPublicKey, StandaloneSignature};
use rand::Rng;

use crate::protocol::WHITENER_KEY_LEN;
use crate::types::SignerIdentity;
use crate::{OneRngError, Result};

/// Checks a detached signature over a byte string.
pub trait SignatureVerifier {
    /// Return the signer when `signature` is a valid signature of `signed`,
    /// otherwise [`OneRngError::VerificationFailed`].
    fn verify(&self, signed: &[u8], signature: &[u8]) -> Result<SignerIdentity>;
}

/// A set of trusted OpenPGP public keys.
pub struct PgpKeyring {
    keys: Vec<SignedPublicKey>,
}

impl PgpKeyring {
    /// Load every key in an ASCII-armored public key block.
    pub fn from_armored(armored: &str) -> Result<Self> {
        let keyring_err = |e: pgp::errors::Error| OneRngError::Keyring(e.to_string());
        let (keys, _headers) =
            SignedPublicKey::from_armor_many(Cursor::new(armored.as_bytes())).map_err(keyring_err)?;
        let keys = keys
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(keyring_err)?;
        if keys.is_empty() {
            return Err(OneRngError::Keyring("no public keys in block".into()));
        }
        for key in &keys {
            key.verify().map_err(keyring_err)?;
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SignatureVerifier for PgpKeyring {
    fn verify(&self, signed: &[u8], signature: &[u8]) -> Result<SignerIdentity> {
        let sig = StandaloneSignature::from_bytes(signature).map_err(|e| {
            OneRngError::VerificationFailed(format!("unreadable signature: {e}"))
        })?;

        for key in &self.keys {
            let by_primary = sig.verify(key, signed).is_ok();
            if by_primary || key.public_subkeys.iter().any(|sub| sig.verify(sub, signed).is_ok()) {
                return Ok(identity(key));
            }
        }
        Err(OneRngError::VerificationFailed(
            "signature was not made by a trusted key".into(),
        ))
    }
}

fn identity(key: &SignedPublicKey) -> SignerIdentity {
    let user = key.details.users.first();
    SignerIdentity {
        name: user.map(|u| u.id.id().to_string()).unwrap_or_default(),
        created: user
            .and_then(|u| u.signatures.first())
            .and_then(|s| s.created())
            .copied(),
        fingerprint: hex::encode_upper(key.fingerprint()),
    }
}

/// A writer that AES-128-CFB encrypts everything written through it.
///
/// The keystream advances before the ciphertext reaches `inner`, so after a
/// failed inner write the stream can no longer be decrypted in sequence.
/// The whitener is poisoned at that point and rejects further writes.
pub struct Whitener<W> {
    cipher: BufEncryptor<Aes128>,
    iv: [u8; 16],
    inner: W,
    scratch: Vec<u8>,
    poisoned: bool,
}

impl<W: Write> Whitener<W> {
    /// Wrap `inner`, using a fresh IV. The IV need not be unpredictable.
    pub fn new(key: &[u8], inner: W) -> Result<Self> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill(&mut iv);
        Self::with_iv(key, iv, inner)
    }

    pub fn with_iv(key: &[u8], iv: [u8; 16], inner: W) -> Result<Self> {
        let cipher = BufEncryptor::<Aes128>::new_from_slices(key, &iv).map_err(|_| {
            OneRngError::Protocol(format!(
                "whitener key must be {WHITENER_KEY_LEN} bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self {
            cipher,
            iv,
            inner,
            scratch: Vec::new(),
            poisoned: false,
        })
    }

    pub fn iv(&self) -> &[u8; 16] {
        &self.iv
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for Whitener<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "whitener output failed, keystream out of sync",
            ));
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        self.cipher.encrypt(&mut self.scratch);
        if let Err(e) = self.inner.write_all(&self.scratch) {
            self.poisoned = true;
            return Err(e);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
