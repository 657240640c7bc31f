//! Symmetric sealing of signaling payloads.
//!
//! Every RTC primitive crosses the relay as an opaque blob: ChaCha20-Poly1305
//! under a message key derived once from the shared connection key, with a
//! fresh random nonce per message. The sealed form is `nonce || ciphertext`
//! and travels hex-encoded on the wire, so the relay never sees SDP or
//! candidate contents.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

use crate::error::SealError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const MESSAGE_KEY_INFO: &[u8] = b"causeway signaling message key v1";

/// Shared 32-byte connection key, established out of band.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, SealError> {
        let raw = hex::decode(hex_key).map_err(|err| SealError::Hex(err.to_string()))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|_| SealError::Hex("key must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Derives the per-purpose message key. The connection key itself is
    /// never used directly as an AEAD key.
    fn message_key(&self) -> Result<[u8; KEY_LEN], SealError> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(MESSAGE_KEY_INFO, &mut okm)
            .map_err(|_| SealError::KeyDerivation)?;
        Ok(okm)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, SealError> {
        let key_bytes = self.message_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher.encrypt(nonce, plaintext).map_err(|_| SealError::Aead)?;
        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(EncryptedPayload(combined))
    }

    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, SealError> {
        if payload.0.len() < NONCE_LEN {
            return Err(SealError::Truncated);
        }
        let (nonce_bytes, ciphertext) = payload.0.split_at(NONCE_LEN);
        let key_bytes = self.message_key()?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SealError::Aead)
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Sealed `nonce || ciphertext` blob. Hex string in JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload(Vec<u8>);

impl EncryptedPayload {
    pub fn from_hex(hex_payload: &str) -> Result<Self, SealError> {
        hex::decode(hex_payload)
            .map(Self)
            .map_err(|err| SealError::Hex(err.to_string()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for EncryptedPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EncryptedPayload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_payload = String::deserialize(deserializer)?;
        Self::from_hex(&hex_payload).map_err(D::Error::custom)
    }
}
