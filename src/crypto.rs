// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Encryption
//!
//! Symmetric encryption of message payloads with XChaCha20-Poly1305.
//!
//! The key is the SHA-256 digest of the configured secret. Each call to
//! [`MessageCodec::encrypt`] draws a fresh random 192-bit nonce, so no nonce
//! is ever reused under the same key. The wire format is
//! `base64(nonce || ciphertext || tag)`; the authentication tag makes
//! tampered or truncated payloads fail to decrypt instead of yielding garbage.

use crate::{configs::MIN_SECRET_LEN, errors::AmqpError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 24;

/// Encrypts and decrypts message payloads with a key derived from a shared secret.
pub struct MessageCodec {
    cipher: XChaCha20Poly1305,
}

impl MessageCodec {
    /// Creates a codec for the given secret.
    ///
    /// Fails with `AmqpError::ConfigError` when the trimmed secret is shorter
    /// than [`MIN_SECRET_LEN`] characters.
    pub fn new(secret: &str) -> Result<MessageCodec, AmqpError> {
        if secret.trim().chars().count() < MIN_SECRET_LEN {
            return Err(AmqpError::ConfigError(format!(
                "secret for encryption must be at least {} characters long",
                MIN_SECRET_LEN
            )));
        }

        let digest = Sha256::digest(secret.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&digest));

        Ok(MessageCodec { cipher })
    }

    /// Serializes `value` to JSON, encrypts it and returns the base64 text as bytes.
    pub fn encrypt<T>(&self, value: &T) -> Result<Vec<u8>, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.seal(&to_bytes(value)?)
    }

    /// Encrypts already serialized bytes.
    ///
    /// # Parameters
    /// * `plain` - The serialized payload
    ///
    /// # Returns
    /// `base64(nonce || ciphertext || tag)` as bytes, decodable with
    /// [`MessageCodec::decrypt`]
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, AmqpError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plain)
            .map_err(|err| AmqpError::EncryptionError(err.to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);

        Ok(STANDARD.encode(raw).into_bytes())
    }

    /// Reverses [`MessageCodec::encrypt`].
    ///
    /// # Parameters
    /// * `encoded` - Base64 text of the nonce followed by the sealed payload
    ///
    /// # Returns
    /// The serialized JSON bytes, or `AmqpError::DecryptionError` when the body
    /// is malformed or was sealed with another secret
    pub fn decrypt(&self, encoded: &[u8]) -> Result<Vec<u8>, AmqpError> {
        let raw = STANDARD
            .decode(encoded)
            .map_err(|err| AmqpError::DecryptionError(err.to_string()))?;

        if raw.len() < NONCE_LEN {
            return Err(AmqpError::DecryptionError(
                "payload shorter than nonce".to_owned(),
            ));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|err| AmqpError::DecryptionError(err.to_string()))
    }
}

/// Canonical byte encoding of a message payload.
pub fn to_bytes<T>(value: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(value).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
