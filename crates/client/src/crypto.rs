// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cryptographic primitives: secp256k1 personal-sign/recover, keccak256
//! address derivation, and AES-256-GCM content encryption.
//!
//! Signatures are 65-byte `r || s || v` hex strings with a `0x` prefix,
//! `v ∈ {27, 28}`. Ciphertexts are hex with the random 12-byte GCM nonce
//! prepended.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use sha3::{Digest, Keccak256};

use crate::error::ClientError;

/// keccak256 digest.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash a payload with the Ethereum personal-sign prefix.
fn personal_hash(payload: &[u8]) -> [u8; 32] {
    let mut prefixed =
        format!("\u{19}Ethereum Signed Message:\n{}", payload.len()).into_bytes();
    prefixed.extend_from_slice(payload);
    keccak256(&prefixed)
}

fn address_of(key: &VerifyingKey) -> String {
    // Uncompressed point is 65 bytes: 0x04 || X || Y. The address is the
    // last 20 bytes of keccak256(X || Y).
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

// -- Signing identity ----------------------------------------------------------

/// A secp256k1 keypair plus its derived lowercase address.
pub struct SigningIdentity {
    key: SigningKey,
    address: String,
}

impl SigningIdentity {
    /// Load from a hex private key, with or without `0x` prefix.
    pub fn from_private_key(private_key: &str) -> Result<Self, ClientError> {
        let trimmed = private_key.strip_prefix("0x").unwrap_or(private_key);
        let bytes = hex::decode(trimmed)
            .map_err(|e| ClientError::Auth(format!("invalid private key hex: {e}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| ClientError::Auth(format!("invalid private key: {e}")))?;
        let address = address_of(key.verifying_key());
        Ok(Self { key, address })
    }

    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            // Rejection-sample until the scalar is a valid secp256k1 key.
            if let Ok(key) = SigningKey::from_slice(&bytes) {
                let address = address_of(key.verifying_key());
                return Self { key, address };
            }
        }
    }

    /// Lowercase `0x`-prefixed address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Personal-sign a payload, returning the 65-byte hex signature.
    pub fn sign(&self, payload: &[u8]) -> Result<String, ClientError> {
        let digest = personal_hash(payload);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ClientError::Auth(format!("signing failed: {e}")))?;
        let mut out = signature.to_bytes().to_vec();
        out.push(27 + recovery_id.to_byte());
        Ok(format!("0x{}", hex::encode(out)))
    }
}

impl std::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningIdentity").field("address", &self.address).finish_non_exhaustive()
    }
}

/// Recover the lowercase signer address from a personal-sign signature.
pub fn recover_address(signature: &str, payload: &[u8]) -> Result<String, ClientError> {
    let trimmed = signature.strip_prefix("0x").unwrap_or(signature);
    let bytes = hex::decode(trimmed)
        .map_err(|e| ClientError::Protocol(format!("invalid signature hex: {e}")))?;
    if bytes.len() != 65 {
        return Err(ClientError::Protocol(format!(
            "signature is {} bytes, expected 65",
            bytes.len()
        )));
    }
    let v = bytes[64];
    let recovery = RecoveryId::try_from(if v >= 27 { v - 27 } else { v })
        .map_err(|e| ClientError::Protocol(format!("invalid recovery id: {e}")))?;
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|e| ClientError::Protocol(format!("invalid signature: {e}")))?;
    let digest = personal_hash(payload);
    let key = VerifyingKey::recover_from_prehash(&digest, &signature, recovery)
        .map_err(|e| ClientError::Protocol(format!("recovery failed: {e}")))?;
    Ok(address_of(&key))
}

// -- Symmetric content encryption ----------------------------------------------

/// Encrypt plaintext under a 32-byte group key. Output is
/// `hex(nonce || ciphertext || tag)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String, ClientError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| ClientError::Decryption("invalid group key".to_owned()))?;
    let sealing = LessSafeKey::new(unbound);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    sealing
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| ClientError::Decryption("encryption failed".to_owned()))?;

    let mut out = nonce_bytes.to_vec();
    out.append(&mut in_out);
    Ok(hex::encode(out))
}

/// Decrypt a `hex(nonce || ciphertext || tag)` payload under a group key.
pub fn decrypt(key: &[u8; 32], ciphertext_hex: &str) -> Result<Vec<u8>, ClientError> {
    let bytes = hex::decode(ciphertext_hex)
        .map_err(|e| ClientError::Decryption(format!("invalid ciphertext hex: {e}")))?;
    if bytes.len() < NONCE_LEN {
        return Err(ClientError::Decryption("ciphertext shorter than nonce".to_owned()));
    }
    let (nonce_bytes, sealed) = bytes.split_at(NONCE_LEN);

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| ClientError::Decryption("invalid group key".to_owned()))?;
    let opening = LessSafeKey::new(unbound);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce);

    let mut in_out = sealed.to_vec();
    let plaintext = opening
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| ClientError::Decryption("authentication failed".to_owned()))?;
    Ok(plaintext.to_vec())
}

/// Stable partition selection for a partition key: keccak-based hash
/// reduced modulo the stream's partition count.
pub fn hash_partition(partition_key: &str, partition_count: u32) -> u32 {
    if partition_count <= 1 {
        return 0;
    }
    let digest = keccak256(partition_key.as_bytes());
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&digest[..4]);
    u32::from_be_bytes(prefix) % partition_count
}

#[cfg(test)]
#[path = "crypto_tests.rs"]
mod tests;
