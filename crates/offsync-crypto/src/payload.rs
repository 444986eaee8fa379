//! XChaCha20-Poly1305 payload encryption
//!
//! Encrypted payload format:
//! ```text
//! [24 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = "offsync-v1:" || tenant_id
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::kdf::MasterKey;
use crate::keys::{derive_payload_key, PayloadKey};
use crate::{NONCE_SIZE, TAG_SIZE};

/// Encrypt one payload. Returns `[nonce][ciphertext][tag]`.
pub fn encrypt_payload(key: &PayloadKey, aad: &[u8], plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("payload encryption failed: {e}"))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt one payload produced by [`encrypt_payload`].
pub fn decrypt_payload(key: &PayloadKey, aad: &[u8], encrypted: &[u8]) -> anyhow::Result<Vec<u8>> {
    if encrypted.len() < NONCE_SIZE + TAG_SIZE {
        anyhow::bail!(
            "encrypted payload too short: {} bytes (minimum {})",
            encrypted.len(),
            NONCE_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("payload decryption failed: wrong key, wrong tenant, or corrupted data"))
}

/// Tenant-bound cipher handed to the sync engine as its encryption collaborator.
#[derive(Debug, Clone)]
pub struct PayloadCipher {
    key: PayloadKey,
    aad: Vec<u8>,
}

impl PayloadCipher {
    pub fn new(master: &MasterKey, tenant_id: &str) -> anyhow::Result<Self> {
        Ok(Self {
            key: derive_payload_key(master, tenant_id)?,
            aad: format!("offsync-v1:{tenant_id}").into_bytes(),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        encrypt_payload(&self.key, &self.aad, plaintext)
    }

    pub fn decrypt(&self, encrypted: &[u8]) -> anyhow::Result<Vec<u8>> {
        decrypt_payload(&self.key, &self.aad, encrypted)
    }
}
