//! Passphrase → master key, plus the per-install salt it is derived with

use anyhow::Context;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit master key. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Derive the master key from a passphrase and salt with Argon2id.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> anyhow::Result<MasterKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    Ok(MasterKey::from_bytes(key))
}

/// Read the install salt, generating and persisting a random one on first use.
///
/// The salt is not secret, but losing it makes every stored payload
/// undecryptable, so an unreadable or truncated file is an error rather than
/// a reason to regenerate.
pub fn load_or_create_salt(path: &Path) -> anyhow::Result<[u8; SALT_SIZE]> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading salt file: {}", path.display()))?;
        let salt: [u8; SALT_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "salt file {} has {} bytes (expected {SALT_SIZE})",
                path.display(),
                bytes.len()
            )
        })?;
        return Ok(salt);
    }

    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating salt dir: {}", parent.display()))?;
    }
    std::fs::write(path, salt)
        .with_context(|| format!("writing salt file: {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new KDF salt");
    Ok(salt)
}
