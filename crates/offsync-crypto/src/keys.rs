//! Tenant-scoped payload key derived from the master key

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// 256-bit key used for payload AEAD. Zeroized on drop.
#[derive(Clone)]
pub struct PayloadKey {
    bytes: [u8; KEY_SIZE],
}

impl PayloadKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for PayloadKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// HKDF-SHA256 expand of the master key with info `offsync-payload:{tenant_id}`.
pub fn derive_payload_key(master: &MasterKey, tenant_id: &str) -> anyhow::Result<PayloadKey> {
    let info = format!("offsync-payload:{tenant_id}");
    let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info.as_bytes(), &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(PayloadKey::from_bytes(okm))
}
