//! Encryption collaborator applied to payloads before they are queued and
//! after remote payloads arrive.

use offsync_core::OfsResult;

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> OfsResult<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8]) -> OfsResult<Vec<u8>>;
}

/// Pass-through used when `crypto.enabled = false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextEncryptor;

impl Encryptor for PlaintextEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> OfsResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> OfsResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

#[cfg(feature = "crypto")]
mod cipher {
    use offsync_core::{OfsResult, SyncError};
    use offsync_crypto::PayloadCipher;

    use super::Encryptor;

    impl Encryptor for PayloadCipher {
        fn encrypt(&self, plaintext: &[u8]) -> OfsResult<Vec<u8>> {
            PayloadCipher::encrypt(self, plaintext).map_err(|e| SyncError::Crypto(e.to_string()))
        }

        fn decrypt(&self, ciphertext: &[u8]) -> OfsResult<Vec<u8>> {
            PayloadCipher::decrypt(self, ciphertext).map_err(|e| SyncError::Crypto(e.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use offsync_crypto::{MasterKey, KEY_SIZE};

        #[test]
        fn payload_cipher_round_trips_through_trait() {
            let cipher = PayloadCipher::new(&MasterKey::from_bytes([3u8; KEY_SIZE]), "acme").unwrap();
            let encryptor: &dyn Encryptor = &cipher;
            let sealed = encryptor.encrypt(br#"{"amount":50}"#).unwrap();
            assert_eq!(encryptor.decrypt(&sealed).unwrap(), br#"{"amount":50}"#);
            assert_eq!(encryptor.decrypt(&sealed[..10]).unwrap_err().kind(), "crypto");
        }
    }
}
