//! offsync-crypto: payload encryption applied before mutations leave the device
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from passphrase + per-install salt)
//!   └── Payload Key (HKDF-SHA256, info = "offsync-payload:" || tenant_id)
//!       └── Payload AEAD: XChaCha20-Poly1305 (nonce = random 192-bit, AAD = tenant_id)
//! ```
//!
//! Binding the payload key and AAD to the tenant means a ciphertext copied
//! between accounts fails authentication instead of decrypting.

pub mod kdf;
pub mod keys;
pub mod payload;

pub use kdf::{derive_master_key, load_or_create_salt, KdfParams, MasterKey};
pub use keys::{derive_payload_key, PayloadKey};
pub use payload::{decrypt_payload, encrypt_payload, PayloadCipher};

/// Size of a master key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the Argon2id salt
pub const SALT_SIZE: usize = 16;
