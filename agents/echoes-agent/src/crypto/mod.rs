//! Crypto module
//!
//! RSA key handling for the per-payload encryption used on the controller
//! session, plus the key persistence capability.

pub mod keys;
pub mod store;

pub use keys::{Keypair, PeerKey, DEFAULT_KEY_BITS};
pub use store::{default_key_dir, FileKeyStore, KeyStore, MemoryKeyStore, StoredKeypair};
