//! RSA Keys
//!
//! The agent's own keypair and the controller's public key. Payloads are
//! encrypted with RSA-OAEP (SHA-256) in independent blocks so that messages
//! longer than one modulus fit; signatures are PKCS#1 v1.5 over SHA-256.

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::info;

use crate::crypto::store::{KeyStore, StoredKeypair};
use crate::error::CryptoError;

/// Default modulus size for freshly generated keys
pub const DEFAULT_KEY_BITS: usize = 2048;

/// OAEP overhead with SHA-256: two digests plus two marker bytes
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// The agent's own keypair
#[derive(Clone)]
pub struct Keypair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl Keypair {
    /// Generate a new keypair with the given modulus size
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_private_key(private)
    }

    /// Rebuild a keypair from a PKCS#8 PEM private key
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_private_key(private)
    }

    fn from_private_key(private: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public_pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { private, public_pem })
    }

    /// Load the persisted keypair, or generate and persist a new one
    pub fn load_or_generate(store: &dyn KeyStore, bits: usize) -> Result<Self, CryptoError> {
        if let Some(stored) = store.load()? {
            let keypair = Self::from_private_pem(&stored.private_pem)?;
            if let Some(public_pem) = stored.public_pem.as_deref() {
                let stored_public = PeerKey::from_pem(public_pem)?;
                if stored_public.key != keypair.private.to_public_key() {
                    return Err(CryptoError::InvalidKey(
                        "stored public key does not match the private key".to_string(),
                    ));
                }
            }
            info!("Loaded RSA keys from key store");
            return Ok(keypair);
        }

        let keypair = Self::generate(bits)?;
        info!(bits, "Generated RSA keys");
        store.save(&StoredKeypair {
            private_pem: keypair.private_key_pem()?,
            public_pem: Some(keypair.public_pem.clone()),
        })?;
        info!("Stored RSA keys in key store");
        Ok(keypair)
    }

    /// SPKI PEM of the public half, as sent in the handshake
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// PKCS#8 PEM of the private half, for persistence
    pub fn private_key_pem(&self) -> Result<String, CryptoError> {
        let pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(pem.to_string())
    }

    /// Our own public key, usable wherever a peer key is expected
    pub fn public_key(&self) -> PeerKey {
        PeerKey {
            key: self.private.to_public_key(),
            pem: self.public_pem.clone(),
        }
    }

    /// Decrypt a ciphertext made of whole OAEP blocks
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.private.size();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(CryptoError::Decryption(format!(
                "ciphertext length {} is not a multiple of the {} byte block",
                ciphertext.len(),
                block
            )));
        }

        let mut plaintext = Vec::with_capacity(ciphertext.len());
        for chunk in ciphertext.chunks(block) {
            let part = self
                .private
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(|e| CryptoError::Decryption(e.to_string()))?;
            plaintext.extend_from_slice(&part);
        }
        Ok(plaintext)
    }

    /// Sign the SHA-256 digest of a message
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = Sha256::digest(message);
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| CryptoError::Signature(e.to_string()))
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("bits", &(self.private.size() * 8))
            .finish_non_exhaustive()
    }
}

/// A counterpart's public key
#[derive(Clone)]
pub struct PeerKey {
    key: RsaPublicKey,
    pem: String,
}

impl PeerKey {
    /// Parse a PEM public key, SPKI or PKCS#1
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            key,
            pem: pem.to_string(),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Encrypt a plaintext of any length
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let block = self.key.size();
        let chunk_len = block.checked_sub(OAEP_SHA256_OVERHEAD).filter(|len| *len > 0).ok_or_else(|| {
            CryptoError::InvalidKey(format!("{} bit key is too small for OAEP", block * 8))
        })?;

        let mut rng = rand::thread_rng();
        let mut ciphertext = Vec::with_capacity((plaintext.len() / chunk_len + 1) * block);

        if plaintext.is_empty() {
            let sealed = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?;
            ciphertext.extend_from_slice(&sealed);
            return Ok(ciphertext);
        }

        for chunk in plaintext.chunks(chunk_len) {
            let sealed = self
                .key
                .encrypt(&mut rng, Oaep::new::<Sha256>(), chunk)
                .map_err(|e| CryptoError::Encryption(e.to_string()))?;
            ciphertext.extend_from_slice(&sealed);
        }
        Ok(ciphertext)
    }

    /// Verify a signature made by [`Keypair::sign`]
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let digest = Sha256::digest(message);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|e| CryptoError::Signature(e.to_string()))
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerKey")
            .field("bits", &(self.key.size() * 8))
            .finish()
    }
}
