//! Ed25519 wallet sealed at rest.
//!
//! The keystore file is JSON: the public key in the clear, the signing key
//! sealed with ChaCha20-Poly1305 under a scrypt-derived key. The KDF
//! parameters ride in the file so they can be strengthened later without
//! breaking existing keystores.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::KeystoreError;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdfParams {
    log_n: u8,
    r: u32,
    p: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Interactive-strength scrypt parameters.
        Self { log_n: 15, r: 8, p: 1 }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    public_key: String,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    sealed_key: String,
}

/// A local signing identity.
pub struct Wallet {
    signing_key: SigningKey,
}

impl Wallet {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex form of the public key, used for log lines and display.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
        key.verify(message, signature).is_ok()
    }

    /// Seal the signing key under `password` and write the keystore file.
    pub fn save(&self, path: &Path, password: &str) -> Result<(), KeystoreError> {
        let kdf = KdfParams::default();

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = derive_key(password, &salt, &kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), self.signing_key.to_bytes().as_slice())
            .map_err(|_| KeystoreError::Seal)?;

        let file = KeystoreFile {
            public_key: self.public_key_hex(),
            kdf,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            sealed_key: hex::encode(sealed),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "Keystore written");
        Ok(())
    }

    /// Load and unseal a keystore file. A wrong password fails the AEAD tag
    /// check and surfaces as [`KeystoreError::Unseal`].
    pub fn load(path: &Path, password: &str) -> Result<Self, KeystoreError> {
        let content = std::fs::read_to_string(path)?;
        let file: KeystoreFile = serde_json::from_str(&content)?;

        let salt = hex::decode(&file.salt)?;
        let nonce = hex::decode(&file.nonce)?;
        let sealed = hex::decode(&file.sealed_key)?;

        let key = derive_key(password, &salt, &file.kdf)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| KeystoreError::Unseal)?;

        let secret: [u8; 32] = plain.try_into().map_err(|_| KeystoreError::KeyLength)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Load the wallet at `path`, creating and sealing a fresh one when the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path, password: &str) -> Result<Self, KeystoreError> {
        if path.exists() {
            return Self::load(path, password);
        }
        tracing::info!(path = %path.display(), "No keystore found, generating one");
        let wallet = Self::generate();
        wallet.save(path, password)?;
        Ok(wallet)
    }
}

fn derive_key(password: &str, salt: &[u8], kdf: &KdfParams) -> Result<[u8; 32], KeystoreError> {
    let params = scrypt::Params::new(kdf.log_n, kdf.r, kdf.p, 32)
        .map_err(|e| KeystoreError::KeyDerivation(e.to_string()))?;
    let mut key = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut key)
        .map_err(|e| KeystoreError::KeyDerivation(e.to_string()))?;
    Ok(key)
}
