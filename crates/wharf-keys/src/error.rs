use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("keystore file is malformed: {0}")]
    Format(#[from] serde_json::Error),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("failed to seal signing key")]
    Seal,

    #[error("wrong password or corrupted keystore")]
    Unseal,

    #[error("keystore field is not valid hex: {0}")]
    Encoding(#[from] hex::FromHexError),

    #[error("sealed key has the wrong length")]
    KeyLength,
}
