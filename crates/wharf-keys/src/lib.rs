//! Local keystore for Wharf.
//!
//! An isolated utility: the server unlocks it at startup when
//! `WALLET_PASSWORD` is set, logs the public key, and never touches it on
//! the request path. The signing key is sealed at rest with a
//! password-derived key (scrypt + ChaCha20-Poly1305).

pub mod error;
pub mod wallet;

pub use error::KeystoreError;
pub use wallet::Wallet;
