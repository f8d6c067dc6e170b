//! Opaque cipher seam for per-connection payload encryption.
//!
//! The transport core never interprets key material. A connection may be
//! bound to any `(encrypt, decrypt)` capability; the runtime applies it to
//! payload bytes when the ENCRYPTED flag is set, after framing and before
//! dispatch. Key selection and rotation belong to the handler layer.

use thiserror::Error;

/// A cipher operation failed.
///
/// The inner message is whatever the cipher implementation reported; the
/// core treats it as opaque and closes or rejects accordingly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cipher error: {0}")]
pub struct CipherError(pub String);

/// Byte-in/byte-out payload cipher.
///
/// Checksums are computed over the wire form, so encryption happens before
/// packet construction on send and decryption after integrity validation on
/// receive.
pub trait PacketCipher: Send + Sync {
    /// Encrypt a plaintext payload.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt a ciphertext payload.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}
