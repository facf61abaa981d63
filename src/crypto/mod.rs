//! Cipher capability consumed by the I/O queue and the conversion engine.
//!
//! The queue never touches cipher primitives directly. It encrypts and
//! decrypts whole data units through a [`CryptoContext`], which owns the key
//! material and wipes it on [`CryptoContext::close`].

pub mod xts;

use thiserror::Error;

pub use xts::XtsCryptoContext;

/// Errors raised by a crypto context.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key has the wrong length for the cipher.
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// Buffer does not hold the requested number of data units.
    #[error("Buffer of {len} bytes is too short for {units} data units")]
    BufferTooShort { len: usize, units: usize },

    /// The context was closed and its keys destroyed.
    #[error("Crypto context is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Encrypts and decrypts data units in place.
///
/// Data unit `n` of a buffer passed with `first_unit` is processed with the
/// tweak `first_unit + n`. Only the first `unit_count` data units of `buf`
/// are touched.
pub trait CryptoContext: Send + Sync {
    /// Encrypts `unit_count` data units of `buf` in place.
    fn encrypt_data_units(&self, buf: &mut [u8], first_unit: u64, unit_count: usize) -> Result<()>;

    /// Decrypts `unit_count` data units of `buf` in place.
    fn decrypt_data_units(&self, buf: &mut [u8], first_unit: u64, unit_count: usize) -> Result<()>;

    /// Destroys the key material. Later calls fail with [`CryptoError::Closed`].
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_context_object_safe() {
        let _: Option<Box<dyn CryptoContext>> = None;
    }

    #[test]
    fn test_error_display() {
        let err = CryptoError::InvalidKeySize { expected: 64, actual: 32 };
        assert_eq!(err.to_string(), "Invalid key size: expected 64 bytes, got 32");
    }
}
