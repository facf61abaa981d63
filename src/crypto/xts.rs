/// Data unit encryption using XTS-AES-256
///
/// XTS (IEEE P1619) encrypts each 512-byte data unit independently, using
/// the data unit index as the tweak. Ciphertext has the same size as the
/// plaintext, so a device can be converted in place and any data unit can be
/// read or written without touching its neighbours.
///
/// The 64-byte key is split into the data key (first half) and the tweak key
/// (second half). Round keys are wiped when the context is closed or dropped.
use std::sync::RwLock;

use aes::cipher::{generic_array::GenericArray, KeyInit};
use aes::Aes256;
use rand::RngCore;
use xts_mode::{get_tweak_default, Xts128};
use zeroize::Zeroizing;

use super::{CryptoContext, CryptoError, Result};
use crate::config::DATA_UNIT_SIZE;

/// XTS-AES-256 key length (two AES-256 keys)
pub const XTS_KEY_SIZE: usize = 64;

/// Generates a random XTS-AES-256 key.
pub fn generate_key() -> Zeroizing<[u8; XTS_KEY_SIZE]> {
    let mut key = Zeroizing::new([0u8; XTS_KEY_SIZE]);
    rand::rng().fill_bytes(&mut *key);
    key
}

/// XTS-AES-256 crypto context
pub struct XtsCryptoContext {
    /// Cipher instance, `None` once closed
    cipher: RwLock<Option<Xts128<Aes256>>>,
}

impl XtsCryptoContext {
    /// Creates a context from a 64-byte key
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeySize`] if `key` is not 64 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != XTS_KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: XTS_KEY_SIZE,
                actual: key.len(),
            });
        }

        let key1 = Aes256::new(GenericArray::from_slice(&key[0..32]));
        let key2 = Aes256::new(GenericArray::from_slice(&key[32..64]));

        Ok(Self {
            cipher: RwLock::new(Some(Xts128::<Aes256>::new(key1, key2))),
        })
    }

    /// Creates a context with a freshly generated random key
    pub fn random() -> Self {
        let key = generate_key();
        let key1 = Aes256::new(GenericArray::from_slice(&key[0..32]));
        let key2 = Aes256::new(GenericArray::from_slice(&key[32..64]));
        Self {
            cipher: RwLock::new(Some(Xts128::<Aes256>::new(key1, key2))),
        }
    }

    /// Returns true once [`CryptoContext::close`] was called
    pub fn is_closed(&self) -> bool {
        self.cipher.read().map(|c| c.is_none()).unwrap_or(true)
    }

    fn area<'a>(buf: &'a mut [u8], unit_count: usize) -> Result<&'a mut [u8]> {
        let len = unit_count
            .checked_mul(DATA_UNIT_SIZE)
            .filter(|&len| len <= buf.len())
            .ok_or(CryptoError::BufferTooShort {
                len: buf.len(),
                units: unit_count,
            })?;
        Ok(&mut buf[..len])
    }
}

impl CryptoContext for XtsCryptoContext {
    fn encrypt_data_units(&self, buf: &mut [u8], first_unit: u64, unit_count: usize) -> Result<()> {
        let area = Self::area(buf, unit_count)?;
        let guard = self.cipher.read().map_err(|_| CryptoError::Closed)?;
        let cipher = guard.as_ref().ok_or(CryptoError::Closed)?;

        cipher.encrypt_area(area, DATA_UNIT_SIZE, first_unit as u128, get_tweak_default);
        Ok(())
    }

    fn decrypt_data_units(&self, buf: &mut [u8], first_unit: u64, unit_count: usize) -> Result<()> {
        let area = Self::area(buf, unit_count)?;
        let guard = self.cipher.read().map_err(|_| CryptoError::Closed)?;
        let cipher = guard.as_ref().ok_or(CryptoError::Closed)?;

        cipher.decrypt_area(area, DATA_UNIT_SIZE, first_unit as u128, get_tweak_default);
        Ok(())
    }

    fn close(&self) {
        // Dropping the AES instances wipes the expanded round keys
        if let Ok(mut guard) = self.cipher.write() {
            guard.take();
        }
    }
}

impl std::fmt::Debug for XtsCryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XtsCryptoContext")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> XtsCryptoContext {
        let key = generate_key();
        XtsCryptoContext::new(&key[..]).unwrap()
    }

    #[test]
    fn test_invalid_key_size() {
        let result = XtsCryptoContext::new(&[0u8; 32]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeySize { expected: 64, actual: 32 })
        ));
    }

    #[test]
    fn test_encrypt_decrypt_units() {
        let ctx = context();
        let plaintext: Vec<u8> = (0..4 * DATA_UNIT_SIZE).map(|i| i as u8).collect();

        let mut buffer = plaintext.clone();
        ctx.encrypt_data_units(&mut buffer, 100, 4).unwrap();
        assert_ne!(buffer, plaintext);

        ctx.decrypt_data_units(&mut buffer, 100, 4).unwrap();
        assert_eq!(buffer, plaintext);
    }

    #[test]
    fn test_units_match_individual_tweaks() {
        let ctx = context();
        let plaintext = vec![0x42u8; 2 * DATA_UNIT_SIZE];

        let mut whole = plaintext.clone();
        ctx.encrypt_data_units(&mut whole, 10, 2).unwrap();

        let mut second = plaintext[DATA_UNIT_SIZE..].to_vec();
        ctx.encrypt_data_units(&mut second, 11, 1).unwrap();

        assert_eq!(&whole[DATA_UNIT_SIZE..], &second[..]);
        assert_ne!(&whole[..DATA_UNIT_SIZE], &whole[DATA_UNIT_SIZE..]);
    }

    #[test]
    fn test_wrong_data_unit() {
        let ctx = context();
        let plaintext = vec![0x42u8; DATA_UNIT_SIZE];

        let mut buffer = plaintext.clone();
        ctx.encrypt_data_units(&mut buffer, 10, 1).unwrap();
        ctx.decrypt_data_units(&mut buffer, 11, 1).unwrap();
        assert_ne!(buffer, plaintext);
    }

    #[test]
    fn test_only_requested_units_touched() {
        let ctx = context();
        let mut buffer = vec![0x11u8; 3 * DATA_UNIT_SIZE];
        ctx.encrypt_data_units(&mut buffer, 0, 2).unwrap();
        assert!(buffer[2 * DATA_UNIT_SIZE..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_buffer_too_short() {
        let ctx = context();
        let mut buffer = vec![0u8; DATA_UNIT_SIZE];
        let result = ctx.encrypt_data_units(&mut buffer, 0, 2);
        assert_eq!(result, Err(CryptoError::BufferTooShort { len: 512, units: 2 }));
    }

    #[test]
    fn test_different_keys() {
        let ctx1 = context();
        let ctx2 = context();
        let plaintext = vec![0x42u8; DATA_UNIT_SIZE];

        let mut ct1 = plaintext.clone();
        let mut ct2 = plaintext.clone();
        ctx1.encrypt_data_units(&mut ct1, 0, 1).unwrap();
        ctx2.encrypt_data_units(&mut ct2, 0, 1).unwrap();
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn test_close_destroys_keys() {
        let ctx = XtsCryptoContext::random();
        assert!(!ctx.is_closed());
        ctx.close();
        assert!(ctx.is_closed());

        let mut buffer = vec![0u8; DATA_UNIT_SIZE];
        assert_eq!(ctx.encrypt_data_units(&mut buffer, 0, 1), Err(CryptoError::Closed));
    }
}
