//! AES-128-CBC codec with PKCS#7 padding — the cipher behind the encrypted
//! config file.
//!
//! The codec takes the key and IV as parameters; the compiled-in material
//! lives next to the file format in [`crate::store`]. Both are fixed 16-byte
//! values, so the on-disk encryption is obfuscation against casual reads,
//! not protection from a local adversary.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Cipher block size in bytes. Key and IV must be exactly this long.
pub const BLOCK_SIZE: usize = 16;

/// Codec failure kinds.
#[derive(Debug, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length: got {0}, want 16")]
    InvalidKeyLength(usize),
    #[error("invalid iv length: got {0}, want 16")]
    InvalidIvLength(usize),
    #[error("ciphertext length {0} is not a positive multiple of 16")]
    InvalidLength(usize),
    #[error("invalid pkcs#7 padding")]
    InvalidPadding,
}

fn check_key_iv(key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
    if key.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidKeyLength(key.len()));
    }
    if iv.len() != BLOCK_SIZE {
        return Err(CryptoError::InvalidIvLength(iv.len()));
    }
    Ok(())
}

/// CBC-encrypt `plaintext` after PKCS#7 padding.
///
/// Padding appends `n` copies of the byte `n` where
/// `n = 16 - len % 16`, so the output always grows by 1..=16 bytes.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key_iv(key, iv)?;
    let cipher = Aes128CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// CBC-decrypt `ciphertext` and strip PKCS#7 padding.
///
/// The padding run is fully verified: the final byte must be in `1..=16`,
/// no larger than the message, and every padding byte must match it.
pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key_iv(key, iv)?;
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(ciphertext.len()));
    }
    let cipher = Aes128CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const KEY: [u8; 16] = hex!("68e4da8059897460a2e2eef0f8f04aea");
    const IV: [u8; 16] = hex!("aec61a049d064ea7d0dc0f5ed070d42e");

    #[test]
    fn test_roundtrip_various_lengths() {
        for len in [0usize, 1, 15, 16, 17, 31, 32, 100] {
            let plaintext: Vec<u8> = (0..len).map(|i| u8::try_from(i % 251).unwrap()).collect();
            let ct = encrypt(&plaintext, &KEY, &IV).unwrap();
            assert_eq!(ct.len() % BLOCK_SIZE, 0);
            // PKCS#7 always pads, so the ciphertext is strictly longer.
            assert!(ct.len() > plaintext.len());
            let back = decrypt(&ct, &KEY, &IV).unwrap();
            assert_eq!(back, plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext_pads_full_block() {
        let ct = encrypt(b"", &KEY, &IV).unwrap();
        assert_eq!(ct.len(), BLOCK_SIZE);
        assert_eq!(decrypt(&ct, &KEY, &IV).unwrap(), b"");
    }

    #[test]
    fn test_exact_block_gains_padding_block() {
        let ct = encrypt(&[0xabu8; 16], &KEY, &IV).unwrap();
        assert_eq!(ct.len(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_invalid_key_and_iv_lengths() {
        assert_eq!(
            encrypt(b"x", &KEY[..8], &IV).unwrap_err(),
            CryptoError::InvalidKeyLength(8)
        );
        assert_eq!(
            encrypt(b"x", &KEY, &IV[..15]).unwrap_err(),
            CryptoError::InvalidIvLength(15)
        );
        assert_eq!(
            decrypt(&[0u8; 16], &[], &IV).unwrap_err(),
            CryptoError::InvalidKeyLength(0)
        );
    }

    #[test]
    fn test_ciphertext_must_be_block_aligned() {
        assert_eq!(
            decrypt(&[0u8; 15], &KEY, &IV).unwrap_err(),
            CryptoError::InvalidLength(15)
        );
        assert_eq!(
            decrypt(&[], &KEY, &IV).unwrap_err(),
            CryptoError::InvalidLength(0)
        );
    }

    #[test]
    fn test_tampered_padding_is_rejected() {
        // 20 plaintext bytes -> 32 ciphertext bytes with a 12-byte padding
        // run. Flipping the last byte of the first ciphertext block flips
        // the final padding byte during CBC decryption (12 ^ 0xff > 16),
        // which must be rejected.
        let mut ct = encrypt(&[0x42u8; 20], &KEY, &IV).unwrap();
        assert_eq!(ct.len(), 32);
        ct[15] ^= 0xff;
        assert_eq!(decrypt(&ct, &KEY, &IV).unwrap_err(), CryptoError::InvalidPadding);
    }
}
