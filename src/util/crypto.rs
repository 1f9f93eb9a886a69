//! # AES Primitives for Telegram Decryption
//!
//! AES-128 in the modes the transport and link layers call for: CBC with
//! and without IV (TPL security modes 5 and 7), CTR (ELL security mode 1)
//! and CMAC per RFC 4493 (session key derivation and message
//! authentication).
//!
//! Keys are wrapped in [`AesKey`] which zeroizes on drop.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, KeyInit, KeyIvInit};
use aes::Aes128;
use cipher::block_padding::NoPadding;
use cmac::{Cmac, Mac};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected 16, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid data length: must be multiple of 16, got {0}")]
    InvalidDataLength(usize),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// AES-128 key material, zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey {
    key: [u8; 16],
}

impl AesKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 16 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; 16];
        key.copy_from_slice(bytes);
        Ok(AesKey { key })
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = crate::util::hex::decode_hex_strict(s)
            .map_err(|_| CryptoError::InvalidKeyLength(s.len() / 2))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.key
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        write!(f, "AesKey(****)")
    }
}

/// Encrypt a single block in place (ECB). Building block for CTR.
pub fn aes128_encrypt_block(key: &AesKey, block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let ga = GenericArray::from_mut_slice(block);
    cipher.encrypt_block(ga);
}

/// Decrypt with AES-128 CBC and the given IV. `data` must be a whole
/// number of blocks.
pub fn aes_cbc_decrypt(key: &AesKey, iv: &[u8; 16], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidDataLength(data.len()));
    }
    let mut buf = data.to_vec();
    Aes128CbcDec::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(iv),
    )
    .decrypt_padded_mut::<NoPadding>(&mut buf)
    .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
    Ok(buf)
}

/// CBC with an all-zero IV, as used by TPL security mode 7.
pub fn aes_cbc_decrypt_no_iv(key: &AesKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    aes_cbc_decrypt(key, &[0u8; 16], data)
}

/// Treat the IV as a big-endian counter and increment it.
pub fn increment_iv(iv: &mut [u8; 16]) {
    for b in iv.iter_mut().rev() {
        let (v, carry) = b.overflowing_add(1);
        *b = v;
        if !carry {
            break;
        }
    }
}

/// AES-128 CTR transform. Symmetric, so this both encrypts and decrypts.
/// A trailing partial block is allowed.
pub fn aes_ctr_transform(key: &AesKey, iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut counter = *iv;
    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks(AES_BLOCK_SIZE) {
        let mut keystream = counter;
        aes128_encrypt_block(key, &mut keystream);
        for (i, &b) in chunk.iter().enumerate() {
            out.push(b ^ keystream[i]);
        }
        increment_iv(&mut counter);
    }
    out
}

/// AES-CMAC per RFC 4493, including the K1/K2 subkey derivation handled by
/// the cmac crate.
pub fn aes_cmac(key: &AesKey, data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes())
        .expect("AES-128 CMAC accepts 16 byte keys");
    mac.update(data);
    let result = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&result);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::{decode_hex_strict, encode_hex_upper};

    fn rfc4493_key() -> AesKey {
        AesKey::from_hex("2b7e151628aed2a6abf7158809cf4f3c").unwrap()
    }

    #[test]
    fn test_cmac_rfc4493_empty() {
        let mac = aes_cmac(&rfc4493_key(), &[]);
        assert_eq!(encode_hex_upper(&mac), "BB1D6929E95937287FA37D129B756746");
    }

    #[test]
    fn test_cmac_rfc4493_one_block() {
        let input = decode_hex_strict("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let mac = aes_cmac(&rfc4493_key(), &input);
        assert_eq!(encode_hex_upper(&mac), "070A16B46B4D4144F79BDD9DD04A287C");
    }

    #[test]
    fn test_key_length_check() {
        assert!(matches!(
            AesKey::from_bytes(&[0u8; 8]),
            Err(CryptoError::InvalidKeyLength(8))
        ));
    }

    #[test]
    fn test_ctr_round_trip() {
        let key = rfc4493_key();
        let iv = [0x42u8; 16];
        let plain = b"a short message spanning blocks!".to_vec();
        let enc = aes_ctr_transform(&key, &iv, &plain);
        assert_ne!(enc, plain);
        let dec = aes_ctr_transform(&key, &iv, &enc);
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_increment_iv_carries() {
        let mut iv = [0xffu8; 16];
        iv[0] = 0x00;
        increment_iv(&mut iv);
        assert_eq!(iv[0], 0x01);
        assert!(iv[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let key = rfc4493_key();
        assert!(matches!(
            aes_cbc_decrypt(&key, &[0u8; 16], &[0u8; 17]),
            Err(CryptoError::InvalidDataLength(17))
        ));
    }
}
