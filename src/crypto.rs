// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Repository encryption: AES-256-CBC stream filters.
//!
//! Keys are derived from a passphrase with PBKDF2-HMAC-SHA256. Every
//! encrypted stream starts with a fresh random IV; the plaintext is padded
//! with PKCS-7, so ciphertext length is always a whole number of blocks.
//!
//! The repository layers passphrases: the operator passphrase unlocks the
//! info files, which carry a random subkey used for everything below them.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::filter::Filter;
use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const KDF_SALT: &[u8] = b"bulwark.cipher.v1";
const KDF_ROUNDS: u32 = 10_000;

/// Encryption applied to stored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherType {
    #[default]
    None,
    Aes256Cbc,
}

impl CipherType {
    pub fn from_option(name: &str) -> Result<CipherType> {
        match name {
            "none" => Ok(CipherType::None),
            "aes-256-cbc" => Ok(CipherType::Aes256Cbc),
            other => Err(Error::OptionInvalid(format!(
                "'{other}' is not a valid cipher-type"
            ))),
        }
    }

    pub fn option_name(&self) -> &'static str {
        match self {
            CipherType::None => "none",
            CipherType::Aes256Cbc => "aes-256-cbc",
        }
    }
}

/// Derive the AES key for a passphrase.
pub fn derive_key(passphrase: &str) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key)
        .expect("key length is valid for HMAC-SHA256");
    key
}

/// A fresh random subkey, stored (encrypted) in the info files.
pub fn random_passphrase() -> String {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Encrypting filter: emits the IV, then ciphertext blocks, then the final
/// PKCS-7 padded block at flush.
pub struct CryptoEncrypt {
    cipher: Option<Aes256CbcEnc>,
    iv: [u8; BLOCK_SIZE],
    iv_sent: bool,
    carry: Vec<u8>,
}

impl CryptoEncrypt {
    pub fn new(passphrase: &str) -> CryptoEncrypt {
        let key = derive_key(passphrase);
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        let cipher = Aes256CbcEnc::new_from_slices(&key, &iv).expect("key and IV sizes are fixed");
        CryptoEncrypt {
            cipher: Some(cipher),
            iv,
            iv_sent: false,
            carry: Vec::with_capacity(BLOCK_SIZE),
        }
    }
}

impl Filter for CryptoEncrypt {
    fn name(&self) -> &str {
        "encrypt"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        if !self.iv_sent {
            output.extend_from_slice(&self.iv);
            self.iv_sent = true;
        }

        let cipher = self.cipher.as_mut().expect("cipher open");
        self.carry.extend_from_slice(input);
        let whole = (self.carry.len() / BLOCK_SIZE) * BLOCK_SIZE;
        for block in self.carry[..whole].chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.extend_from_slice(&self.carry[..whole]);
        self.carry.drain(..whole);
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        if let Some(cipher) = self.cipher.take() {
            if !self.iv_sent {
                output.extend_from_slice(&self.iv);
                self.iv_sent = true;
            }
            let mut last = [0u8; 2 * BLOCK_SIZE];
            let message_len = self.carry.len();
            last[..message_len].copy_from_slice(&self.carry);
            let padded = cipher
                .encrypt_padded_mut::<Pkcs7>(&mut last, message_len)
                .map_err(|err| Error::Crypto(format!("pad final block: {err}")))?;
            output.extend_from_slice(padded);
            self.carry.clear();
        }
        Ok(true)
    }
}

/// Decrypting filter: consumes the IV prefix, decrypts blockwise, and strips
/// the PKCS-7 padding from the final block at flush.
pub struct CryptoDecrypt {
    key: [u8; KEY_SIZE],
    cipher: Option<Aes256CbcDec>,
    pending: Vec<u8>,
}

impl CryptoDecrypt {
    pub fn new(passphrase: &str) -> CryptoDecrypt {
        CryptoDecrypt {
            key: derive_key(passphrase),
            cipher: None,
            pending: Vec::new(),
        }
    }
}

impl Filter for CryptoDecrypt {
    fn name(&self) -> &str {
        "decrypt"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        self.pending.extend_from_slice(input);

        if self.cipher.is_none() {
            if self.pending.len() < BLOCK_SIZE {
                return Ok(input.len());
            }
            let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.pending[..BLOCK_SIZE])
                .expect("key and IV sizes are fixed");
            self.cipher = Some(cipher);
            self.pending.drain(..BLOCK_SIZE);
        }

        // The final block holds padding, so at least one whole block stays
        // pending until flush.
        if self.pending.len() > BLOCK_SIZE {
            let decryptable = ((self.pending.len() - BLOCK_SIZE) / BLOCK_SIZE) * BLOCK_SIZE;
            let cipher = self.cipher.as_mut().expect("cipher initialized");
            for block in self.pending[..decryptable].chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            output.extend_from_slice(&self.pending[..decryptable]);
            self.pending.drain(..decryptable);
        }
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        match self.cipher.take() {
            None => Err(Error::Crypto(
                "encrypted stream shorter than one block".into(),
            )),
            Some(cipher) => {
                if self.pending.len() != BLOCK_SIZE {
                    return Err(Error::Crypto(
                        "encrypted stream is not a whole number of blocks".into(),
                    ));
                }
                let mut last = [0u8; BLOCK_SIZE];
                last.copy_from_slice(&self.pending);
                let plain = cipher
                    .decrypt_padded_mut::<Pkcs7>(&mut last)
                    .map_err(|_| Error::Crypto("bad padding: wrong key or corrupt data".into()))?;
                output.extend_from_slice(plain);
                self.pending.clear();
                Ok(true)
            }
        }
    }
}
