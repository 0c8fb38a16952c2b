//! AES-256-CBC for relay message bodies. The 16-byte IV prefixes the ciphertext.

use crate::error::SigningError;
use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::RngCore;

const BLOCK_SIZE: usize = 16;

fn cipher(hex_key: &str) -> Result<Aes256, SigningError> {
    let key = hex::decode(hex_key).map_err(|e| SigningError::Decrypt(format!("bad key: {e}")))?;
    Aes256::new_from_slice(&key)
        .map_err(|_| SigningError::Decrypt(format!("key must be 32 bytes, got {}", key.len())))
}

/// Encrypt with a random IV and PKCS#7 padding.
pub fn encrypt(plaintext: &[u8], hex_key: &str) -> Result<Vec<u8>, SigningError> {
    let cipher = cipher(hex_key)?;

    let mut iv = [0u8; BLOCK_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut iv);

    let padding_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
    let mut padded = plaintext.to_vec();
    padded.extend(std::iter::repeat_n(padding_len as u8, padding_len));

    let mut out = Vec::with_capacity(BLOCK_SIZE + padded.len());
    out.extend_from_slice(&iv);
    let mut prev = iv;
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(&mut block);
        prev.copy_from_slice(&block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Decrypt `iv || ciphertext` and strip PKCS#7 padding.
pub fn decrypt(data: &[u8], hex_key: &str) -> Result<Vec<u8>, SigningError> {
    let cipher = cipher(hex_key)?;

    if data.len() < BLOCK_SIZE {
        return Err(SigningError::Decrypt("ciphertext too short".into()));
    }
    let (iv, body) = data.split_at(BLOCK_SIZE);
    if body.len() % BLOCK_SIZE != 0 {
        return Err(SigningError::Decrypt(
            "ciphertext is not a multiple of the block size".into(),
        ));
    }

    let mut plaintext = Vec::with_capacity(body.len());
    let mut prev = iv;
    for chunk in body.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        plaintext.extend_from_slice(&block);
        prev = chunk;
    }

    unpad(plaintext)
}

fn unpad(mut data: Vec<u8>) -> Result<Vec<u8>, SigningError> {
    let Some(&last) = data.last() else {
        return Err(SigningError::Decrypt("unpad: input data is empty".into()));
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > data.len() {
        return Err(SigningError::Decrypt("unpad: invalid padding length".into()));
    }
    if !data[data.len() - pad_len..].iter().all(|&b| b == last) {
        return Err(SigningError::Decrypt("unpad: invalid padding".into()));
    }
    data.truncate(data.len() - pad_len);
    Ok(data)
}
