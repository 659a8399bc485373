//! NIP-04: Encrypted direct messages (legacy).
//!
//! AES-256-CBC with the ECDH shared x-coordinate as the key and a random
//! 16-byte IV, formatted as `"<ciphertext b64>?iv=<iv b64>"`. Superseded by
//! NIP-44 but still required for interop with kind-4 messages.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use thiserror::Error;

use crate::keys::Keys;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum Nip04Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Encrypt `plaintext` from `sender` to the x-only `recipient_pubkey_hex`.
pub fn encrypt(
    sender: &Keys,
    recipient_pubkey_hex: &str,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let shared = sender
        .ecdh_shared_hex(recipient_pubkey_hex)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new((&*shared).into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}?iv={}",
        BASE64.encode(ciphertext),
        BASE64.encode(iv)
    ))
}

/// Decrypt a `"<ct>?iv=<iv>"` payload from `sender_pubkey_hex`.
pub fn decrypt(
    recipient: &Keys,
    sender_pubkey_hex: &str,
    payload: &str,
) -> Result<String, Nip04Error> {
    let (ct_b64, iv_b64) = payload
        .split_once("?iv=")
        .ok_or_else(|| Nip04Error::DecryptionFailed("missing ?iv= separator".to_string()))?;

    let ciphertext = BASE64
        .decode(ct_b64)
        .map_err(|e| Nip04Error::DecryptionFailed(format!("bad ciphertext base64: {e}")))?;
    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|e| Nip04Error::DecryptionFailed(format!("bad iv base64: {e}")))?;
    let iv: [u8; 16] = iv_bytes
        .try_into()
        .map_err(|_| Nip04Error::DecryptionFailed("iv must be 16 bytes".to_string()))?;

    let shared = recipient
        .ecdh_shared_hex(sender_pubkey_hex)
        .map_err(|e| Nip04Error::InvalidKey(e.to_string()))?;

    let plaintext = Aes256CbcDec::new((&*shared).into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::DecryptionFailed("bad padding".to_string()))?;

    String::from_utf8(plaintext)
        .map_err(|e| Nip04Error::DecryptionFailed(format!("invalid utf-8: {e}")))
}
