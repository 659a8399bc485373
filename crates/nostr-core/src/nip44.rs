//! NIP-44 v2: versioned encrypted payloads.
//!
//! Key schedule: conversation key = HKDF-SHA256-extract(salt = "nip44-v2",
//! ikm = ECDH x-coordinate); per-message keys = HKDF-expand(conversation
//! key, info = nonce32) into chacha_key(32) || chacha_nonce(12) ||
//! hmac_key(32). The plaintext is length-prefixed, padded to a size class,
//! and encrypted with ChaCha20; the MAC is HMAC-SHA256 over nonce ||
//! ciphertext. Wire form is base64 of `0x02 || nonce32 || ciphertext ||
//! mac32`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::Keys;

const VERSION: u8 = 0x02;
const SALT: &[u8] = b"nip44-v2";
const MIN_PLAINTEXT: usize = 1;
const MAX_PLAINTEXT: usize = 65535;
// version(1) + nonce(32) + min ciphertext(34) + mac(32)
const MIN_PAYLOAD: usize = 99;
// version(1) + nonce(32) + max ciphertext(65538) + mac(32)
const MAX_PAYLOAD: usize = 65603;

#[derive(Debug, Error)]
pub enum Nip44Error {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Shared conversation key between two parties. Symmetric: both sides
/// derive the same 32 bytes.
pub fn conversation_key(
    own: &Keys,
    their_pubkey_hex: &str,
) -> Result<Zeroizing<[u8; 32]>, Nip44Error> {
    let shared = own
        .ecdh_shared_hex(their_pubkey_hex)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    let (prk, _) = Hkdf::<Sha256>::extract(Some(SALT), shared.as_ref());
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&prk);
    Ok(out)
}

struct MessageKeys {
    chacha_key: Zeroizing<[u8; 32]>,
    chacha_nonce: [u8; 12],
    hmac_key: Zeroizing<[u8; 32]>,
}

fn message_keys(conv_key: &[u8; 32], nonce: &[u8; 32]) -> Result<MessageKeys, Nip44Error> {
    let hk = Hkdf::<Sha256>::from_prk(conv_key)
        .map_err(|e| Nip44Error::InvalidKey(e.to_string()))?;
    let mut okm = Zeroizing::new([0u8; 76]);
    hk.expand(nonce, okm.as_mut())
        .map_err(|e| Nip44Error::EncryptionFailed(e.to_string()))?;

    let mut chacha_key = Zeroizing::new([0u8; 32]);
    chacha_key.copy_from_slice(&okm[0..32]);
    let mut chacha_nonce = [0u8; 12];
    chacha_nonce.copy_from_slice(&okm[32..44]);
    let mut hmac_key = Zeroizing::new([0u8; 32]);
    hmac_key.copy_from_slice(&okm[44..76]);

    Ok(MessageKeys {
        chacha_key,
        chacha_nonce,
        hmac_key,
    })
}

/// Padded length for an unpadded plaintext length: 32-byte floor, then
/// chunks of max(32, next_pow2/8).
pub fn calc_padded_len(unpadded: usize) -> usize {
    if unpadded <= 32 {
        return 32;
    }
    let next_pow2 = 1usize << (usize::BITS - (unpadded - 1).leading_zeros());
    let chunk = if next_pow2 <= 256 { 32 } else { next_pow2 / 8 };
    chunk * unpadded.div_ceil(chunk)
}

fn pad(plaintext: &[u8]) -> Result<Zeroizing<Vec<u8>>, Nip44Error> {
    let len = plaintext.len();
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&len) {
        return Err(Nip44Error::EncryptionFailed(format!(
            "plaintext length {len} out of range 1..=65535"
        )));
    }
    let mut padded = Zeroizing::new(vec![0u8; 2 + calc_padded_len(len)]);
    padded[0..2].copy_from_slice(&(len as u16).to_be_bytes());
    padded[2..2 + len].copy_from_slice(plaintext);
    Ok(padded)
}

fn hmac_with_aad(hmac_key: &[u8; 32], aad: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key).expect("hmac accepts any key length");
    mac.update(aad);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Encrypt with an explicit nonce. Exposed for deterministic tests; normal
/// callers use [`encrypt`].
pub fn encrypt_with_nonce(
    conv_key: &[u8; 32],
    nonce: &[u8; 32],
    plaintext: &str,
) -> Result<String, Nip44Error> {
    let keys = message_keys(conv_key, nonce)?;
    let mut buf = pad(plaintext.as_bytes())?;

    let mut cipher = ChaCha20::new((&*keys.chacha_key).into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(buf.as_mut());

    let mac = hmac_with_aad(&keys.hmac_key, nonce, buf.as_ref());

    let mut payload = Vec::with_capacity(1 + 32 + buf.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(buf.as_ref());
    payload.extend_from_slice(&mac);
    Ok(BASE64.encode(payload))
}

/// Encrypt `plaintext` under the conversation key with a fresh nonce.
pub fn encrypt(conv_key: &[u8; 32], plaintext: &str) -> Result<String, Nip44Error> {
    let mut nonce = [0u8; 32];
    rand::rng().fill_bytes(&mut nonce);
    encrypt_with_nonce(conv_key, &nonce, plaintext)
}

/// Decrypt a base64 payload. Version byte and MAC are checked before any
/// decryption; the MAC comparison is constant time.
pub fn decrypt(conv_key: &[u8; 32], payload: &str) -> Result<String, Nip44Error> {
    if payload.starts_with('#') {
        return Err(Nip44Error::DecryptionFailed(
            "unsupported version prefix".to_string(),
        ));
    }
    let data = BASE64
        .decode(payload)
        .map_err(|e| Nip44Error::DecryptionFailed(format!("bad base64: {e}")))?;
    if !(MIN_PAYLOAD..=MAX_PAYLOAD).contains(&data.len()) {
        return Err(Nip44Error::DecryptionFailed(format!(
            "payload length {} out of range",
            data.len()
        )));
    }
    if data[0] != VERSION {
        return Err(Nip44Error::DecryptionFailed(format!(
            "unknown version {}",
            data[0]
        )));
    }

    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&data[1..33]);
    let ciphertext = &data[33..data.len() - 32];
    let mac = &data[data.len() - 32..];

    let keys = message_keys(conv_key, &nonce)?;
    let expected = hmac_with_aad(&keys.hmac_key, &nonce, ciphertext);
    if !bool::from(expected.ct_eq(mac)) {
        return Err(Nip44Error::DecryptionFailed("mac mismatch".to_string()));
    }

    let mut buf = Zeroizing::new(ciphertext.to_vec());
    let mut cipher = ChaCha20::new((&*keys.chacha_key).into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(buf.as_mut());

    if buf.len() < 2 {
        return Err(Nip44Error::DecryptionFailed("truncated padding".to_string()));
    }
    let unpadded_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if !(MIN_PLAINTEXT..=MAX_PLAINTEXT).contains(&unpadded_len)
        || buf.len() != 2 + calc_padded_len(unpadded_len)
    {
        return Err(Nip44Error::DecryptionFailed("invalid padding".to_string()));
    }

    String::from_utf8(buf[2..2 + unpadded_len].to_vec())
        .map_err(|e| Nip44Error::DecryptionFailed(format!("invalid utf-8: {e}")))
}

/// Convenience wrapper: encrypt from `sender` to `recipient_pubkey_hex`.
pub fn encrypt_for(
    sender: &Keys,
    recipient_pubkey_hex: &str,
    plaintext: &str,
) -> Result<String, Nip44Error> {
    let conv_key = conversation_key(sender, recipient_pubkey_hex)?;
    encrypt(&conv_key, plaintext)
}

/// Convenience wrapper: decrypt a payload from `sender_pubkey_hex`.
pub fn decrypt_from(
    recipient: &Keys,
    sender_pubkey_hex: &str,
    payload: &str,
) -> Result<String, Nip44Error> {
    let conv_key = conversation_key(recipient, sender_pubkey_hex)?;
    decrypt(&conv_key, payload)
}
