//! NIP-49: password-encrypted private keys.
//!
//! The password is NFKC-normalized, stretched with scrypt (r=8, p=1), and
//! the key is sealed with XChaCha20-Poly1305 using the key-security byte as
//! associated data. Wire form is bech32 `ncryptsec` over the 91-byte
//! payload `version | log_n | salt16 | nonce24 | ad | ciphertext48`.

use bech32::{Bech32, Hrp};
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use scrypt::{Params, scrypt};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

pub const VERSION: u8 = 0x02;
pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;
/// version(1) + log_n(1) + salt(16) + nonce(24) + ad(1) + ciphertext(32+16)
pub const ENCRYPTED_SIZE: usize = 91;

/// How the plaintext key has been handled, carried as associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySecurity {
    /// Key has been handled insecurely at some point
    Insecure = 0x00,
    /// Key has not been handled insecurely
    Secure = 0x01,
    /// Client does not track this
    Unknown = 0x02,
}

impl KeySecurity {
    pub fn from_byte(b: u8) -> Result<Self, Nip49Error> {
        match b {
            0x00 => Ok(KeySecurity::Insecure),
            0x01 => Ok(KeySecurity::Secure),
            0x02 => Ok(KeySecurity::Unknown),
            _ => Err(Nip49Error::InvalidKeySecurity(b)),
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Error)]
pub enum Nip49Error {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid version: expected 0x02, got {0:#04x}")]
    InvalidVersion(u8),

    #[error("invalid key security byte: {0}")]
    InvalidKeySecurity(u8),

    #[error("invalid log_n: {0}")]
    InvalidLogN(u8),
}

/// NFKC-normalize a password so the same passphrase typed on different
/// systems derives the same key.
pub fn normalize_password(password: &str) -> Zeroizing<String> {
    Zeroizing::new(password.nfkc().collect())
}

/// scrypt key derivation: N = 2^log_n, r = 8, p = 1, 32-byte output.
pub fn derive_key(
    password: &str,
    salt: &[u8; SALT_SIZE],
    log_n: u8,
) -> Result<Zeroizing<[u8; 32]>, Nip49Error> {
    if !(10..=30).contains(&log_n) {
        return Err(Nip49Error::InvalidLogN(log_n));
    }
    let normalized = normalize_password(password);
    let params = Params::new(log_n, 8, 1, 32)
        .map_err(|e| Nip49Error::InvalidFormat(format!("scrypt params: {e}")))?;
    let mut output = Zeroizing::new([0u8; 32]);
    scrypt(normalized.as_bytes(), salt, &params, output.as_mut())
        .map_err(|e| Nip49Error::EncryptionFailed(format!("scrypt: {e}")))?;
    Ok(output)
}

/// Encrypt a 32-byte private key under a password. `log_n` 16..=22 is the
/// sensible interactive range.
pub fn encrypt(
    private_key: &[u8; KEY_SIZE],
    password: &str,
    log_n: u8,
    key_security: KeySecurity,
) -> Result<String, Nip49Error> {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    let symmetric_key = derive_key(password, &salt, log_n)?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let cipher = XChaCha20Poly1305::new((&*symmetric_key).into());
    let ad = [key_security.to_byte()];
    let ciphertext = cipher
        .encrypt(
            &nonce.into(),
            Payload {
                msg: private_key,
                aad: &ad,
            },
        )
        .map_err(|e| Nip49Error::EncryptionFailed(e.to_string()))?;

    let mut output = Vec::with_capacity(ENCRYPTED_SIZE);
    output.push(VERSION);
    output.push(log_n);
    output.extend_from_slice(&salt);
    output.extend_from_slice(&nonce);
    output.push(key_security.to_byte());
    output.extend_from_slice(&ciphertext);

    let hrp = Hrp::parse("ncryptsec").expect("static hrp is valid");
    bech32::encode::<Bech32>(hrp, &output)
        .map_err(|e| Nip49Error::EncryptionFailed(format!("bech32: {e}")))
}

/// Decrypt an `ncryptsec1...` string. Returns the key, the log_n it was
/// sealed with, and the recorded key-security level.
pub fn decrypt(
    encrypted: &str,
    password: &str,
) -> Result<(Zeroizing<[u8; KEY_SIZE]>, u8, KeySecurity), Nip49Error> {
    let (hrp, data) =
        bech32::decode(encrypted).map_err(|e| Nip49Error::InvalidFormat(format!("bech32: {e}")))?;
    if hrp.to_string() != "ncryptsec" {
        return Err(Nip49Error::InvalidFormat(format!(
            "expected ncryptsec hrp, got {hrp}"
        )));
    }
    if data.len() != ENCRYPTED_SIZE {
        return Err(Nip49Error::InvalidFormat(format!(
            "expected {ENCRYPTED_SIZE} bytes, got {}",
            data.len()
        )));
    }

    let version = data[0];
    if version != VERSION {
        return Err(Nip49Error::InvalidVersion(version));
    }
    let log_n = data[1];
    let salt: [u8; SALT_SIZE] = data[2..2 + SALT_SIZE].try_into().expect("sized above");
    let nonce: [u8; NONCE_SIZE] = data[2 + SALT_SIZE..2 + SALT_SIZE + NONCE_SIZE]
        .try_into()
        .expect("sized above");
    let security_byte = data[2 + SALT_SIZE + NONCE_SIZE];
    let ciphertext = &data[2 + SALT_SIZE + NONCE_SIZE + 1..];

    let key_security = KeySecurity::from_byte(security_byte)?;
    let symmetric_key = derive_key(password, &salt, log_n)?;

    let cipher = XChaCha20Poly1305::new((&*symmetric_key).into());
    let ad = [security_byte];
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                &nonce.into(),
                Payload {
                    msg: ciphertext,
                    aad: &ad,
                },
            )
            .map_err(|e| Nip49Error::DecryptionFailed(e.to_string()))?,
    );

    if plaintext.len() != KEY_SIZE {
        return Err(Nip49Error::InvalidFormat(format!(
            "decrypted key is {} bytes",
            plaintext.len()
        )));
    }
    let mut private_key = Zeroizing::new([0u8; KEY_SIZE]);
    private_key.copy_from_slice(&plaintext);
    Ok((private_key, log_n, key_security))
}
