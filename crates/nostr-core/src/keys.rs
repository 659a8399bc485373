//! Key handling: secp256k1 keypairs, BIP-340 Schnorr signing and
//! verification, and ECDH shared secrets. Private key bytes live in a
//! [`SecretBuffer`] and never leave this module by value.

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{
    Keypair, Message, Parity, PublicKey, SecretKey, XOnlyPublicKey, ecdh, schnorr,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::secure::SecretBuffer;

/// Errors from key parsing and signing.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signing failed: {0}")]
    SignatureFailed(String),
}

/// A secp256k1 keypair. The secret scalar is held in a wipe-on-drop buffer;
/// signing and ECDH reconstruct the library key type per operation.
pub struct Keys {
    secret: SecretBuffer,
    public: XOnlyPublicKey,
    public_hex: String,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_hex", &self.public_hex)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl Keys {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        loop {
            rand::rng().fill_bytes(bytes.as_mut());
            if let Ok(keys) = Self::from_bytes(&bytes) {
                return keys;
            }
        }
    }

    /// Build from a 32-byte secret scalar. Fails with `InvalidKey` for
    /// zero or out-of-range scalars.
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self, KeyError> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(secret).map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let (xonly, _parity) = sk.x_only_public_key(&secp);
        Ok(Keys {
            secret: SecretBuffer::from_slice(secret),
            public: xonly,
            public_hex: hex::encode(xonly.serialize()),
        })
    }

    /// Build from a 64-char hex secret key.
    pub fn from_hex(secret_hex: &str) -> Result<Self, KeyError> {
        if secret_hex.len() != 64 {
            return Err(KeyError::InvalidKey(format!(
                "expected 64 hex chars, got {}",
                secret_hex.len()
            )));
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(secret_hex, bytes.as_mut())
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// X-only public key, lowercase hex.
    pub fn public_key_hex(&self) -> String {
        self.public_hex.clone()
    }

    /// X-only public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.serialize()
    }

    /// Secret key as hex, in a wiping wrapper. Intended for export paths
    /// (NIP-19 nsec, NIP-49) only.
    pub fn secret_key_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret.as_slice()))
    }

    /// Copy the secret scalar into a caller-provided wiping buffer.
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(self.secret.as_slice());
        out
    }

    fn secret_key(&self) -> Result<SecretKey, KeyError> {
        SecretKey::from_slice(self.secret.as_slice())
            .map_err(|e| KeyError::InvalidKey(e.to_string()))
    }

    /// BIP-340 Schnorr signature over a 32-byte message, with 32 bytes of
    /// fresh auxiliary randomness per signature.
    pub fn sign_schnorr(&self, msg: &[u8; 32]) -> Result<[u8; 64], KeyError> {
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(msg)
            .map_err(|e| KeyError::SignatureFailed(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &self.secret_key()?);
        let mut aux = [0u8; 32];
        rand::rng().fill_bytes(&mut aux);
        let sig = secp.sign_schnorr_with_aux_rand(&message, &keypair, &aux);
        Ok(sig.serialize())
    }

    /// ECDH shared secret with an x-only counterparty key: the
    /// x-coordinate of the shared point. Even parity is assumed for the
    /// counterparty, per the NIP-04/NIP-44 convention.
    pub fn ecdh_shared(&self, their_xonly: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let xonly = XOnlyPublicKey::from_slice(their_xonly)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);
        let point = ecdh::shared_secret_point(&full, &self.secret_key()?);
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&point[..32]);
        Ok(out)
    }

    /// ECDH with a hex-encoded counterparty key.
    pub fn ecdh_shared_hex(&self, their_hex: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let mut pk = [0u8; 32];
        hex::decode_to_slice(their_hex, &mut pk)
            .map_err(|e| KeyError::InvalidKey(e.to_string()))?;
        self.ecdh_shared(&pk)
    }
}

/// Verify a BIP-340 Schnorr signature. Malformed inputs verify as false.
pub fn schnorr_verify(msg: &[u8; 32], xonly_pubkey: &[u8; 32], sig: &[u8; 64]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(message) = Message::from_digest_slice(msg) else {
        return false;
    };
    let Ok(pubkey) = XOnlyPublicKey::from_slice(xonly_pubkey) else {
        return false;
    };
    let Ok(signature) = schnorr::Signature::from_slice(sig) else {
        return false;
    };
    secp.verify_schnorr(&signature, &message, &pubkey).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_parse_round_trip() {
        let keys = Keys::generate();
        let hex = keys.secret_key_hex();
        let restored = Keys::from_hex(&hex).unwrap();
        assert_eq!(keys.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(Keys::from_hex("deadbeef").is_err());
        assert!(Keys::from_hex(&"zz".repeat(32)).is_err());
        // Zero scalar is out of range.
        assert!(Keys::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = Keys::generate();
        let msg = [7u8; 32];
        let sig = keys.sign_schnorr(&msg).unwrap();
        assert!(schnorr_verify(&msg, &keys.public_key_bytes(), &sig));

        let mut bad = sig;
        bad[0] ^= 1;
        assert!(!schnorr_verify(&msg, &keys.public_key_bytes(), &bad));
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let ab = alice.ecdh_shared(&bob.public_key_bytes()).unwrap();
        let ba = bob.ecdh_shared(&alice.public_key_bytes()).unwrap();
        assert_eq!(ab.as_slice(), ba.as_slice());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keys = Keys::generate();
        let debug = format!("{:?}", keys);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(keys.secret_key_hex().as_str()));
    }
}
