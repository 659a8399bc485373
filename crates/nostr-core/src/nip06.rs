//! NIP-06: Key derivation from mnemonic seed phrases.
//!
//! BIP-39 turns the mnemonic into a binary seed; BIP-32 derives the path
//! `m/44'/1237'/<account>'/0/0`. Coin type 1237 is the SLIP-0044
//! registration for Nostr.

use bip39::Mnemonic;
use bitcoin::Network;
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::Secp256k1;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::keys::Keys;

const NOSTR_COIN_TYPE: u32 = 1237;

#[derive(Debug, Error)]
pub enum Nip06Error {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),
}

/// Generate a fresh English mnemonic with the given word count
/// (12, 15, 18, 21, or 24).
pub fn generate_mnemonic(word_count: usize) -> Result<Mnemonic, Nip06Error> {
    if !matches!(word_count, 12 | 15 | 18 | 21 | 24) {
        return Err(Nip06Error::InvalidMnemonic(format!(
            "unsupported word count {word_count}"
        )));
    }
    let entropy_len = word_count / 3 * 4;
    let mut entropy = Zeroizing::new(vec![0u8; entropy_len]);
    rand::rng().fill_bytes(entropy.as_mut());
    Mnemonic::from_entropy(&entropy).map_err(|e| Nip06Error::InvalidMnemonic(e.to_string()))
}

/// BIP-39 seed from a mnemonic phrase. The checksum is verified during
/// parsing; NIP-06 uses an empty passphrase.
pub fn mnemonic_to_seed(mnemonic: &str, passphrase: &str) -> Result<Zeroizing<[u8; 64]>, Nip06Error> {
    let mnemonic =
        Mnemonic::parse(mnemonic).map_err(|e| Nip06Error::InvalidMnemonic(e.to_string()))?;
    Ok(Zeroizing::new(mnemonic.to_seed(passphrase)))
}

/// Derive keys at the standard path `m/44'/1237'/0'/0/0`.
pub fn derive_keys(mnemonic: &str) -> Result<Keys, Nip06Error> {
    derive_keys_full(mnemonic, "", 0)
}

/// Derive keys at `m/44'/1237'/<account>'/0/0`.
pub fn derive_keys_with_account(mnemonic: &str, account: u32) -> Result<Keys, Nip06Error> {
    derive_keys_full(mnemonic, "", account)
}

/// Derive keys with a BIP-39 passphrase and an account index.
pub fn derive_keys_full(
    mnemonic: &str,
    passphrase: &str,
    account: u32,
) -> Result<Keys, Nip06Error> {
    let seed = mnemonic_to_seed(mnemonic, passphrase)?;
    derive_keys_from_seed(&seed, account)
}

fn derive_keys_from_seed(seed: &[u8; 64], account: u32) -> Result<Keys, Nip06Error> {
    let secp = Secp256k1::new();

    // Network choice does not affect the derived scalar.
    let master = Xpriv::new_master(Network::Bitcoin, seed)
        .map_err(|e| Nip06Error::KeyDerivation(e.to_string()))?;

    let hardened = |idx: u32| {
        ChildNumber::from_hardened_idx(idx).map_err(|e| Nip06Error::KeyDerivation(e.to_string()))
    };
    let normal = |idx: u32| {
        ChildNumber::from_normal_idx(idx).map_err(|e| Nip06Error::KeyDerivation(e.to_string()))
    };
    let path = DerivationPath::from(vec![
        hardened(44)?,
        hardened(NOSTR_COIN_TYPE)?,
        hardened(account)?,
        normal(0)?,
        normal(0)?,
    ]);

    let derived = master
        .derive_priv(&secp, &path)
        .map_err(|e| Nip06Error::KeyDerivation(e.to_string()))?;

    let secret = Zeroizing::new(derived.private_key.secret_bytes());
    Keys::from_bytes(&secret).map_err(|e| Nip06Error::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// NIP-06 test vector 1.
    #[test]
    fn test_vector_1() {
        let mnemonic =
            "leader monkey parrot ring guide accident before fence cannon height naive bean";
        let keys = derive_keys(mnemonic).unwrap();
        assert_eq!(
            keys.secret_key_hex().as_str(),
            "7f7ff03d123792d6ac594bfa67bf6d0c0ab55b6b1fdb6249303fe861f1ccba9a"
        );
        assert_eq!(
            keys.public_key_hex(),
            "17162c921dc4d2518f9a101db33695df1afb56ab82f5ff3e5da6eec3ca5cd917"
        );
    }

    /// NIP-06 test vector 2.
    #[test]
    fn test_vector_2() {
        let mnemonic = "what bleak badge arrange retreat wolf trade produce cricket blur garlic valid proud rude strong choose busy staff weather area salt hollow arm fade";
        let keys = derive_keys(mnemonic).unwrap();
        assert_eq!(
            keys.secret_key_hex().as_str(),
            "c15d739894c81a2fcfd3a2df85a0d2c0dbc47a280d092799f144d73d7ae78add"
        );
        assert_eq!(
            keys.public_key_hex(),
            "d41b22899549e1f3d335a31002cfd382174006e166d3e658e3a5eecdb6463573"
        );
    }

    /// nostr-tools nip06.test.ts vectors for account and passphrase handling.
    #[test]
    fn test_account_and_passphrase_vectors() {
        let mnemonic = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";
        assert_eq!(
            derive_keys(mnemonic).unwrap().secret_key_hex().as_str(),
            "c26cf31d8ba425b555ca27d00ca71b5008004f2f662470f8c8131822ec129fe2"
        );
        assert_eq!(
            derive_keys_with_account(mnemonic, 1)
                .unwrap()
                .secret_key_hex()
                .as_str(),
            "b5fc7f229de3fb5c189063e3b3fc6c921d8f4366cff5bd31c6f063493665eb2b"
        );
        assert_eq!(
            derive_keys_full(mnemonic, "123", 0)
                .unwrap()
                .secret_key_hex()
                .as_str(),
            "55a22b8203273d0aaf24c22c8fbe99608e70c524b17265641074281c8b978ae4"
        );
        let account1 = derive_keys_full(mnemonic, "123", 1).unwrap();
        assert_eq!(
            account1.secret_key_hex().as_str(),
            "2e0f7bd9e3c3ebcdff1a90fb49c913477e7c055eba1a415d571b6a8c714c7135"
        );
        assert_eq!(
            account1.public_key_hex(),
            "13f55f4f01576570ea342eb7d2b611f9dc78f8dc601aeb512011e4e73b90cf0a"
        );
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        let result = derive_keys("invalid mnemonic words that are not valid");
        assert!(matches!(result, Err(Nip06Error::InvalidMnemonic(_))));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        // Valid words, broken checksum.
        let result = derive_keys(
            "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let mnemonic =
            "leader monkey parrot ring guide accident before fence cannon height naive bean";
        let a = derive_keys(mnemonic).unwrap();
        let b = derive_keys(mnemonic).unwrap();
        assert_eq!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn test_accounts_differ() {
        let mnemonic =
            "leader monkey parrot ring guide accident before fence cannon height naive bean";
        let a = derive_keys_with_account(mnemonic, 0).unwrap();
        let b = derive_keys_with_account(mnemonic, 1).unwrap();
        assert_ne!(a.public_key_hex(), b.public_key_hex());
    }

    #[test]
    fn test_generate_mnemonic_word_counts() {
        for count in [12, 15, 18, 21, 24] {
            let mnemonic = generate_mnemonic(count).unwrap();
            assert_eq!(mnemonic.word_count(), count);
            // Generated phrase must parse back and derive.
            assert!(derive_keys(&mnemonic.to_string()).is_ok());
        }
        assert!(generate_mnemonic(13).is_err());
    }
}
