//! File based keyring: one JSON file per key under `<home>/keys/<chain_id>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use k256::ecdsa::{signature::Signer, Signature, SigningKey};
use serde::{Deserialize, Serialize};

/// The on-disk representation of a key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFile {
    /// Name of the key.
    pub name: String,
    /// Bech32 account address of the key.
    pub address: String,
    /// Hex encoded secp256k1 secret key.
    pub private_key: String,
}

/// A secp256k1 key able to sign Cosmos SDK transactions.
pub struct Secp256k1Key {
    address: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for Secp256k1Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secp256k1Key")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Secp256k1Key {
    /// Build a key from its account address and hex encoded secret.
    ///
    /// # Errors
    /// Returns an error if the secret is not a valid secp256k1 scalar.
    pub fn from_hex(address: impl Into<String>, private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .context("private key is not valid hex")?;
        let signing_key =
            SigningKey::from_slice(&bytes).context("private key is not a valid secp256k1 key")?;
        Ok(Self {
            address: address.into(),
            signing_key,
        })
    }

    /// The account address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The compressed public key.
    #[must_use]
    pub fn public_key(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    /// Sign `message` with ECDSA over its SHA-256 digest, returning the 64 byte signature.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(message);
        signature.to_bytes().to_vec()
    }
}

/// The keys of one chain.
#[derive(Clone, Debug)]
pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    /// The keyring of `chain_id` under `keys_dir`.
    #[must_use]
    pub fn new(keys_dir: impl AsRef<Path>, chain_id: &str) -> Self {
        Self {
            dir: keys_dir.as_ref().join(chain_id),
        }
    }

    /// Location of the key file of `key_name`.
    #[must_use]
    pub fn key_path(&self, key_name: &str) -> PathBuf {
        self.dir.join(format!("{key_name}.json"))
    }

    /// Whether the key file of `key_name` exists.
    #[must_use]
    pub fn exists(&self, key_name: &str) -> bool {
        self.key_path(key_name).is_file()
    }

    /// Load the key named `key_name`.
    ///
    /// # Errors
    /// Returns an error if the key file is missing or malformed.
    pub fn load(&self, key_name: &str) -> Result<Secp256k1Key> {
        let path = self.key_path(key_name);
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        let key_file: KeyFile = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse key file {}", path.display()))?;

        if key_file.name != key_name {
            anyhow::bail!(
                "key file {} holds key {:?}, expected {key_name:?}",
                path.display(),
                key_file.name
            );
        }

        Secp256k1Key::from_hex(key_file.address, &key_file.private_key)
    }
}
