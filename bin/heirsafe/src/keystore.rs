use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use eyre::{bail, eyre, WrapErr};
use rand::RngCore;
use scrypt::{scrypt, Params as ScryptParams};
use serde::{Deserialize, Serialize};
use std::path::Path;

const KEYSTORE_VERSION: u32 = 1;
const DEFAULT_LOG_N: u8 = 13;

fn default_version() -> u32 {
    KEYSTORE_VERSION
}

/// Password-encrypted signing key for the account owner.
///
/// scrypt derives an AES-256-GCM key from the password. The owner address is
/// stored in clear so the account can be shown before the password is
/// entered, and is checked against the decrypted key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keystore {
    #[serde(default = "default_version")]
    pub version: u32,
    pub address: Address,
    /// Hex, 32 bytes.
    pub salt: String,
    /// Hex, 12 bytes.
    pub nonce: String,
    /// Hex, key plus GCM tag.
    pub ciphertext: String,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
}

fn derive_key(password: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> eyre::Result<[u8; 32]> {
    let params = ScryptParams::new(log_n, r, p, 32).map_err(|e| eyre!("scrypt params: {e}"))?;
    let mut key = [0u8; 32];
    scrypt(password.as_bytes(), salt, &params, &mut key).map_err(|e| eyre!("scrypt: {e}"))?;
    Ok(key)
}

impl Keystore {
    pub fn encrypt(secret: &B256, password: &str) -> eyre::Result<Self> {
        Self::encrypt_with_cost(secret, password, DEFAULT_LOG_N)
    }

    fn encrypt_with_cost(secret: &B256, password: &str, scrypt_log_n: u8) -> eyre::Result<Self> {
        let address = PrivateKeySigner::from_bytes(secret)
            .wrap_err("not a valid secp256k1 key")?
            .address();

        let mut salt = [0u8; 32];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let (scrypt_r, scrypt_p) = (8, 1);
        let key = derive_key(password, &salt, scrypt_log_n, scrypt_r, scrypt_p)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| eyre!("aes init: {e}"))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_slice())
            .map_err(|e| eyre!("aes encrypt: {e}"))?;

        Ok(Self {
            version: KEYSTORE_VERSION,
            address,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
            scrypt_log_n,
            scrypt_r,
            scrypt_p,
        })
    }

    /// Recovers the signer. Fails on a wrong password or when the key does
    /// not belong to the recorded address.
    pub fn decrypt(&self, password: &str) -> eyre::Result<PrivateKeySigner> {
        if self.version != KEYSTORE_VERSION {
            bail!("unsupported keystore version {}", self.version);
        }
        let salt = hex::decode(&self.salt).wrap_err("invalid salt hex")?;
        let nonce_bytes = hex::decode(&self.nonce).wrap_err("invalid nonce hex")?;
        let ciphertext = hex::decode(&self.ciphertext).wrap_err("invalid ciphertext hex")?;
        if nonce_bytes.len() != 12 {
            bail!("nonce is {} bytes, expected 12", nonce_bytes.len());
        }

        let key = derive_key(password, &salt, self.scrypt_log_n, self.scrypt_r, self.scrypt_p)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| eyre!("aes init: {e}"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| eyre!("decryption failed: wrong password or corrupted keystore"))?;

        let secret = B256::try_from(plaintext.as_slice())
            .map_err(|_| eyre!("decrypted key is {} bytes, expected 32", plaintext.len()))?;
        let signer = PrivateKeySigner::from_bytes(&secret).wrap_err("decrypted key is invalid")?;
        if signer.address() != self.address {
            bail!("keystore key belongs to {}, file says {}", signer.address(), self.address);
        }
        Ok(signer)
    }

    pub fn save(&self, path: &Path) -> eyre::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json).wrap_err_with(|| format!("write keystore {}", path.display()))
    }

    pub fn load(path: &Path) -> eyre::Result<Self> {
        let json = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("read keystore {}", path.display()))?;
        serde_json::from_str(&json).wrap_err_with(|| format!("parse keystore {}", path.display()))
    }
}
