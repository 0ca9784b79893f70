// Cryptographic utilities for ZipCase

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// AES-256-GCM envelope for secrets persisted at rest. Ciphertexts are
/// base64(nonce || ciphertext) so each value carries its own nonce.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn from_base64_key(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .context("encryption key is not valid base64")?;
        if bytes.len() != 32 {
            return Err(anyhow!(
                "encryption key must be 32 bytes, got {}",
                bytes.len()
            ));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64
            .decode(encoded)
            .context("stored secret is not valid base64")?;
        if combined.len() <= NONCE_LEN {
            return Err(anyhow!("stored secret is too short"));
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed"))?;
        String::from_utf8(plaintext).context("decrypted secret is not UTF-8")
    }
}

/// Calculate SHA-256 hash of a string, hex-encoded
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_box() -> SecretBox {
        let key = BASE64.encode([7u8; 32]);
        SecretBox::from_base64_key(&key).unwrap()
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secrets = test_box();
        let ciphertext = secrets.encrypt("portal-password-123").unwrap();
        assert_ne!(ciphertext, "portal-password-123");
        assert_eq!(secrets.decrypt(&ciphertext).unwrap(), "portal-password-123");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let secrets = test_box();
        let first = secrets.encrypt("same input").unwrap();
        let second = secrets.encrypt("same input").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let secrets = test_box();
        let ciphertext = secrets.encrypt("secret").unwrap();
        let mut bytes = BASE64.decode(&ciphertext).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(secrets.decrypt(&BASE64.encode(bytes)).is_err());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(SecretBox::from_base64_key("not base64 !!!").is_err());
        assert!(SecretBox::from_base64_key(&BASE64.encode([1u8; 16])).is_err());
    }

    #[test]
    fn sha256_calculation() {
        assert_eq!(
            sha256_hex("Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }
}
