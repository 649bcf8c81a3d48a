use aes_gcm::aead::{Aead, KeyInit, generic_array::GenericArray};
use aes_gcm::{Aes256Gcm, Nonce};
use scrypt::Params;
use thiserror::Error;

const KEY_LENGTH: usize = 32;
const IV_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Fixed KDF salt; domain-separates this vault from other uses of the
/// process secret.
const KDF_SALT: &[u8] = b"trade-flow/broker-credential-vault";

/// scrypt cost parameters: N=2^14, r=8, p=1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Tag mismatch or corrupted ciphertext. No partial plaintext is ever
    /// returned.
    #[error("decryption failed: authentication tag mismatch")]
    DecryptFailure,

    #[error("malformed vault input: {0}")]
    Malformed(String),
}

/// One encrypted value: ciphertext plus the per-encryption IV and the
/// 16-byte GCM authentication tag, stored as separate columns at rest.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
    pub tag: [u8; TAG_LENGTH],
}

/// Authenticated symmetric encryption for broker API secrets.
///
/// The vault does not distinguish paper from live credentials — callers scope
/// by credential type; here everything is ciphertext.
pub struct Vault {
    key: [u8; KEY_LENGTH],
}

impl Vault {
    /// Derive the AES-256 key from the process secret with scrypt.
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LENGTH)
            .map_err(|e| anyhow::anyhow!("invalid scrypt params: {e}"))?;
        let mut key = [0u8; KEY_LENGTH];
        scrypt::scrypt(secret.as_bytes(), KDF_SALT, &params, &mut key)
            .map_err(|e| anyhow::anyhow!("scrypt failed: {e}"))?;
        Ok(Vault { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> Sealed {
        let key = GenericArray::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);

        use rand::Rng;
        let iv: [u8; IV_LENGTH] = rand::rng().random();
        let nonce = Nonce::from_slice(&iv);

        // Encryption with a fresh random nonce cannot fail for valid key sizes.
        let mut ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("AES-GCM encryption");

        // aes-gcm appends the tag to the ciphertext; split it back out so the
        // storage layer can persist iv/tag as their own columns.
        let tag_start = ciphertext.len() - TAG_LENGTH;
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&ciphertext[tag_start..]);
        ciphertext.truncate(tag_start);

        Sealed {
            ciphertext,
            iv,
            tag,
        }
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<String, VaultError> {
        if iv.len() != IV_LENGTH {
            return Err(VaultError::Malformed(format!(
                "iv must be {IV_LENGTH} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_LENGTH {
            return Err(VaultError::Malformed(format!(
                "auth tag must be {TAG_LENGTH} bytes, got {}",
                tag.len()
            )));
        }

        let key = GenericArray::from_slice(&self.key);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(iv);

        let mut joined = Vec::with_capacity(ciphertext.len() + TAG_LENGTH);
        joined.extend_from_slice(ciphertext);
        joined.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(nonce, joined.as_slice())
            .map_err(|_| VaultError::DecryptFailure)?;

        String::from_utf8(plaintext)
            .map_err(|_| VaultError::Malformed("plaintext is not valid utf8".into()))
    }

    pub fn decrypt_sealed(&self, sealed: &Sealed) -> Result<String, VaultError> {
        self.decrypt(&sealed.ciphertext, &sealed.iv, &sealed.tag)
    }
}
