use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::{future::Future, sync::Arc, time::Duration};

use crate::{config::Config, error::LedgerError, utils::kms::TransitBackend};

type HmacSha256 = Hmac<Sha256>;

pub const TAG_SEPARATOR: char = '.';
/// Hex length of an HMAC-SHA256 tag.
const TAG_HEX_LENGTH: usize = 64;

/// Wraps transit ciphertexts as `<ciphertext>.<hex hmac-sha256 tag>`.
///
/// Values without a tag-shaped suffix are treated as legacy ciphertexts
/// and handed to the backend untouched.
#[derive(Clone)]
pub struct EnvelopeEncryptor {
    backend: Arc<dyn TransitBackend>,
    integrity_key: Arc<[u8]>,
    timeout: Duration,
}

impl EnvelopeEncryptor {
    pub fn new(backend: Arc<dyn TransitBackend>, integrity_key: &str, timeout: Duration) -> Self {
        Self {
            backend,
            integrity_key: Arc::from(integrity_key.as_bytes()),
            timeout,
        }
    }

    pub fn from_config(config: &Config, backend: Arc<dyn TransitBackend>) -> Self {
        Self::new(
            backend,
            &config.envelope_integrity_key,
            config.encryptor_timeout(),
        )
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String, LedgerError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let ciphertext = self
            .with_timeout("encrypt", self.backend.encrypt(plaintext.as_bytes()))
            .await?;
        let tag = hex::encode(self.mac(&ciphertext)?.finalize().into_bytes());
        Ok(format!("{}{}{}", ciphertext, TAG_SEPARATOR, tag))
    }

    pub async fn decrypt(&self, envelope: &str) -> Result<String, LedgerError> {
        if envelope.is_empty() {
            return Ok(String::new());
        }
        let ciphertext = self.verified_ciphertext(envelope)?;
        let plaintext = self
            .with_timeout("decrypt", self.backend.decrypt(ciphertext))
            .await?;
        String::from_utf8(plaintext)
            .map_err(|_| LedgerError::Integrity("decrypted value is not UTF-8".to_string()))
    }

    /// Serializes a JSON snapshot and encrypts it.
    pub async fn encrypt_json(&self, value: &Value) -> Result<String, LedgerError> {
        let serialized = serde_json::to_string(value)
            .map_err(|e| LedgerError::Validation(format!("unserializable snapshot: {}", e)))?;
        self.encrypt(&serialized).await
    }

    /// Decrypts a JSON snapshot. Plaintext that is not JSON comes back as a
    /// string value.
    pub async fn decrypt_json(&self, envelope: &str) -> Result<Value, LedgerError> {
        let plaintext = self.decrypt(envelope).await?;
        Ok(serde_json::from_str(&plaintext).unwrap_or(Value::String(plaintext)))
    }

    /// Checks the tag, if there is one, and returns the ciphertext portion.
    /// Nothing reaches the backend unless this succeeds.
    fn verified_ciphertext<'a>(&self, envelope: &'a str) -> Result<&'a str, LedgerError> {
        let Some((ciphertext, suffix)) = envelope.rsplit_once(TAG_SEPARATOR) else {
            return Ok(envelope);
        };
        if suffix.len() != TAG_HEX_LENGTH {
            return Ok(envelope);
        }
        if !suffix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(LedgerError::Integrity(
                "envelope tag is not lowercase hex".to_string(),
            ));
        }
        let tag = hex::decode(suffix)
            .map_err(|_| LedgerError::Integrity("envelope tag is not hex".to_string()))?;
        self.mac(ciphertext)?
            .verify_slice(&tag)
            .map_err(|_| LedgerError::Integrity("envelope tag mismatch".to_string()))?;
        if ciphertext.is_empty() {
            return Err(LedgerError::Integrity("envelope has no ciphertext".to_string()));
        }
        Ok(ciphertext)
    }

    fn mac(&self, ciphertext: &str) -> Result<HmacSha256, LedgerError> {
        let mut mac = HmacSha256::new_from_slice(&self.integrity_key)
            .map_err(|_| LedgerError::Integrity("invalid integrity key".to_string()))?;
        mac.update(ciphertext.as_bytes());
        Ok(mac)
    }

    async fn with_timeout<T, F>(&self, operation: &str, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Transient(format!(
                "transit {} timed out after {}ms",
                operation,
                self.timeout.as_millis()
            ))),
        }
    }
}
