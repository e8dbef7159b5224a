use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use aws_sdk_kms::{error::DisplayErrorContext, primitives::Blob};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::{
    config::{Config, TransitBackendKind},
    error::LedgerError,
};

const NONCE_LENGTH: usize = 12;
const LOCAL_PREFIX: &str = "local:v1:";
const KMS_PREFIX: &str = "kms:v1:";

/// A remote service that encrypts and decrypts without handing out key
/// material. Ciphertexts are self-describing strings that never contain `.`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransitBackend: Send + Sync {
    fn backend_id(&self) -> &'static str;
    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, LedgerError>;
    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, LedgerError>;
}

pub async fn transit_backend_from_config(
    config: &Config,
) -> anyhow::Result<Arc<dyn TransitBackend>> {
    let backend: Arc<dyn TransitBackend> = match config.transit_backend {
        TransitBackendKind::Kms => Arc::new(KmsTransitBackend::connect(config).await),
        TransitBackendKind::Local => Arc::new(LocalTransitBackend::new(&config.local_transit_key)),
    };
    tracing::info!(backend = backend.backend_id(), "Transit backend configured");
    Ok(backend)
}

/// AWS KMS Encrypt/Decrypt. The key never leaves KMS.
pub struct KmsTransitBackend {
    client: aws_sdk_kms::Client,
    key_id: String,
}

impl KmsTransitBackend {
    pub async fn connect(config: &Config) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.aws_region.clone()))
            .load()
            .await;
        Self {
            client: aws_sdk_kms::Client::new(&shared),
            key_id: config.kms_key_id.clone(),
        }
    }
}

#[async_trait]
impl TransitBackend for KmsTransitBackend {
    fn backend_id(&self) -> &'static str {
        "kms"
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, LedgerError> {
        let output = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext))
            .send()
            .await
            .map_err(|err| {
                LedgerError::Transient(format!("kms encrypt failed: {}", DisplayErrorContext(&err)))
            })?;
        let blob = output
            .ciphertext_blob()
            .ok_or_else(|| LedgerError::Transient("kms returned no ciphertext".to_string()))?;
        Ok(format!("{}{}", KMS_PREFIX, STANDARD_NO_PAD.encode(blob.as_ref())))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, LedgerError> {
        let encoded = ciphertext.strip_prefix(KMS_PREFIX).ok_or_else(|| {
            LedgerError::Integrity("ciphertext is not a kms:v1 value".to_string())
        })?;
        let blob = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|_| LedgerError::Integrity("invalid kms ciphertext encoding".to_string()))?;

        let output = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .ciphertext_blob(Blob::new(blob))
            .send()
            .await
            .map_err(|err| match err.as_service_error() {
                Some(service)
                    if service.is_invalid_ciphertext_exception()
                        || service.is_incorrect_key_exception() =>
                {
                    LedgerError::Integrity(format!(
                        "kms rejected ciphertext: {}",
                        DisplayErrorContext(&err)
                    ))
                }
                _ => LedgerError::Transient(format!(
                    "kms decrypt failed: {}",
                    DisplayErrorContext(&err)
                )),
            })?;
        output
            .plaintext()
            .map(|blob| blob.as_ref().to_vec())
            .ok_or_else(|| LedgerError::Transient("kms returned no plaintext".to_string()))
    }
}

/// AES-256-GCM under a key derived from `LOCAL_TRANSIT_KEY`. For local runs
/// and tests only.
pub struct LocalTransitBackend {
    key: [u8; 32],
}

impl LocalTransitBackend {
    pub fn new(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"audit-ledger-transit|");
        hasher.update(secret.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, LedgerError> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| LedgerError::Transient("invalid local transit key".to_string()))
    }
}

#[async_trait]
impl TransitBackend for LocalTransitBackend {
    fn backend_id(&self) -> &'static str {
        "local"
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<String, LedgerError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| LedgerError::Transient("local encryption failed".to_string()))?;
        Ok(format!(
            "{}{}:{}",
            LOCAL_PREFIX,
            STANDARD_NO_PAD.encode(nonce),
            STANDARD_NO_PAD.encode(ciphertext)
        ))
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, LedgerError> {
        let malformed = || LedgerError::Integrity("malformed local ciphertext".to_string());
        let body = ciphertext.strip_prefix(LOCAL_PREFIX).ok_or_else(malformed)?;
        let (nonce_part, cipher_part) = body.split_once(':').ok_or_else(malformed)?;
        let nonce = STANDARD_NO_PAD.decode(nonce_part).map_err(|_| malformed())?;
        if nonce.len() != NONCE_LENGTH {
            return Err(malformed());
        }
        let sealed = STANDARD_NO_PAD.decode(cipher_part).map_err(|_| malformed())?;
        self.cipher()?
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| LedgerError::Integrity("local ciphertext failed authentication".to_string()))
    }
}
