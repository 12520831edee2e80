// Ed25519 request signing for the custodial API
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Holds the API secret. Built once at startup and shared by reference.
pub struct CoboSigner {
    signing_key: SigningKey,
}

impl CoboSigner {
    /// Build from a hex-encoded 32-byte Ed25519 secret
    pub fn from_hex(secret: &str) -> AppResult<Self> {
        let bytes = hex::decode(secret.trim())
            .map_err(|_| AppError::Config("API secret is not valid hex".to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AppError::Config("API secret must be 32 bytes".to_string()))?;

        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// API key sent with every request: the hex public key
    pub fn api_key(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Canonical string signed for a request
    pub fn string_to_sign(method: &str, path: &str, nonce: i64, query: &str, body: &str) -> String {
        format!("{}|{}|{}|{}|{}", method, path, nonce, query, body)
    }

    /// Hex signature over sha256(sha256(string_to_sign))
    pub fn sign(&self, method: &str, path: &str, nonce: i64, query: &str, body: &str) -> String {
        let message = Self::string_to_sign(method, path, nonce, query, body);
        let digest = Sha256::digest(Sha256::digest(message.as_bytes()));
        hex::encode(self.signing_key.sign(&digest).to_bytes())
    }
}
