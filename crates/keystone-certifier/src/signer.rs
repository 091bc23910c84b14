//! Fact signing: HMAC-SHA256 signatures and SHA-256 chain hashes.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use keystone_core::config::CertifierConfig;
use keystone_core::{Error, Result};
use ring::rand::{SecureRandom, SystemRandom};
use ring::{digest, hmac};
use std::path::Path;
use tracing::info;

/// Environment variable consulted when the config carries no key.
pub const SIGNING_KEY_ENV: &str = "KEYSTONE_SIGNING_KEY";
const KEY_FILE: &str = "signing.key";

pub struct FactSigner {
    key: hmac::Key,
}

impl FactSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let secret = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("signing key is not valid base64: {}", e)))?;
        if secret.is_empty() {
            return Err(Error::Config("signing key is empty".into()));
        }
        Ok(Self::new(&secret))
    }

    /// Resolve the signing key: config, then `KEYSTONE_SIGNING_KEY`, then
    /// `<data_dir>/signing.key`, generating that file on first use.
    pub async fn load(config: &CertifierConfig, data_dir: &Path) -> Result<Self> {
        if let Some(key) = &config.signing_key {
            return Self::from_base64(key);
        }
        if let Ok(key) = std::env::var(SIGNING_KEY_ENV) {
            return Self::from_base64(&key);
        }

        let path = data_dir.join(KEY_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(encoded) => Self::from_base64(&encoded),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut secret = [0u8; 32];
                SystemRandom::new()
                    .fill(&mut secret)
                    .map_err(|_| Error::Internal("system randomness unavailable".into()))?;
                tokio::fs::create_dir_all(data_dir).await?;
                tokio::fs::write(&path, BASE64.encode(secret)).await?;
                info!(path = %path.display(), "generated fact signing key");
                Ok(Self::new(&secret))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Base64 HMAC-SHA256 over `message`.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(hmac::sign(&self.key, message).as_ref())
    }

    pub fn verify(&self, message: &[u8], signature: &str) -> bool {
        match BASE64.decode(signature) {
            Ok(tag) => hmac::verify(&self.key, message, &tag).is_ok(),
            Err(_) => false,
        }
    }

    /// Chain hash: hex SHA-256 over the canonical bytes followed by the signature.
    pub fn chain_hash(canonical: &[u8], signature: &str) -> String {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(canonical);
        ctx.update(signature.as_bytes());
        hex::encode(ctx.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = FactSigner::new(b"secret");
        let sig = signer.sign(b"payload");
        assert!(signer.verify(b"payload", &sig));
        assert!(!signer.verify(b"payload!", &sig));
        assert!(!FactSigner::new(b"other").verify(b"payload", &sig));
        assert!(!signer.verify(b"payload", "not base64 ~"));
    }

    #[test]
    fn chain_hash_is_hex_sha256() {
        let h = FactSigner::chain_hash(b"abc", "");
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(FactSigner::chain_hash(b"abc", "x"), h);
    }

    #[test]
    fn rejects_bad_base64_key() {
        assert!(FactSigner::from_base64("***").is_err());
        assert!(FactSigner::from_base64("").is_err());
    }

    #[tokio::test]
    async fn generated_key_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = CertifierConfig {
            signing_key: Some(BASE64.encode(b"configured")),
            ..Default::default()
        };
        let configured = FactSigner::load(&config, dir.path()).await.unwrap();
        assert!(FactSigner::new(b"configured").verify(b"m", &configured.sign(b"m")));

        let generated = dir.path().join("keys");
        let first = FactSigner::load(&CertifierConfig::default(), &generated).await;
        // The environment may carry a key; only assert file reuse when it does not.
        if std::env::var(SIGNING_KEY_ENV).is_err() {
            let first = first.unwrap();
            let second = FactSigner::load(&CertifierConfig::default(), &generated)
                .await
                .unwrap();
            assert!(second.verify(b"m", &first.sign(b"m")));
            assert!(generated.join("signing.key").exists());
        }
    }
}
