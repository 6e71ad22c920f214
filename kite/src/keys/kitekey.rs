//! The kite key: the long-lived signed identity envelope written once per
//! host. Created by the registration server on first enrollment, consumed
//! on every process start.

use std::env;
use std::path::{Path, PathBuf};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rsa_keys::{decoding_key_from_public_pem, KeyPair};
use crate::error::{KiteError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KiteKeyClaims {
    pub iss: String,
    pub sub: String,
    pub jti: Uuid,
    pub iat: i64,
    #[serde(rename = "kontrolURL")]
    pub kontrol_url: String,
    #[serde(rename = "kontrolKey")]
    pub kontrol_key: String,
}

/// A parsed, still-encoded kite key. `raw` is the JWT exactly as read from
/// disk or issued by the registration server; callers forward it verbatim
/// when dialing Kontrol.
pub struct KiteKey {
    pub raw: String,
    pub claims: KiteKeyClaims,
}

impl KiteKey {
    /// Issue a fresh kite key for `username`, signed by the registry's
    /// private key and embedding its public key as the trust anchor
    /// (`kontrolKey`). Called by the registration server on first
    /// enrollment.
    pub fn issue(
        username: &str,
        kontrol_url: &str,
        registry_keys: &KeyPair,
    ) -> Result<Self> {
        let claims = KiteKeyClaims {
            iss: "kontrol".to_string(),
            sub: username.to_string(),
            jti: Uuid::new_v4(),
            iat: chrono::Utc::now().timestamp(),
            kontrol_url: kontrol_url.to_string(),
            kontrol_key: registry_keys.public_pem.clone(),
        };
        let raw = encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &registry_keys.encoding_key()?,
        )
        .map_err(|e| KiteError::Internal(format!("sign kite key: {e}")))?;
        Ok(Self { raw, claims })
    }

    /// Parse a kite key JWT, verifying it was signed by the key it itself
    /// embeds as `kontrolKey`. This only checks internal self-consistency;
    /// callers compare `claims.kontrol_key` against their own trust anchor
    /// separately via [`KiteKeyClaims::is_trusted`].
    pub fn parse(raw: &str) -> Result<Self> {
        // First pass: decode claims without verifying the signature, purely
        // to recover the embedded public key the signature is supposed to
        // check against.
        let mut insecure = Validation::new(Algorithm::RS256);
        insecure.insecure_disable_signature_validation();
        insecure.validate_exp = false;
        let unverified = decode::<KiteKeyClaims>(raw, &DecodingKey::from_secret(&[]), &insecure)
            .map_err(|e| KiteError::Protocol(format!("malformed kite key: {e}")))?;

        let decoding_key = decoding_key_from_public_pem(&unverified.claims.kontrol_key)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        let decoded = decode::<KiteKeyClaims>(raw, &decoding_key, &validation)
            .map_err(|e| KiteError::KeyNotTrusted(format!("kite key signature: {e}")))?;
        Ok(Self {
            raw: raw.to_string(),
            claims: decoded.claims,
        })
    }

    /// Default path: `$KITE_HOME/kite.key`, falling back to
    /// `$HOME/.kite/kite.key`.
    pub fn default_path() -> PathBuf {
        if let Ok(home) = env::var("KITE_HOME") {
            Path::new(&home).join("kite.key")
        } else {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".kite").join("kite.key")
        }
    }

    /// Write this key to `path`, creating parent directories and setting
    /// permission `0400` (owner read-only) on unix.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KiteError::Internal(format!("create {parent:?}: {e}")))?;
        }
        std::fs::write(path, &self.raw)
            .map_err(|e| KiteError::Internal(format!("write {path:?}: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o400);
            std::fs::set_permissions(path, perms)
                .map_err(|e| KiteError::Internal(format!("chmod {path:?}: {e}")))?;
        }
        Ok(())
    }

    /// Read and parse the kite key from `path` (or [`Self::default_path`]).
    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KiteError::NotFound(format!("kite key at {path:?}: {e}")))?;
        Self::parse(raw.trim())
    }
}

impl KiteKeyClaims {
    /// A kite-key kind is trusted iff its embedded registry public key
    /// matches the caller's locally trusted one.
    pub fn is_trusted(&self, locally_trusted_registry_key: &str) -> bool {
        self.kontrol_key.trim() == locally_trusted_registry_key.trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_parse_round_trips_claims() {
        let registry = KeyPair::generate().unwrap();
        let key = KiteKey::issue("testuser", "ws://host:4000/kontrol", &registry).unwrap();
        let parsed = KiteKey::parse(&key.raw).unwrap();
        assert_eq!(parsed.claims.sub, "testuser");
        assert_eq!(parsed.claims.kontrol_key, registry.public_pem);
    }

    #[test]
    fn write_then_read_from_disk() {
        let registry = KeyPair::generate().unwrap();
        let key = KiteKey::issue("testuser", "ws://host:4000/kontrol", &registry).unwrap();
        let dir = tempfile_dir();
        let path = dir.join("kite.key");
        key.write_to(&path).unwrap();
        let reread = KiteKey::read_from(&path).unwrap();
        assert_eq!(reread.claims.sub, "testuser");
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kite-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
