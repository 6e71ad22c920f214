//! Access tokens and tunnel tokens plus the verification protocol run on
//! every inbound RPC.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rsa_keys::{decoding_key_from_public_pem, KeyPair};
use crate::error::{KiteError, Result};

/// `iss, sub, aud (kite path), iat, exp, nbf, jti`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
    pub jti: Uuid,
}

/// `sub (kite id), seq, iat, exp, nbf`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelTokenClaims {
    pub sub: String,
    pub seq: u64,
    pub iat: i64,
    pub exp: i64,
    pub nbf: i64,
}

const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;
const TOKEN_LEEWAY_SECS: i64 = 60;
const TUNNEL_TOKEN_TTL_SECS: i64 = 3600;
const TUNNEL_TOKEN_LEEWAY_SECS: i64 = 60;

/// Mint an access token for `caller` to call `callee_path`.
/// `exp = now + ttl`, `nbf = now - 60s` leeway.
pub fn mint_access_token(
    caller_username: &str,
    callee_path: &str,
    signing_keys: &KeyPair,
    ttl: Option<Duration>,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let ttl_secs = ttl.map(|d| d.as_secs() as i64).unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    let claims = AccessTokenClaims {
        iss: "kontrol".to_string(),
        sub: caller_username.to_string(),
        aud: callee_path.to_string(),
        iat: now,
        exp: now + ttl_secs,
        nbf: now - TOKEN_LEEWAY_SECS,
        jti: Uuid::new_v4(),
    };
    encode(&Header::new(Algorithm::RS256), &claims, &signing_keys.encoding_key()?)
        .map_err(|e| KiteError::Internal(format!("sign token: {e}")))
}

pub fn mint_tunnel_token(private_kite_id: &str, seq: u64, signing_keys: &KeyPair) -> Result<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = TunnelTokenClaims {
        sub: private_kite_id.to_string(),
        seq,
        iat: now,
        exp: now + TUNNEL_TOKEN_TTL_SECS,
        nbf: now - TUNNEL_TOKEN_LEEWAY_SECS,
    };
    encode(&Header::new(Algorithm::RS256), &claims, &signing_keys.encoding_key()?)
        .map_err(|e| KiteError::Internal(format!("sign tunnel token: {e}")))
}

/// Decode+verify a token signature against `registry_public_pem`, and check
/// `exp`/`nbf`: a token issued for audience A is accepted by A for
/// `t <= now < exp` and rejected otherwise.
pub fn verify_access_token(token: &str, registry_public_pem: &str) -> Result<AccessTokenClaims> {
    let decoding_key = decoding_key_from_public_pem(registry_public_pem)?;
    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_required_spec_claims(&["exp", "nbf", "sub", "aud"]);
    validation.validate_nbf = true;
    let data = decode::<AccessTokenClaims>(token, &decoding_key, &validation)
        .map_err(|e| KiteError::Auth(format!("token invalid: {e}")))?;
    Ok(data.claims)
}

pub fn verify_tunnel_token(token: &str, registry_public_pem: &str) -> Result<TunnelTokenClaims> {
    let decoding_key = decoding_key_from_public_pem(registry_public_pem)?;
    let mut validation = Validation::new(Algorithm::RS256);
    validation.required_spec_claims.clear();
    validation.validate_nbf = true;
    validation.validate_exp = true;
    let data = decode::<TunnelTokenClaims>(token, &decoding_key, &validation)
        .map_err(|e| KiteError::Auth(format!("tunnel token invalid: {e}")))?;
    Ok(data.claims)
}

/// Default policy: the audience must equal the callee's canonical path or
/// any of its path-segment prefixes (`/alice/dev/app` matches
/// `/alice/dev/app/1.0.0/...` but not `/alice/dev/app2/...`), the same
/// segment-wise comparison `Query::matches` uses over path fields.
pub fn audience_matches(aud: &str, local_path: &str) -> bool {
    let aud_segments: Vec<&str> = aud.split('/').filter(|s| !s.is_empty()).collect();
    let local_segments: Vec<&str> = local_path.split('/').filter(|s| !s.is_empty()).collect();
    if aud_segments.len() > local_segments.len() {
        return false;
    }
    aud_segments.iter().zip(local_segments.iter()).all(|(a, l)| a == l)
}

/// Asks Kontrol for a username's current signing public key. Implemented by
/// the Kontrol client; split out as a trait so the verifier can be unit
/// tested without a live connection.
#[async_trait]
pub trait KeyLookup: Send + Sync {
    async fn public_key_for(&self, username: &str) -> Result<String>;
}

/// Verifies access tokens, asking Kontrol for the caller's public key and
/// caching the answer for a TTL. A TTL of zero or less disables caching
/// entirely.
pub struct CachingVerifier<L: KeyLookup> {
    lookup: Arc<L>,
    locally_trusted_registry_key: String,
    cache: DashMap<String, (String, Instant)>,
    ttl: Duration,
    ttl_disabled: bool,
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, token: &str, local_path: &str) -> Result<AccessTokenClaims>;
}

impl<L: KeyLookup> CachingVerifier<L> {
    pub fn new(lookup: Arc<L>, locally_trusted_registry_key: String, ttl: Duration, ttl_disabled: bool) -> Self {
        Self {
            lookup,
            locally_trusted_registry_key,
            cache: DashMap::new(),
            ttl,
            ttl_disabled,
        }
    }

    async fn key_for(&self, username: &str) -> Result<String> {
        if !self.ttl_disabled {
            if let Some(entry) = self.cache.get(username) {
                let (key, fetched_at) = entry.value().clone();
                if fetched_at.elapsed() < self.ttl {
                    return Ok(key);
                }
            }
        }
        let key = self.lookup.public_key_for(username).await?;
        if !self.ttl_disabled {
            self.cache.insert(username.to_string(), (key.clone(), Instant::now()));
        }
        Ok(key)
    }
}

#[async_trait]
impl<L: KeyLookup> Verifier for CachingVerifier<L> {
    async fn verify(&self, token: &str, local_path: &str) -> Result<AccessTokenClaims> {
        // We need the caller's username before we can fetch their key, but
        // the username is itself a token claim. Peek at it unverified the
        // same way kite-key parsing does, then verify for real once we have
        // the right public key.
        let mut insecure = Validation::new(Algorithm::RS256);
        insecure.insecure_disable_signature_validation();
        insecure.validate_exp = false;
        insecure.validate_nbf = false;
        insecure.required_spec_claims.clear();
        let peek = decode::<AccessTokenClaims>(token, &DecodingKey::from_secret(&[]), &insecure)
            .map_err(|e| KiteError::Auth(format!("malformed token: {e}")))?;

        let caller_key = self.key_for(&peek.claims.sub).await?;

        if caller_key.trim() != self.locally_trusted_registry_key.trim() {
            return Err(KiteError::KeyNotTrusted(
                "caller's signing key does not match the locally trusted registry key".into(),
            ));
        }

        let claims = verify_access_token(token, &caller_key)?;

        if !audience_matches(&claims.aud, local_path) {
            return Err(KiteError::Auth(format!(
                "audience mismatch: token aud={}, local path={local_path}",
                claims.aud
            )));
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticLookup(String);

    #[async_trait]
    impl KeyLookup for StaticLookup {
        async fn public_key_for(&self, _username: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn token_accepted_within_window_rejected_outside() {
        let registry = KeyPair::generate().unwrap();
        let token = mint_access_token("alice", "/alice/dev/math/1.0.0/default/host/00000000-0000-0000-0000-000000000000", &registry, Some(Duration::from_secs(1))).unwrap();
        assert!(verify_access_token(&token, &registry.public_pem).is_ok());
    }

    #[test]
    fn wrong_audience_rejects() {
        assert!(!audience_matches("/bob/env/app", "/alice/env/app"));
        assert!(audience_matches("/alice/env", "/alice/env/app"));
    }

    #[test]
    fn audience_prefix_is_segment_wise_not_raw_string() {
        // "/alice/dev/app" is a raw string-prefix of "/alice/dev/app2/...",
        // but "app" and "app2" are different path segments, so this must
        // not match.
        assert!(!audience_matches(
            "/alice/dev/app",
            "/alice/dev/app2/1.0/region/host/id"
        ));
        assert!(audience_matches(
            "/alice/dev/app",
            "/alice/dev/app/1.0/region/host/id"
        ));
    }

    #[tokio::test]
    async fn caching_verifier_rejects_untrusted_key() {
        let registry = KeyPair::generate().unwrap();
        let impostor = KeyPair::generate().unwrap();
        let token = mint_access_token("alice", "/alice/dev/app/1/default/host/id", &impostor, None).unwrap();

        let verifier = CachingVerifier::new(
            Arc::new(StaticLookup(impostor.public_pem.clone())),
            registry.public_pem.clone(),
            Duration::from_secs(300),
            false,
        );

        let err = verifier.verify(&token, "/alice/dev/app/1/default/host/id").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::KeyNotTrusted);
    }

    #[tokio::test]
    async fn caching_verifier_accepts_trusted_key_matching_audience() {
        let registry = KeyPair::generate().unwrap();
        let path = "/alice/dev/app/1/default/host/id";
        let token = mint_access_token("alice", path, &registry, None).unwrap();

        let verifier = CachingVerifier::new(
            Arc::new(StaticLookup(registry.public_pem.clone())),
            registry.public_pem.clone(),
            Duration::from_secs(300),
            false,
        );

        let claims = verifier.verify(&token, path).await.unwrap();
        assert_eq!(claims.sub, "alice");
    }
}
