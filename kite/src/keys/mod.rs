//! Key and token service: JWT RS256 claims envelopes and the kite-key
//! file-store lifecycle.

pub mod kitekey;
pub mod rsa_keys;
pub mod token;

pub use kitekey::{KiteKey, KiteKeyClaims};
pub use rsa_keys::KeyPair;
pub use token::{AccessTokenClaims, CachingVerifier, TunnelTokenClaims, Verifier};
