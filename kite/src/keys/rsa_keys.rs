//! RSA keypair generation and PEM (de)serialization shared by every claims
//! envelope in this crate: kite key, access token, tunnel token, all RS256.

use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{KiteError, Result};

#[derive(Clone)]
pub struct KeyPair {
    private_pem: String,
    pub public_pem: String,
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        let bits = 2048;
        let private = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| KiteError::Internal(format!("rsa keygen: {e}")))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| KiteError::Internal(format!("pkcs1 encode: {e}")))?
            .to_string();
        let public_pem = rsa::pkcs1::EncodeRsaPublicKey::to_pkcs1_pem(&public, rsa::pkcs1::LineEnding::LF)
            .map_err(|e| KiteError::Internal(format!("pkcs1 encode: {e}")))?;

        Ok(Self {
            private_pem,
            public_pem,
        })
    }

    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| KiteError::Internal(format!("pkcs1 decode: {e}")))?;
        let public = RsaPublicKey::from(&private);
        let public_pem = rsa::pkcs1::EncodeRsaPublicKey::to_pkcs1_pem(&public, rsa::pkcs1::LineEnding::LF)
            .map_err(|e| KiteError::Internal(format!("pkcs1 encode: {e}")))?;
        Ok(Self {
            private_pem: pem.to_string(),
            public_pem,
        })
    }

    pub fn encoding_key(&self) -> Result<EncodingKey> {
        EncodingKey::from_rsa_pem(self.private_pem.as_bytes())
            .map_err(|e| KiteError::Internal(format!("encoding key: {e}")))
    }

    pub fn decoding_key(&self) -> Result<DecodingKey> {
        decoding_key_from_public_pem(&self.public_pem)
    }
}

pub fn decoding_key_from_public_pem(pem: &str) -> Result<DecodingKey> {
    DecodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| KiteError::KeyNotTrusted(format!("invalid public key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_usable_keypair() {
        let kp = KeyPair::generate().unwrap();
        assert!(kp.encoding_key().is_ok());
        assert!(kp.decoding_key().is_ok());
    }
}
