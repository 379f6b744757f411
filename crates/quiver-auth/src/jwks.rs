//! JWKS fetching, caching, and local signature verification.
//!
//! The key set lives behind its own lock and is refreshed by a background
//! ticker every minute; a failed refresh logs and leaves the previous set
//! in place.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use jsonwebtoken::{DecodingKey, Validation};
use quiver_types::{CancelToken, Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::token::Claims;

/// JSON Web Key as defined in RFC 7517, limited to the fields we verify
/// with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", or "OKP" for EdDSA).
    pub kty: String,

    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    /// Key ID matched against the JWT header.
    pub kid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Curve (Ed25519 for EdDSA).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// Base64url encoded public key (EdDSA).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// RSA modulus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    /// Convert to a jsonwebtoken [`DecodingKey`].
    pub fn to_decoding_key(&self) -> Result<DecodingKey> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_ref().ok_or_else(|| {
                    Error::Unauthenticated("RSA key missing 'n' parameter".to_string())
                })?;
                let e = self.e.as_ref().ok_or_else(|| {
                    Error::Unauthenticated("RSA key missing 'e' parameter".to_string())
                })?;
                DecodingKey::from_rsa_components(n, e).map_err(|err| {
                    Error::Unauthenticated(format!("failed to build RSA key: {err}"))
                })
            }
            "OKP" => {
                let x = self.x.as_ref().ok_or_else(|| {
                    Error::Unauthenticated("EdDSA key missing 'x' parameter".to_string())
                })?;
                let key_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(x)
                    .map_err(|err| {
                        Error::Unauthenticated(format!("failed to decode EdDSA key: {err}"))
                    })?;

                // Wrap the raw 32-byte key in a DER SubjectPublicKeyInfo,
                // then PEM, which jsonwebtoken parses reliably.
                let mut der = vec![
                    0x30, 0x2a, // SEQUENCE, 42 bytes
                    0x30, 0x05, // SEQUENCE, 5 bytes
                    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
                    0x03, 0x21, 0x00, // BIT STRING, 33 bytes
                ];
                der.extend_from_slice(&key_bytes);
                let pem = format!(
                    "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----",
                    base64::engine::general_purpose::STANDARD.encode(&der)
                );
                DecodingKey::from_ed_pem(pem.as_bytes()).map_err(|err| {
                    Error::Unauthenticated(format!("failed to build EdDSA key: {err}"))
                })
            }
            other => Err(Error::Unauthenticated(format!("unsupported key type: {other}"))),
        }
    }
}

/// A JWKS document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|key| key.kid == kid)
    }
}

/// The configured JWKS source plus the last successfully fetched set.
pub struct KeySet {
    source: String,
    client: reqwest::Client,
    keys: RwLock<Option<JwkSet>>,
}

impl KeySet {
    pub fn new(source: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| Error::Internal(format!("failed to build http client: {err}")))?;
        Ok(Self { source: source.into(), client, keys: RwLock::new(None) })
    }

    /// Fetch the source and swap the set in. Failures leave the previous
    /// set untouched.
    pub async fn refresh(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.source)
            .send()
            .await
            .map_err(|err| Error::Unauthenticated(format!("failed to fetch jwks: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::Unauthenticated(format!(
                "failed to fetch jwks: {}",
                response.status()
            )));
        }
        let set: JwkSet = response
            .json()
            .await
            .map_err(|err| Error::Unauthenticated(format!("failed to parse jwks: {err}")))?;
        *self.keys.write().await = Some(set);
        Ok(())
    }

    /// Verify a JWT against the cached key set: kid lookup, algorithm
    /// from the header, signature check, and expiry when present.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|err| Error::Unauthenticated(format!("bad jwt header: {err}")))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::Unauthenticated("jwt kid not found".to_string()))?;

        let keys = self.keys.read().await;
        let set = keys
            .as_ref()
            .ok_or_else(|| Error::Unauthenticated("jwks not loaded".to_string()))?;
        let jwk = set.find(kid).ok_or_else(|| {
            Error::Unauthenticated(format!("failed to look up kid: {kid} - zero keys"))
        })?;
        let key = jwk.to_decoding_key()?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(|err| Error::Unauthenticated(format!("jwt verification failed: {err}")))?;
        Ok(data.claims)
    }
}

/// Refresh the key set every minute until shutdown fires.
pub fn spawn_refresher(keys: Arc<KeySet>, shutdown: CancelToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tracing::debug!("refreshing jwks");
                    if let Err(err) = keys.refresh().await {
                        tracing::error!(error = %err, "failed to refresh jwks");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwk_set_parse_and_find() {
        let raw = r#"{"keys": [
            {"kty": "RSA", "use": "sig", "kid": "key-1", "alg": "RS256",
             "n": "sXchTg", "e": "AQAB"},
            {"kty": "OKP", "kid": "key-2", "crv": "Ed25519", "x": "It7jcA"}
        ]}"#;
        let set: JwkSet = serde_json::from_str(raw).unwrap();
        assert_eq!(set.keys.len(), 2);
        assert_eq!(set.find("key-1").unwrap().kty, "RSA");
        assert!(set.find("missing").is_none());
    }

    #[test]
    fn test_jwk_missing_components_rejected() {
        let jwk = Jwk {
            kty: "RSA".to_string(),
            use_: None,
            kid: "key-1".to_string(),
            alg: None,
            crv: None,
            x: None,
            n: None,
            e: None,
        };
        assert!(jwk.to_decoding_key().is_err());

        let unsupported = Jwk { kty: "EC".to_string(), ..jwk };
        assert!(unsupported.to_decoding_key().is_err());
    }

    #[tokio::test]
    async fn test_verify_without_keys_is_unauthenticated() {
        let keys = KeySet::new("https://example.com/jwks.json").unwrap();
        // Structurally valid but unverifiable token (header carries a kid).
        let header = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"alg":"RS256","typ":"JWT","kid":"key-1"}"#);
        let payload =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(r#"{"email":"a@x"}"#);
        let token = format!("{header}.{payload}.c2ln");
        let err = keys.verify(&token).await.unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }
}
