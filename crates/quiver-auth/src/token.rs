//! Bearer extraction and token hashing.

use std::collections::HashMap;

use quiver_types::{Error, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Verified claims, kept as an open map so unfamiliar providers work.
pub type Claims = Map<String, Value>;

/// Extract the Bearer token from request metadata.
///
/// Metadata keys are normalized to lowercase by the transport, so this
/// looks for the `authorization` entry only.
pub fn bearer_token(metadata: &HashMap<String, String>) -> Result<String> {
    let value = metadata
        .get("authorization")
        .ok_or_else(|| Error::Unauthenticated("missing authorization metadata".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            Error::Unauthenticated("authorization must start with 'Bearer '".to_string())
        })?;
    if token.is_empty() {
        return Err(Error::Unauthenticated("empty bearer token".to_string()));
    }
    Ok(token.to_string())
}

/// Cache key for a token: hex SHA-256 so raw tokens never sit in memory
/// longer than the request that carried them.
pub fn token_hash(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_valid() {
        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), "Bearer token_12345".to_string());
        assert_eq!(bearer_token(&metadata).unwrap(), "token_12345");
    }

    #[test]
    fn test_bearer_token_missing() {
        let err = bearer_token(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_bearer_token_wrong_scheme() {
        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), "Basic dXNlcg==".to_string());
        assert!(bearer_token(&metadata).is_err());
    }

    #[test]
    fn test_bearer_token_empty() {
        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), "Bearer ".to_string());
        assert!(bearer_token(&metadata).is_err());
    }

    #[test]
    fn test_token_hash_is_stable_and_distinct() {
        assert_eq!(token_hash("abc"), token_hash("abc"));
        assert_ne!(token_hash("abc"), token_hash("abd"));
        assert_eq!(token_hash("abc").len(), 64);
    }
}
