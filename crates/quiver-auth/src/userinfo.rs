//! OpenID userinfo resolution, used when no JWKS source is configured.

use std::time::Duration;

use async_trait::async_trait;
use quiver_types::{Error, Result};

use crate::token::Claims;

/// Resolves a bearer token to verified claims. The HTTP transport hides
/// behind this trait so tests and embedders can supply their own.
#[async_trait]
pub trait UserinfoClient: Send + Sync {
    async fn userinfo(&self, token: &str) -> Result<Claims>;
}

/// Calls the configured userinfo endpoint with the caller's token.
pub struct HttpUserinfo {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpUserinfo {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| Error::Internal(format!("failed to build http client: {err}")))?;
        Ok(Self { endpoint: endpoint.into(), client })
    }
}

#[async_trait]
impl UserinfoClient for HttpUserinfo {
    async fn userinfo(&self, token: &str) -> Result<Claims> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| Error::Unauthenticated(format!("failed to get userinfo: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::Unauthenticated(format!(
                "failed to get userinfo: {}",
                response.status()
            )));
        }
        response
            .json::<Claims>()
            .await
            .map_err(|err| Error::Unauthenticated(format!("failed to get userinfo: {err}")))
    }
}
