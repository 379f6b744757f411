//! # Quiver Config
//!
//! Recognized configuration options, loaded from an optional file layered
//! under `QUIVER_`-prefixed environment variables.

use std::path::{Path, PathBuf};

use config::{Config as ConfigBuilder, Environment, File};
use quiver_types::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the database file.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    #[serde(default = "default_bind_grpc")]
    pub bind_grpc: String,

    #[serde(default = "default_bind_http")]
    pub bind_http: String,

    /// JWKS URL; when empty, tokens are accepted based on userinfo
    /// lookup only.
    #[serde(default)]
    pub jwks: Option<String>,

    /// Required when `jwks` is not set.
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,

    /// Emails exempt from authorizer evaluation.
    #[serde(default)]
    pub root_users: Vec<String>,

    /// Authorizer expressions registered at boot.
    #[serde(default)]
    pub authorizers: Vec<String>,

    /// Endpoints of external mutation-rewriting plugins.
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            bind_grpc: default_bind_grpc(),
            bind_http: default_bind_http(),
            jwks: None,
            userinfo_endpoint: None,
            root_users: Vec::new(),
            authorizers: Vec::new(),
            triggers: Vec::new(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/tmp/quiver")
}

fn default_bind_grpc() -> String {
    "0.0.0.0:7820".to_string()
}

fn default_bind_http() -> String {
    "0.0.0.0:7830".to_string()
}

impl Config {
    /// Load from an optional file with `QUIVER_` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let settings = builder
            .add_source(Environment::with_prefix("QUIVER").list_separator(","))
            .build()
            .map_err(|err| Error::Internal(format!("failed to load config: {err}")))?;
        let config: Config = settings
            .try_deserialize()
            .map_err(|err| Error::Internal(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// One token resolver must be configured.
    pub fn validate(&self) -> Result<()> {
        let jwks_set = self.jwks.as_deref().is_some_and(|url| !url.is_empty());
        let userinfo_set =
            self.userinfo_endpoint.as_deref().is_some_and(|url| !url.is_empty());
        if !jwks_set && !userinfo_set {
            return Err(Error::Internal(
                "userinfo_endpoint is required when jwks is not set".to_string(),
            ));
        }
        Ok(())
    }
}
