//! # Quiver Auth
//!
//! Bearer-token authentication and policy authorization.
//!
//! Every request carries `authorization: Bearer <token>` metadata. The
//! [`Interceptor`] hashes the token into a bounded, TTL'd cache, resolves
//! claims on a miss (local JWKS verification when configured, otherwise
//! the OpenID userinfo endpoint), upserts the identity doc, and runs
//! every registered authorizer program before handing back a request
//! [`Context`](quiver_types::Context).

pub mod interceptor;
pub mod jwks;
pub mod token;
pub mod userinfo;

pub use interceptor::Interceptor;
pub use jwks::{spawn_refresher, Jwk, JwkSet, KeySet};
pub use token::{bearer_token, token_hash, Claims};
pub use userinfo::{HttpUserinfo, UserinfoClient};
