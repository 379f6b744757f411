//! The request interceptor: token → claims → identity doc → policy check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use moka::future::Cache;
use quiver_graph::Graph;
use quiver_types::{AuthRequest, CancelToken, Context, Doc, Error, Result};
use serde_json::Value;

use crate::jwks::KeySet;
use crate::token::{bearer_token, token_hash, Claims};
use crate::userinfo::UserinfoClient;

/// Verified-claims cache bound: entries, and how long one token hash is
/// trusted before re-resolution.
const JWT_CACHE_CAPACITY: u64 = 4096;
const JWT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Attaches identity to every request and enforces the registered
/// authorizer programs.
pub struct Interceptor {
    graph: Arc<Graph>,
    keys: Option<Arc<KeySet>>,
    userinfo: Option<Arc<dyn UserinfoClient>>,
    jwt_cache: Cache<String, Claims>,
    root_users: Vec<String>,
}

impl Interceptor {
    /// `keys` takes precedence over `userinfo`; at least one resolver
    /// must be configured for any token to authenticate.
    pub fn new(
        graph: Arc<Graph>,
        keys: Option<Arc<KeySet>>,
        userinfo: Option<Arc<dyn UserinfoClient>>,
        root_users: Vec<String>,
    ) -> Self {
        let jwt_cache = Cache::builder()
            .max_capacity(JWT_CACHE_CAPACITY)
            .time_to_live(JWT_CACHE_TTL)
            .build();
        Self { graph, keys, userinfo, jwt_cache, root_users }
    }

    /// Authenticate and authorize one request, producing the [`Context`]
    /// the operation runs under.
    ///
    /// `payload` is the JSON form of the request body, exposed to
    /// authorizer programs as `request.request`.
    pub async fn authenticate(
        &self,
        method: &str,
        metadata: &HashMap<String, String>,
        payload: Value,
        cancel: CancelToken,
    ) -> Result<Context> {
        let token = bearer_token(metadata)?;
        let hash = token_hash(&token);

        let claims = match self.jwt_cache.get(&hash).await {
            Some(claims) => claims,
            None => {
                let claims = self.resolve(&token).await?;
                self.jwt_cache.insert(hash, claims.clone()).await;
                claims
            }
        };

        let email = claims
            .get("email")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Unauthenticated("email not present in claims".to_string()))?
            .to_string();

        let identity = match self.graph.identity(&email).await? {
            Some(doc) => doc,
            None => self.graph.create_identity(&email, claims).await?,
        };

        let ctx = Context::new(identity.clone(), method, cancel);
        if !self.is_root(&identity) {
            self.check(method, &identity, payload).await?;
        }
        Ok(ctx)
    }

    async fn resolve(&self, token: &str) -> Result<Claims> {
        if let Some(keys) = &self.keys {
            return keys.verify(token).await;
        }
        if let Some(userinfo) = &self.userinfo {
            return userinfo.userinfo(token).await;
        }
        Err(Error::Unauthenticated("no token resolver configured".to_string()))
    }

    /// Evaluate every registered authorizer; one false denies.
    async fn check(&self, method: &str, identity: &Doc, payload: Value) -> Result<()> {
        let programs = self.graph.authorizer_programs().await;
        if programs.is_empty() {
            return Ok(());
        }
        let request = AuthRequest {
            method: method.to_string(),
            user: identity.clone(),
            timestamp: Utc::now(),
            request: payload,
        };
        let env = quiver_vm::auth_env(&request)?;
        if !quiver_vm::eval(&env, &programs)? {
            tracing::warn!(method = %method, user = %identity.ref_, "authorization denied");
            return Err(Error::PermissionDenied(format!(
                "request from {} denied",
                identity.ref_
            )));
        }
        Ok(())
    }

    fn is_root(&self, identity: &Doc) -> bool {
        identity
            .email()
            .map(|email| self.root_users.iter().any(|root| root == email))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use quiver_bus::Bus;
    use quiver_types::{Authorizer, Filter, Ref};
    use serde_json::{json, Map};

    use super::*;

    /// Resolver returning fixed claims and counting calls, standing in
    /// for the userinfo endpoint.
    struct StaticResolver {
        email: String,
        calls: AtomicUsize,
    }

    impl StaticResolver {
        fn new(email: &str) -> Arc<Self> {
            Arc::new(Self { email: email.to_string(), calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl UserinfoClient for StaticResolver {
        async fn userinfo(&self, _token: &str) -> Result<Claims> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut claims = Map::new();
            claims.insert("email".to_string(), Value::from(self.email.clone()));
            claims.insert("iss".to_string(), Value::from("https://accounts.example.com"));
            Ok(claims)
        }
    }

    fn metadata(token: &str) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("authorization".to_string(), format!("Bearer {token}"));
        metadata
    }

    fn open_graph() -> (tempfile::TempDir, Arc<Graph>) {
        let dir = tempfile::tempdir().unwrap();
        let graph = Graph::open(dir.path(), Arc::new(Bus::new()), &[]).unwrap();
        (dir, Arc::new(graph))
    }

    #[tokio::test]
    async fn test_authenticate_upserts_identity_and_caches_claims() {
        let (_dir, graph) = open_graph();
        let resolver = StaticResolver::new("alice@x");
        let interceptor =
            Interceptor::new(graph.clone(), None, Some(resolver.clone()), Vec::new());

        let ctx = interceptor
            .authenticate("GetDoc", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(ctx.identity_ref(), &Ref::user("alice@x"));
        assert_eq!(ctx.method(), "GetDoc");
        assert!(graph.identity("alice@x").await.unwrap().is_some());

        // Same token resolves from the cache.
        interceptor
            .authenticate("GetDoc", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .unwrap();
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let (_dir, graph) = open_graph();
        let interceptor =
            Interceptor::new(graph, None, Some(StaticResolver::new("alice@x")), Vec::new());

        let err = interceptor
            .authenticate("GetDoc", &HashMap::new(), Value::Null, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_no_resolver_is_unauthenticated() {
        let (_dir, graph) = open_graph();
        let interceptor = Interceptor::new(graph, None, None, Vec::new());

        let err = interceptor
            .authenticate("GetDoc", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn test_authorizer_denies_method() {
        let (_dir, graph) = open_graph();
        graph
            .set_authorizer(Authorizer {
                name: "no-deletes".to_string(),
                expression: "request.method != 'DelDoc'".to_string(),
            })
            .await
            .unwrap();
        let interceptor = Interceptor::new(
            graph.clone(),
            None,
            Some(StaticResolver::new("alice@x")),
            Vec::new(),
        );

        // Seed a doc as an exempt caller so the denial leaves it intact.
        let root = Context::background(Doc::new(Ref::user("root@x")), "CreateDoc");
        graph.create_doc(&root, Doc::new(Ref::new("dog", "charlie"))).await.unwrap();

        let err = interceptor
            .authenticate(
                "DelDoc",
                &metadata("tok-1"),
                json!({"gtype": "dog", "gid": "charlie"}),
                CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert!(graph.get_doc(&root, &Ref::new("dog", "charlie")).await.is_ok());

        // Any other method passes the same policy.
        assert!(interceptor
            .authenticate("GetDoc", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_root_user_bypasses_policies() {
        let (_dir, graph) = open_graph();
        graph
            .set_authorizer(Authorizer {
                name: "only-root".to_string(),
                expression: "request.user.attributes.email == 'root@x'".to_string(),
            })
            .await
            .unwrap();
        let interceptor = Interceptor::new(
            graph.clone(),
            None,
            Some(StaticResolver::new("alice@x")),
            vec!["alice@x".to_string()],
        );

        // alice fails the expression but is in root_users, so she passes.
        assert!(interceptor
            .authenticate("GetDoc", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_policy_on_user_attributes() {
        let (_dir, graph) = open_graph();
        graph
            .set_authorizer(Authorizer {
                name: "only-root".to_string(),
                expression: "request.user.attributes.email == 'root@x'".to_string(),
            })
            .await
            .unwrap();

        let denied = Interceptor::new(
            graph.clone(),
            None,
            Some(StaticResolver::new("alice@x")),
            Vec::new(),
        );
        let err = denied
            .authenticate("GetDoc", &metadata("tok-alice"), Value::Null, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        let allowed = Interceptor::new(
            graph.clone(),
            None,
            Some(StaticResolver::new("root@x")),
            Vec::new(),
        );
        assert!(allowed
            .authenticate("GetDoc", &metadata("tok-root"), Value::Null, CancelToken::never())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_boot_authorizers_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let graph = Arc::new(
            Graph::open(
                dir.path(),
                Arc::new(Bus::new()),
                &["request.method != 'Shutdown'".to_string()],
            )
            .unwrap(),
        );
        let interceptor =
            Interceptor::new(graph.clone(), None, Some(StaticResolver::new("alice@x")), Vec::new());

        let err = interceptor
            .authenticate("Shutdown", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));

        // A permitted method authenticates and can query; the only doc
        // in the store is the upserted identity itself.
        let ctx = interceptor
            .authenticate("SearchDocs", &metadata("tok-1"), Value::Null, CancelToken::never())
            .await
            .unwrap();
        let docs = graph.search_docs(&ctx, &Filter::gtype("*")).await.unwrap().docs;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].ref_, Ref::user("alice@x"));
    }
}
