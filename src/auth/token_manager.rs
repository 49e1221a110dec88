//! Token acquisition façade: silent refresh first, interactive sign-in when
//! that yields nothing usable.

use crate::auth::authority::authority_url;
use crate::auth::claims::{decode_claims, DecodedClaims};
use crate::auth::interactive::{BrowserInteractiveFlow, InteractiveFlow, InteractiveRequest};
use crate::auth::oauth::TokenResult;
use crate::auth::scopes::resolve_scopes;
use crate::auth::silent::{CacheRefreshFlow, SilentRefresh};
use crate::cache::{CredentialCache, SecureString};
use crate::config::Config;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tracing::{debug, error, info};

/// Default wait for the interactive browser flow.
pub const DEFAULT_INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Tokens this close to expiry are re-acquired by [`TokenAuthority::fresh_token`].
const REFRESH_BEFORE_EXPIRY_MINUTES: i64 = 5;

/// The user, tenant and client application tokens are acquired for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub email: String,
    pub tenant: String,
    pub client_id: String,
}

/// Supplies a current bearer token on demand.
#[async_trait]
pub trait BearerTokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<SecureString, AppError>;
}

/// Owns the current token for one [`Principal`] and decides how to obtain
/// a new one.
pub struct TokenAuthority {
    principal: Principal,
    authority: String,
    scopes: Vec<String>,
    interactive_timeout: Duration,
    silent: Box<dyn SilentRefresh>,
    interactive: Box<dyn InteractiveFlow>,
    /// Last successful result; replaced on every successful acquisition.
    current: Option<TokenResult>,
}

impl TokenAuthority {
    /// Authority over the shared credential cache with the default flows.
    pub fn new(
        principal: Principal,
        server: Option<&str>,
        permissions: &[String],
        cache: CredentialCache,
    ) -> Self {
        let authority = authority_url(&principal.tenant);
        let silent = CacheRefreshFlow::new(cache.clone(), &principal.client_id, &authority);
        let interactive = BrowserInteractiveFlow::new(cache, &principal.client_id, &authority);
        Self::with_flows(
            principal,
            resolve_scopes(server, permissions),
            Box::new(silent),
            Box::new(interactive),
        )
    }

    /// Authority for the configured principal and target.
    pub fn from_config(config: &Config, cache: CredentialCache) -> Self {
        let oauth = &config.oauth;
        let principal = Principal {
            email: oauth.email.clone(),
            tenant: oauth.tenant.clone(),
            client_id: oauth.client_id.clone(),
        };
        let authority = authority_url(&principal.tenant);
        let silent = CacheRefreshFlow::new(cache.clone(), &principal.client_id, &authority);
        let interactive = BrowserInteractiveFlow::new(cache, &principal.client_id, &authority)
            .with_callback_port(oauth.callback_port);

        Self::with_flows(
            principal,
            resolve_scopes(oauth.server.as_deref(), &oauth.permissions),
            Box::new(silent),
            Box::new(interactive),
        )
        .with_interactive_timeout(oauth.interactive_timeout())
    }

    /// Authority with explicit flows and an already resolved scope set.
    pub fn with_flows(
        principal: Principal,
        scopes: Vec<String>,
        silent: Box<dyn SilentRefresh>,
        interactive: Box<dyn InteractiveFlow>,
    ) -> Self {
        let authority = authority_url(&principal.tenant);
        Self {
            principal,
            authority,
            scopes,
            interactive_timeout: DEFAULT_INTERACTIVE_TIMEOUT,
            silent,
            interactive,
            current: None,
        }
    }

    pub fn with_interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = timeout;
        self
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// The last successful result, if any. Never triggers an acquisition.
    pub fn current_token(&self) -> Option<&TokenResult> {
        self.current.as_ref()
    }

    /// Forget the held token; the next accessor acquires a new one.
    pub fn invalidate(&mut self) {
        self.current = None;
    }

    /// Acquire a token: silent refresh over every cached account for the
    /// principal, then the interactive flow if none of them succeeded.
    ///
    /// Errors from the identity platform are returned inline and logged, and
    /// are never retried here.
    pub async fn acquire_token(&mut self) -> Result<TokenResult, AppError> {
        let email = self.principal.email.clone();
        let accounts = self.silent.accounts(&email).await?;
        if accounts.is_empty() {
            info!("No cached account for {}", email);
        }

        let mut refreshed = None;
        for account in &accounts {
            match self.silent.refresh(account, &self.scopes).await? {
                Some(result @ TokenResult::Success { .. }) => {
                    refreshed = Some(result);
                    break;
                }
                Some(TokenResult::Error { error, .. }) => {
                    debug!("Refresh for {} returned {}", account.home_account_id, error);
                }
                None => debug!("Nothing to refresh for {}", account.home_account_id),
            }
        }

        let result = match refreshed {
            Some(result) => result,
            None => {
                info!("Interactive sign-in required for {}", email);
                let request = InteractiveRequest {
                    scopes: self.scopes.clone(),
                    login_hint: Some(email),
                    prompt: None,
                    domain_hint: None,
                    timeout: self.interactive_timeout,
                };
                self.interactive.acquire_interactive(&request).await?
            }
        };

        match &result {
            TokenResult::Success { .. } => self.current = Some(result.clone()),
            TokenResult::Error {
                error: code,
                description,
                suberror,
            } => error!(
                "Token acquisition failed: {} ({}): {}",
                code,
                suberror.as_deref().unwrap_or("-"),
                description
            ),
        }

        Ok(result)
    }

    /// The held access token, acquiring one if none is held.
    pub async fn last_token(&mut self) -> Result<SecureString, AppError> {
        if let Some(TokenResult::Success { access_token, .. }) = &self.current {
            return Ok(access_token.clone());
        }
        Ok(self.acquire_token().await?.into_auth_result()?)
    }

    /// Like [`last_token`](Self::last_token), but re-acquires a held token
    /// that is about to expire.
    pub async fn fresh_token(&mut self) -> Result<SecureString, AppError> {
        let token = self.last_token().await?;
        let expiring = decode_claims(token.as_str())
            .map(|c| c.expires_within(ChronoDuration::minutes(REFRESH_BEFORE_EXPIRY_MINUTES)))
            .unwrap_or(false);
        if !expiring {
            return Ok(token);
        }

        debug!("Held token is about to expire; re-acquiring");
        Ok(self.acquire_token().await?.into_auth_result()?)
    }

    /// Claims of the held token. Acquires a token first if none is held.
    pub async fn decoded_claims(&mut self) -> Result<DecodedClaims, AppError> {
        let token = self.last_token().await?;
        Ok(decode_claims(token.as_str())?)
    }

    /// Granted scopes: those reported with the token when it was minted,
    /// else the token's `scp` claim.
    pub async fn token_scopes(&mut self) -> Result<Vec<String>, AppError> {
        let token = self.last_token().await?;
        if let Some(scopes) = self.current.as_ref().and_then(TokenResult::scopes) {
            return Ok(scopes.to_vec());
        }
        let claims = decode_claims(token.as_str())?;
        Ok(claims.scopes().into_iter().map(str::to_string).collect())
    }

    /// Whether the held token grants `scope`, given either as a bare
    /// permission (`AllSites.Read`) or a resolved URI.
    pub async fn has_scope(&mut self, scope: &str) -> Result<bool, AppError> {
        let granted = self.token_scopes().await?;
        Ok(granted.iter().any(|g| scope_matches(g, scope)))
    }

    /// `Authorization` header value for the held token.
    pub async fn authorization_header(&mut self) -> Result<String, AppError> {
        let token = self.fresh_token().await?;
        Ok(format!("Bearer {}", token.as_str()))
    }
}

#[async_trait]
impl BearerTokenProvider for tokio::sync::Mutex<TokenAuthority> {
    async fn bearer_token(&self) -> Result<SecureString, AppError> {
        self.lock().await.fresh_token().await
    }
}

fn scope_matches(granted: &str, wanted: &str) -> bool {
    let bare = |s: &str| s.rsplit('/').next().unwrap_or(s).to_ascii_lowercase();
    if granted.eq_ignore_ascii_case(wanted) {
        return true;
    }
    // Only compare bare names when one side carries no resource prefix
    (!granted.contains('/') || !wanted.contains('/')) && bare(granted) == bare(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::make_token;
    use crate::cache::token_cache::CachedAccessToken;
    use crate::cache::{CachedAccount, TokenCacheData, OAUTH_CACHE_KEY};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const GRAPH: &str = "https://graph.microsoft.com/.default";

    fn alice() -> Principal {
        Principal {
            email: "alice@contoso.com".into(),
            tenant: "contoso".into(),
            client_id: "client".into(),
        }
    }

    fn account(id: &str) -> CachedAccount {
        CachedAccount {
            home_account_id: id.into(),
            username: "alice@contoso.com".into(),
            tenant_id: None,
            authority: "https://login.microsoftonline.com/contoso.onmicrosoft.com".into(),
        }
    }

    struct FakeSilent {
        accounts: Vec<CachedAccount>,
        results: Mutex<VecDeque<Option<TokenResult>>>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSilent {
        fn new(accounts: Vec<CachedAccount>, results: Vec<Option<TokenResult>>) -> Self {
            Self {
                accounts,
                results: Mutex::new(results.into()),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl SilentRefresh for FakeSilent {
        async fn accounts(&self, _username: &str) -> Result<Vec<CachedAccount>, AppError> {
            Ok(self.accounts.clone())
        }

        async fn refresh(
            &self,
            _account: &CachedAccount,
            _scopes: &[String],
        ) -> Result<Option<TokenResult>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.lock().unwrap().pop_front().flatten())
        }
    }

    struct FakeInteractive {
        result: TokenResult,
        calls: Arc<AtomicUsize>,
        last_hint: Arc<Mutex<Option<String>>>,
    }

    impl FakeInteractive {
        fn new(result: TokenResult) -> Self {
            Self {
                result,
                calls: Arc::new(AtomicUsize::new(0)),
                last_hint: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl InteractiveFlow for FakeInteractive {
        async fn acquire_interactive(
            &self,
            request: &InteractiveRequest,
        ) -> Result<TokenResult, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_hint.lock().unwrap() = request.login_hint.clone();
            Ok(self.result.clone())
        }
    }

    fn authority(silent: FakeSilent, interactive: FakeInteractive) -> TokenAuthority {
        TokenAuthority::with_flows(
            alice(),
            vec![GRAPH.to_string()],
            Box::new(silent),
            Box::new(interactive),
        )
    }

    #[tokio::test]
    async fn test_successful_refresh_never_goes_interactive() {
        let silent = FakeSilent::new(
            vec![account("a.t")],
            vec![Some(TokenResult::success("X", Some(vec![GRAPH.to_string()])))],
        );
        let interactive = FakeInteractive::new(TokenResult::success("unused", None));
        let interactive_calls = Arc::clone(&interactive.calls);
        let mut authority = authority(silent, interactive);

        let result = authority.acquire_token().await.unwrap();
        assert_eq!(result, TokenResult::success("X", Some(vec![GRAPH.to_string()])));
        assert_eq!(authority.last_token().await.unwrap().as_str(), "X");
        assert_eq!(interactive_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            authority.authority(),
            "https://login.microsoftonline.com/contoso.onmicrosoft.com"
        );
    }

    #[tokio::test]
    async fn test_error_payload_moves_to_next_account() {
        let silent = FakeSilent::new(
            vec![account("a.t"), account("b.t"), account("c.t")],
            vec![
                Some(TokenResult::error("invalid_grant", "expired")),
                Some(TokenResult::success("from-b", None)),
                Some(TokenResult::success("from-c", None)),
            ],
        );
        let silent_calls = Arc::clone(&silent.calls);
        let interactive = FakeInteractive::new(TokenResult::success("unused", None));
        let mut authority = authority(silent, interactive);

        let result = authority.acquire_token().await.unwrap();
        assert_eq!(result.access_token(), Some("from-b"));
        // stops at the first success
        assert_eq!(silent_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_cached_account_goes_interactive_with_hint() {
        let silent = FakeSilent::new(vec![], vec![]);
        let interactive = FakeInteractive::new(TokenResult::success(
            "Y",
            Some(vec![GRAPH.to_string()]),
        ));
        let calls = Arc::clone(&interactive.calls);
        let hint = Arc::clone(&interactive.last_hint);
        let mut authority = authority(silent, interactive);

        let result = authority.acquire_token().await.unwrap();
        assert_eq!(result.scopes(), Some(&[GRAPH.to_string()][..]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hint.lock().unwrap().as_deref(), Some("alice@contoso.com"));
    }

    #[tokio::test]
    async fn test_all_refreshes_failing_escalates() {
        let silent = FakeSilent::new(
            vec![account("a.t"), account("b.t")],
            vec![Some(TokenResult::error("invalid_grant", "expired")), None],
        );
        let interactive = FakeInteractive::new(TokenResult::success("Z", None));
        let calls = Arc::clone(&interactive.calls);
        let mut authority = authority(silent, interactive);

        assert_eq!(authority.acquire_token().await.unwrap().access_token(), Some("Z"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interactive_failure_surfaces_as_error() {
        let silent = FakeSilent::new(vec![], vec![]);
        let interactive = FakeInteractive::new(TokenResult::Error {
            error: "access_denied".into(),
            description: "User cancelled".into(),
            suberror: Some("cancel".into()),
        });
        let calls = Arc::clone(&interactive.calls);
        let mut authority = authority(silent, interactive);

        let result = authority.acquire_token().await.unwrap();
        assert!(!result.is_success());
        assert!(authority.current_token().is_none());

        let err = authority.last_token().await.unwrap_err();
        assert_eq!(err.to_string(), "Authentication error: access_denied: User cancelled");
        // each call made its own single attempt
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_claims_trigger_exactly_one_acquisition() {
        let token = make_token(&json!({
            "aud": "https://graph.microsoft.com",
            "upn": "alice@contoso.com",
            "scp": "User.Read Files.Read.All",
            "exp": 4_102_444_800i64
        }));
        let silent = FakeSilent::new(vec![], vec![]);
        let interactive = FakeInteractive::new(TokenResult::success(token, None));
        let calls = Arc::clone(&interactive.calls);
        let mut authority = authority(silent, interactive);

        let claims = authority.decoded_claims().await.unwrap();
        assert_eq!(claims.username(), Some("alice@contoso.com"));
        assert_eq!(claims.scopes(), vec!["User.Read", "Files.Read.All"]);

        // subsequent reads use the held token
        authority.decoded_claims().await.unwrap();
        assert!(authority.has_scope("Files.Read.All").await.unwrap());
        assert!(authority
            .has_scope("https://graph.microsoft.com/User.Read")
            .await
            .unwrap());
        assert!(!authority.has_scope("Sites.Read.All").await.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiring_token_is_reacquired() {
        let soon = make_token(&json!({ "exp": chrono::Utc::now().timestamp() + 60 }));
        let silent = FakeSilent::new(vec![account("a.t")], vec![Some(TokenResult::success(soon, None))]);
        let interactive = FakeInteractive::new(TokenResult::success("later", None));
        let provider = tokio::sync::Mutex::new(authority(silent, interactive));

        // second acquisition finds nothing to refresh and signs in again
        let token = provider.bearer_token().await.unwrap();
        assert_eq!(token.as_str(), "later");
    }

    #[tokio::test]
    async fn test_clear_cache_forces_interactive() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::in_memory(dir.path());
        let mut data = TokenCacheData::default();
        data.upsert_account(account("a.t"));
        data.put_access_token(CachedAccessToken {
            home_account_id: "a.t".into(),
            client_id: "client".into(),
            scopes: vec![GRAPH.to_string()],
            secret: "cached".into(),
            expires_on: chrono::Utc::now() + ChronoDuration::hours(1),
        });
        cache.store(OAUTH_CACHE_KEY, &data).await.unwrap();

        let silent = CacheRefreshFlow::new(cache.clone(), "client", "http://127.0.0.1:9/common");
        let interactive = FakeInteractive::new(TokenResult::success("signed-in", None));
        let calls = Arc::clone(&interactive.calls);
        let mut authority = TokenAuthority::with_flows(
            alice(),
            vec![GRAPH.to_string()],
            Box::new(silent),
            Box::new(interactive),
        );

        assert_eq!(authority.acquire_token().await.unwrap().access_token(), Some("cached"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        cache.clear().await.unwrap();
        authority.invalidate();
        assert_eq!(authority.last_token().await.unwrap().as_str(), "signed-in");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_matches() {
        assert!(scope_matches("AllSites.Read", "https://contoso.sharepoint.com/AllSites.Read"));
        assert!(scope_matches("https://graph.microsoft.com/.default", "https://graph.microsoft.com/.default"));
        assert!(!scope_matches(
            "https://contoso.sharepoint.com/AllSites.Read",
            "https://fabrikam.sharepoint.com/AllSites.Read"
        ));
        assert!(!scope_matches("User.Read", "User.ReadWrite"));
    }
}
