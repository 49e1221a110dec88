//! Silent token acquisition from the persisted OAuth cache.

use crate::auth::oauth::{OAuth2Client, TokenResponse, TokenResult};
use crate::cache::token_cache::{CachedAccessToken, CachedRefreshToken};
use crate::cache::{CachedAccount, CredentialCache, TokenCacheData, OAUTH_CACHE_KEY};
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

/// Cached access tokens closer than this to expiry are not served.
const ACCESS_TOKEN_MARGIN_MINUTES: i64 = 5;

/// Upper bound on a reported `expires_in`.
const MAX_TOKEN_LIFETIME_SECONDS: u64 = 86_400;

/// Mint a token for a cached account without user interaction.
#[async_trait]
pub trait SilentRefresh: Send + Sync {
    /// Cached accounts for `username`, in cache order.
    async fn accounts(&self, username: &str) -> Result<Vec<CachedAccount>, AppError>;

    /// Try to obtain a token for `account`.
    ///
    /// `Ok(None)` means the account holds nothing to refresh with. Failures
    /// reported by the identity platform come back as `TokenResult::Error`;
    /// `Err` is reserved for local failures such as an unreadable cache.
    async fn refresh(
        &self,
        account: &CachedAccount,
        scopes: &[String],
    ) -> Result<Option<TokenResult>, AppError>;
}

/// Silent refresh backed by [`CredentialCache`] and the token endpoint.
pub struct CacheRefreshFlow {
    cache: CredentialCache,
    client_id: String,
    authority: String,
}

impl CacheRefreshFlow {
    pub fn new(cache: CredentialCache, client_id: &str, authority: &str) -> Self {
        Self {
            cache,
            client_id: client_id.to_string(),
            authority: authority.to_string(),
        }
    }
}

#[async_trait]
impl SilentRefresh for CacheRefreshFlow {
    async fn accounts(&self, username: &str) -> Result<Vec<CachedAccount>, AppError> {
        let data: TokenCacheData = self.cache.load(OAUTH_CACHE_KEY)?.unwrap_or_default();
        Ok(data.accounts_for(username))
    }

    async fn refresh(
        &self,
        account: &CachedAccount,
        scopes: &[String],
    ) -> Result<Option<TokenResult>, AppError> {
        // Held across the network call so a rotated refresh token is never lost
        let lock = self.cache.lock(OAUTH_CACHE_KEY).await?;
        let mut data: TokenCacheData = self.cache.load(OAUTH_CACHE_KEY)?.unwrap_or_default();

        let margin = Duration::minutes(ACCESS_TOKEN_MARGIN_MINUTES);
        if let Some(cached) = data.access_token_for(account, &self.client_id, scopes, margin) {
            debug!("Serving cached access token for {}", account.username);
            return Ok(Some(TokenResult::success(cached.secret.as_str(), None)));
        }

        let Some(refresh_token) = data
            .refresh_token_for(account, &self.client_id)
            .map(str::to_string)
        else {
            debug!("No refresh token cached for {}", account.username);
            return Ok(None);
        };

        // A fresh client per attempt, bound to the shared cache
        let client = OAuth2Client::new(&self.client_id, &self.authority)?;
        match client.refresh_token(&refresh_token, scopes).await {
            Ok(response) => {
                remember_tokens(&mut data, account, &self.client_id, scopes, &response);
                self.cache.write(&lock, OAUTH_CACHE_KEY, &data)?;
                info!("Silent refresh succeeded for {}", account.username);
                Ok(Some(TokenResult::from_response(&response)))
            }
            Err(e) => {
                warn!("Silent refresh failed for {}: {}", account.username, e);
                Ok(Some(TokenResult::from_auth_error(&e)))
            }
        }
    }
}

/// Record a token response for `account`, superseding older entries.
pub(crate) fn remember_tokens(
    data: &mut TokenCacheData,
    account: &CachedAccount,
    client_id: &str,
    requested: &[String],
    response: &TokenResponse,
) {
    data.prune_expired();
    data.upsert_account(account.clone());

    // A `.default` request is answered with the consented permissions, so the
    // entry is keyed by both or a later `.default` lookup would never hit.
    let mut scopes = requested.to_vec();
    for scope in response.granted_scopes() {
        if !scopes.iter().any(|s| s.eq_ignore_ascii_case(&scope)) {
            scopes.push(scope);
        }
    }
    let lifetime = response.expires_in.min(MAX_TOKEN_LIFETIME_SECONDS) as i64;
    data.put_access_token(CachedAccessToken {
        home_account_id: account.home_account_id.clone(),
        client_id: client_id.to_string(),
        scopes,
        secret: response.access_token.clone(),
        expires_on: Utc::now() + Duration::seconds(lifetime),
    });

    if let Some(refresh_token) = &response.refresh_token {
        data.put_refresh_token(CachedRefreshToken {
            home_account_id: account.home_account_id.clone(),
            client_id: client_id.to_string(),
            secret: refresh_token.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn alice() -> CachedAccount {
        CachedAccount {
            home_account_id: "oid-1.tid-1".into(),
            username: "alice@contoso.com".into(),
            tenant_id: Some("tid-1".into()),
            authority: "https://login.microsoftonline.com/contoso.onmicrosoft.com".into(),
        }
    }

    fn graph() -> Vec<String> {
        vec!["https://graph.microsoft.com/.default".to_string()]
    }

    async fn seeded_cache(dir: &std::path::Path, access: Option<CachedAccessToken>) -> CredentialCache {
        let cache = CredentialCache::in_memory(dir);
        let mut data = TokenCacheData::default();
        data.upsert_account(alice());
        data.put_refresh_token(CachedRefreshToken {
            home_account_id: alice().home_account_id,
            client_id: "client".into(),
            secret: "rt-1".into(),
        });
        if let Some(access) = access {
            data.put_access_token(access);
        }
        cache.store(OAUTH_CACHE_KEY, &data).await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_cached_access_token_is_served_without_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(
            dir.path(),
            Some(CachedAccessToken {
                home_account_id: alice().home_account_id,
                client_id: "client".into(),
                scopes: graph(),
                secret: "cached-at".into(),
                expires_on: Utc::now() + Duration::hours(1),
            }),
        )
        .await;
        // Unroutable authority: any network use would fail the test
        let flow = CacheRefreshFlow::new(cache, "client", "http://127.0.0.1:9/common");

        let accounts = flow.accounts("ALICE@contoso.com").await.unwrap();
        assert_eq!(accounts, vec![alice()]);

        let result = flow.refresh(&accounts[0], &graph()).await.unwrap().unwrap();
        assert_eq!(result, TokenResult::success("cached-at", None));
    }

    #[tokio::test]
    async fn test_refresh_grant_rotates_refresh_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/common/oauth2/v2.0/token")
                    .body_includes("refresh_token=rt-1");
                then.status(200).json_body(json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "expires_in": 3600,
                    "scope": "https://graph.microsoft.com/.default"
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(dir.path(), None).await;
        let flow = CacheRefreshFlow::new(cache.clone(), "client", &server.url("/common"));

        let result = flow.refresh(&alice(), &graph()).await.unwrap().unwrap();
        mock.assert_async().await;
        assert_eq!(result, TokenResult::success("at-2", Some(graph())));

        let data: TokenCacheData = cache.load(OAUTH_CACHE_KEY).unwrap().unwrap();
        assert_eq!(data.refresh_token_for(&alice(), "client"), Some("rt-2"));
        assert_eq!(data.access_tokens.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_an_inline_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/common/oauth2/v2.0/token");
                then.status(400).json_body(json!({
                    "error": "invalid_grant",
                    "error_description": "AADSTS50173: grant revoked"
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(dir.path(), None).await;
        let flow = CacheRefreshFlow::new(cache, "client", &server.url("/common"));

        let result = flow.refresh(&alice(), &graph()).await.unwrap().unwrap();
        assert!(matches!(result, TokenResult::Error { ref error, .. } if error == "invalid_grant"));
    }

    #[tokio::test]
    async fn test_account_without_refresh_token_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::in_memory(dir.path());
        let flow = CacheRefreshFlow::new(cache, "client", "http://127.0.0.1:9/common");

        assert!(flow.accounts("alice@contoso.com").await.unwrap().is_empty());
        assert!(flow.refresh(&alice(), &graph()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_default_scope_request_is_served_from_cache_next_time() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/common/oauth2/v2.0/token");
                then.status(200).json_body(json!({
                    "access_token": "at-2",
                    "refresh_token": "rt-2",
                    "expires_in": 3600,
                    "scope": "https://graph.microsoft.com/User.Read \
                              https://graph.microsoft.com/Files.ReadWrite openid profile"
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = seeded_cache(dir.path(), None).await;
        let flow = CacheRefreshFlow::new(cache.clone(), "client", &server.url("/common"));

        let first = flow.refresh(&alice(), &graph()).await.unwrap().unwrap();
        assert_eq!(first.access_token(), Some("at-2"));
        assert!(first.scopes().is_some());

        let second = flow.refresh(&alice(), &graph()).await.unwrap().unwrap();
        assert_eq!(second, TokenResult::success("at-2", None));
        mock.assert_async().await;

        let data: TokenCacheData = cache.load(OAUTH_CACHE_KEY).unwrap().unwrap();
        let named = vec!["https://graph.microsoft.com/Files.ReadWrite".to_string()];
        assert!(data
            .access_token_for(&alice(), "client", &named, Duration::minutes(5))
            .is_some());
    }
}
