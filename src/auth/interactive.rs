//! Interactive browser sign-in (authorization code + PKCE on loopback).

use crate::auth::callback_server::{CallbackListener, CallbackResult};
use crate::auth::claims::{decode_claims, DecodedClaims};
use crate::auth::oauth::{
    parse_callback_url, AuthorizeOptions, OAuth2Client, PkceChallenge, TokenResponse, TokenResult,
};
use crate::auth::silent::remember_tokens;
use crate::cache::{CachedAccount, CredentialCache, TokenCacheData, OAUTH_CACHE_KEY};
use crate::error::{AppError, AuthError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters of one interactive sign-in.
#[derive(Debug, Clone)]
pub struct InteractiveRequest {
    pub scopes: Vec<String>,
    pub login_hint: Option<String>,
    pub prompt: Option<String>,
    pub domain_hint: Option<String>,
    /// How long to wait for the browser to come back.
    pub timeout: Duration,
}

/// Acquire a token with the user in the loop.
#[async_trait]
pub trait InteractiveFlow: Send + Sync {
    /// Failures reported by the user or identity platform, including the
    /// timeout, come back as `TokenResult::Error`.
    async fn acquire_interactive(&self, request: &InteractiveRequest)
        -> Result<TokenResult, AppError>;
}

/// Opens the system browser and captures the redirect on a loopback port.
pub struct BrowserInteractiveFlow {
    cache: CredentialCache,
    client_id: String,
    authority: String,
    callback_port: u16,
    opener: fn(&str) -> std::io::Result<()>,
}

fn open_system_browser(url: &str) -> std::io::Result<()> {
    open::that(url)
}

impl BrowserInteractiveFlow {
    pub fn new(cache: CredentialCache, client_id: &str, authority: &str) -> Self {
        Self {
            cache,
            client_id: client_id.to_string(),
            authority: authority.to_string(),
            callback_port: 0,
            opener: open_system_browser,
        }
    }

    /// Use a fixed redirect port instead of a free one.
    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }

    /// Replace how the authorization URL is handed to the user.
    pub fn with_opener(mut self, opener: fn(&str) -> std::io::Result<()>) -> Self {
        self.opener = opener;
        self
    }

    async fn sign_in(
        &self,
        client: &OAuth2Client,
        request: &InteractiveRequest,
    ) -> Result<TokenResponse, AuthError> {
        let listener = CallbackListener::bind(self.callback_port)
            .await
            .map_err(|e| AuthError::OAuthFailed(format!("Failed to start listener: {}", e)))?;
        let redirect_uri = listener.redirect_uri();

        let pkce = PkceChallenge::new();
        let options = AuthorizeOptions {
            login_hint: request.login_hint.clone(),
            prompt: request.prompt.clone(),
            domain_hint: request.domain_hint.clone(),
        };
        let (auth_url, expected_state) =
            client.generate_auth_url(&request.scopes, &redirect_uri, &pkce, &options)?;

        info!("Opening browser for interactive sign-in");
        if let Err(e) = (self.opener)(auth_url.as_str()) {
            warn!("Could not open browser ({}); visit {} to sign in", e, auth_url);
        }

        let callback_url = match listener.wait_for_callback(request.timeout).await {
            CallbackResult::Success(url) => url,
            CallbackResult::Timeout => return Err(AuthError::CallbackTimeout),
            CallbackResult::Error(e) => return Err(AuthError::OAuthFailed(e)),
        };

        let (code, state) = parse_callback_url(&callback_url)?;
        if state != expected_state {
            return Err(AuthError::StateValidationFailed);
        }

        client
            .exchange_code(&code, &pkce.verifier, &redirect_uri, &request.scopes)
            .await
    }
}

#[async_trait]
impl InteractiveFlow for BrowserInteractiveFlow {
    async fn acquire_interactive(
        &self,
        request: &InteractiveRequest,
    ) -> Result<TokenResult, AppError> {
        let client = OAuth2Client::new(&self.client_id, &self.authority)?;

        let response = match self.sign_in(&client, request).await {
            Ok(response) => response,
            Err(e) => return Ok(TokenResult::from_auth_error(&e)),
        };

        match account_from_response(&response, request.login_hint.as_deref(), &self.authority) {
            Some(account) => {
                let client_id = self.client_id.clone();
                let scopes = request.scopes.clone();
                self.cache
                    .update(OAUTH_CACHE_KEY, |data: &mut TokenCacheData| {
                        remember_tokens(data, &account, &client_id, &scopes, &response)
                    })
                    .await?;
                info!("Interactive sign-in completed for {}", account.username);
            }
            None => warn!("Sign-in returned no usable identity; token not cached"),
        }

        Ok(TokenResult::from_response(&response))
    }
}

/// Build the cache account from the id token, or the access token if the
/// id token is missing.
fn account_from_response(
    response: &TokenResponse,
    login_hint: Option<&str>,
    authority: &str,
) -> Option<CachedAccount> {
    let claims: DecodedClaims = response
        .id_token
        .as_deref()
        .and_then(|t| decode_claims(t).ok())
        .or_else(|| decode_claims(&response.access_token).ok())
        .unwrap_or_default();

    let username = claims
        .preferred_username
        .clone()
        .or_else(|| claims.username().map(str::to_string))
        .or_else(|| login_hint.map(str::to_string))?;

    let home_account_id = match (&claims.oid, &claims.tid) {
        (Some(oid), Some(tid)) => format!("{}.{}", oid, tid),
        _ => claims.sub.clone().unwrap_or_else(|| username.to_lowercase()),
    };
    debug!("Resolved account {} for {}", home_account_id, username);

    Some(CachedAccount {
        home_account_id,
        username,
        tenant_id: claims.tid,
        authority: authority.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::make_token;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use url::Url;

    /// Plays the browser: follows the authorization URL straight back to the
    /// loopback redirect with a code and the issued state.
    fn redirect_with_code(auth_url: &str) -> std::io::Result<()> {
        let url = Url::parse(auth_url).map_err(std::io::Error::other)?;
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        let redirect = Url::parse(&params["redirect_uri"]).map_err(std::io::Error::other)?;
        let port = redirect.port().unwrap_or(80);
        let path = format!("/?code=code-1&state={}", params["state"]);
        std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
            write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
            let mut reply = String::new();
            let _ = stream.read_to_string(&mut reply);
        });
        Ok(())
    }

    fn response(id_token: Option<String>, access_token: &str) -> TokenResponse {
        TokenResponse {
            access_token: access_token.to_string(),
            token_type: "Bearer".into(),
            expires_in: 3600,
            refresh_token: Some("rt".into()),
            id_token,
            scope: String::new(),
        }
    }

    #[test]
    fn test_account_from_id_token() {
        let id_token = make_token(&json!({
            "oid": "oid-1",
            "tid": "tid-1",
            "preferred_username": "alice@contoso.com"
        }));
        let account = account_from_response(
            &response(Some(id_token), "opaque"),
            None,
            "https://login.microsoftonline.com/common",
        )
        .unwrap();
        assert_eq!(account.home_account_id, "oid-1.tid-1");
        assert_eq!(account.username, "alice@contoso.com");
        assert_eq!(account.tenant_id.as_deref(), Some("tid-1"));
    }

    #[test]
    fn test_account_falls_back_to_login_hint() {
        let account = account_from_response(
            &response(None, "opaque"),
            Some("Bob@Contoso.com"),
            "https://login.microsoftonline.com/common",
        )
        .unwrap();
        assert_eq!(account.username, "Bob@Contoso.com");
        assert_eq!(account.home_account_id, "bob@contoso.com");

        assert!(account_from_response(&response(None, "opaque"), None, "x").is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_an_inline_error() {
        let dir = tempfile::tempdir().unwrap();
        let flow = BrowserInteractiveFlow::new(
            CredentialCache::in_memory(dir.path()),
            "client",
            "http://127.0.0.1:9/common",
        )
        .with_opener(|_| Ok(()));
        let client = OAuth2Client::new("client", "http://127.0.0.1:9/common").unwrap();
        let request = InteractiveRequest {
            scopes: vec!["https://graph.microsoft.com/.default".into()],
            login_hint: None,
            prompt: None,
            domain_hint: None,
            timeout: Duration::from_millis(50),
        };

        let err = flow.sign_in(&client, &request).await.unwrap_err();
        assert!(matches!(err, AuthError::CallbackTimeout));
        assert_eq!(
            TokenResult::from_auth_error(&err),
            TokenResult::error("timeout", "OAuth callback timeout")
        );
    }

    #[tokio::test]
    async fn test_code_is_exchanged_and_account_cached() {
        let server = MockServer::start_async().await;
        let id_token = make_token(&json!({
            "oid": "oid-1",
            "tid": "tid-1",
            "preferred_username": "alice@contoso.com"
        }));
        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/contoso.onmicrosoft.com/oauth2/v2.0/token")
                    .body_includes("grant_type=authorization_code")
                    .body_includes("code=code-1")
                    .body_includes("code_verifier=");
                then.status(200).json_body(json!({
                    "access_token": "at-1",
                    "token_type": "Bearer",
                    "expires_in": 3600,
                    "refresh_token": "rt-1",
                    "id_token": id_token,
                    "scope": "https://graph.microsoft.com/.default openid profile"
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = CredentialCache::in_memory(dir.path());
        let authority = server.url("/contoso.onmicrosoft.com");
        let flow = BrowserInteractiveFlow::new(cache.clone(), "client", &authority)
            .with_opener(redirect_with_code);
        let request = InteractiveRequest {
            scopes: vec!["https://graph.microsoft.com/.default".into()],
            login_hint: Some("alice@contoso.com".into()),
            prompt: None,
            domain_hint: None,
            timeout: Duration::from_secs(5),
        };

        let result = flow.acquire_interactive(&request).await.unwrap();
        assert_eq!(
            result,
            TokenResult::success(
                "at-1",
                Some(vec!["https://graph.microsoft.com/.default".to_string()])
            )
        );
        token.assert_async().await;

        let data: TokenCacheData = cache.load(OAUTH_CACHE_KEY).unwrap().unwrap();
        let accounts = data.accounts_for("alice@contoso.com");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].home_account_id, "oid-1.tid-1");
        assert_eq!(data.refresh_token_for(&accounts[0], "client"), Some("rt-1"));
    }
}
