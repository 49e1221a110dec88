//! OAuth2 public-client calls against the Microsoft identity platform.

use crate::cache::token_cache::RESERVED_SCOPES;
use crate::cache::SecureString;
use crate::error::{AppError, AuthError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (stored locally, sent in token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 hash of verifier, sent in auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        // Generate 32 random bytes for the verifier
        let mut rng = rand::thread_rng();
        let verifier_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&verifier_bytes);

        // Create challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional knobs for the authorization request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeOptions {
    pub login_hint: Option<String>,
    pub prompt: Option<String>,
    pub domain_hint: Option<String>,
}

/// Token response from the identity platform.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Space-delimited scopes actually granted.
    #[serde(default)]
    pub scope: String,
}

impl TokenResponse {
    /// Granted scopes, without the reserved OpenID ones.
    pub fn granted_scopes(&self) -> Vec<String> {
        self.scope
            .split_whitespace()
            .filter(|s| !RESERVED_SCOPES.iter().any(|r| r.eq_ignore_ascii_case(s)))
            .map(str::to_string)
            .collect()
    }
}

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
    suberror: Option<String>,
}

impl From<ErrorResponse> for AuthError {
    fn from(e: ErrorResponse) -> Self {
        AuthError::Rejected {
            error: e.error,
            description: e.error_description,
            suberror: e.suberror,
        }
    }
}

/// Outcome of a token acquisition.
///
/// Failures are values here rather than `Err`, so the escalation logic can
/// inspect them and decide whether to try the next mechanism.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenResult {
    Success {
        access_token: SecureString,
        /// Granted scopes; only present for tokens minted by the server
        /// during this call, never for tokens served from the cache.
        scopes: Option<Vec<String>>,
    },
    Error {
        error: String,
        description: String,
        suberror: Option<String>,
    },
}

impl TokenResult {
    pub fn success(access_token: impl Into<SecureString>, scopes: Option<Vec<String>>) -> Self {
        Self::Success {
            access_token: access_token.into(),
            scopes,
        }
    }

    pub fn error(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            description: description.into(),
            suberror: None,
        }
    }

    /// Result for a token freshly returned by the token endpoint.
    pub fn from_response(response: &TokenResponse) -> Self {
        Self::success(response.access_token.as_str(), Some(response.granted_scopes()))
    }

    /// Fold an acquisition failure into an inline error result.
    pub fn from_auth_error(err: &AuthError) -> Self {
        match err {
            AuthError::Rejected {
                error,
                description,
                suberror,
            } => Self::Error {
                error: error.clone(),
                description: description.clone(),
                suberror: suberror.clone(),
            },
            AuthError::CallbackTimeout => Self::error("timeout", err.to_string()),
            AuthError::StateValidationFailed => Self::error("state_mismatch", err.to_string()),
            other => Self::error("request_failed", other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn access_token(&self) -> Option<&str> {
        match self {
            Self::Success { access_token, .. } => Some(access_token.as_str()),
            Self::Error { .. } => None,
        }
    }

    pub fn scopes(&self) -> Option<&[String]> {
        match self {
            Self::Success { scopes, .. } => scopes.as_deref(),
            Self::Error { .. } => None,
        }
    }

    /// Convert into `Err` for callers that need a credential or nothing.
    pub fn into_auth_result(self) -> Result<SecureString, AuthError> {
        match self {
            Self::Success { access_token, .. } => Ok(access_token),
            Self::Error {
                error,
                description,
                suberror,
            } => Err(AuthError::Rejected {
                error,
                description,
                suberror,
            }),
        }
    }
}

/// OAuth2 public client bound to one authority.
pub struct OAuth2Client {
    client_id: String,
    authority: String,
    http_client: reqwest::Client,
}

impl OAuth2Client {
    /// Create a new client for `authority` (e.g. `https://login.microsoftonline.com/common`).
    pub fn new(client_id: &str, authority: &str) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client_id: client_id.to_string(),
            authority: authority.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn token_endpoint(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    /// Generate the authorization URL for browser-based sign-in.
    ///
    /// Returns the URL and a CSRF state token that must be verified in the callback.
    pub fn generate_auth_url(
        &self,
        scopes: &[String],
        redirect_uri: &str,
        pkce: &PkceChallenge,
        options: &AuthorizeOptions,
    ) -> Result<(Url, String), AuthError> {
        // Generate random state for CSRF protection
        let mut rng = rand::thread_rng();
        let state_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        let state = URL_SAFE_NO_PAD.encode(&state_bytes);

        let auth_endpoint = format!("{}/oauth2/v2.0/authorize", self.authority);
        let mut url =
            Url::parse(&auth_endpoint).map_err(|e| AuthError::OAuthFailed(e.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_mode", "query")
                .append_pair("scope", &request_scope(scopes))
                .append_pair("state", &state)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(hint) = &options.login_hint {
                query.append_pair("login_hint", hint);
            }
            if let Some(prompt) = &options.prompt {
                query.append_pair("prompt", prompt);
            }
            if let Some(domain) = &options.domain_hint {
                query.append_pair("domain_hint", domain);
            }
        }

        Ok((url, state))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        let scope = request_scope(scopes);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", pkce_verifier),
            ("scope", scope.as_str()),
        ];

        self.post_token_request(&params, AuthError::TokenExchangeFailed)
            .await
    }

    /// Redeem a refresh token for a new access token.
    pub async fn refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        let scope = request_scope(scopes);
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];

        self.post_token_request(&params, AuthError::TokenRefreshFailed)
            .await
    }

    async fn post_token_request(
        &self,
        params: &[(&str, &str)],
        transport_error: fn(String) -> AuthError,
    ) -> Result<TokenResponse, AuthError> {
        let response = self
            .http_client
            .post(self.token_endpoint())
            .header("client-request-id", uuid::Uuid::new_v4().to_string())
            .form(params)
            .send()
            .await
            .map_err(|e| transport_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // The identity platform reports grant failures as a JSON error body
            if let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) {
                debug!(
                    "Token endpoint rejected request: error='{}' suberror='{}'",
                    err.error,
                    err.suberror.as_deref().unwrap_or("")
                );
                return Err(err.into());
            }
            error!("Token request failed: HTTP {}", status);
            return Err(transport_error(format!("HTTP {}", status.as_u16())));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| transport_error(e.to_string()))
    }
}

/// Scope parameter: requested scopes plus the OpenID scopes needed for an
/// id token and a refresh token.
fn request_scope(scopes: &[String]) -> String {
    let mut all: Vec<&str> = scopes.iter().map(String::as_str).collect();
    for reserved in RESERVED_SCOPES {
        if !all.iter().any(|s| s.eq_ignore_ascii_case(reserved)) {
            all.push(reserved);
        }
    }
    all.join(" ")
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<(String, String), AuthError> {
    let url = Url::parse(url_string).map_err(|_| AuthError::InvalidAuthCode)?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    // Check for error response
    if let Some(error) = params.get("error") {
        return Err(AuthError::Rejected {
            error: error.to_string(),
            description: params
                .get("error_description")
                .map(|s| s.to_string())
                .unwrap_or_default(),
            suberror: params.get("error_subcode").map(|s| s.to_string()),
        });
    }

    let code = params
        .get("code")
        .ok_or(AuthError::InvalidAuthCode)?
        .to_string();

    let state = params
        .get("state")
        .ok_or(AuthError::StateValidationFailed)?
        .to_string();

    Ok((code, state))
}
