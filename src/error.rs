//! Error types for the o365creds crate.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Credential cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Authentication-related errors.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("OAuth2 authorization failed: {0}")]
    OAuthFailed(String),

    #[error("Invalid authorization code")]
    InvalidAuthCode,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("State validation failed (possible CSRF attack)")]
    StateValidationFailed,

    #[error("OAuth callback timeout")]
    CallbackTimeout,

    #[error("{error}: {description}")]
    Rejected {
        error: String,
        description: String,
        suberror: Option<String>,
    },

    #[error("Malformed access token: {0}")]
    InvalidToken(String),

    #[error("Cookie {cookie} not captured within {seconds} seconds")]
    CookieHarvestTimeout { cookie: String, seconds: u64 },

    #[error("Anti-forgery token not found in page source")]
    AntiForgeryTokenNotFound,

    #[error("No bearer token captured from {0}")]
    BearerNotCaptured(String),
}

/// Persisted credential store errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to store entry: {0}")]
    StoreFailed(String),

    #[error("Failed to retrieve entry: {0}")]
    RetrieveFailed(String),

    #[error("Failed to delete entry: {0}")]
    DeleteFailed(String),

    #[error("Cache entry {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Timed out waiting for cache lock {0}")]
    LockTimeout(String),
}

/// Browser automation errors.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Failed to launch browser driver: {0}")]
    LaunchFailed(String),

    #[error("Failed to create browser session: {0}")]
    SessionFailed(String),

    #[error("WebDriver command {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Timed out after {seconds}s waiting for request matching {pattern}")]
    RequestTimeout { pattern: String, seconds: u64 },

    #[error("Browser session already closed")]
    Closed,
}

/// Errors reported by remote services called through an authenticated session.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Request failed: HTTP {status}")]
    RequestFailed { status: u16, body: String },

    #[error("AntiForgery token validation error")]
    AntiForgeryValidation,

    #[error("Unauthorized (401): Session may be expired")]
    Unauthorized,

    #[error("Failed to parse API response: {0}")]
    ParseFailed(String),
}

impl AppError {
    /// Returns a user-friendly message for display on the terminal.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Auth(AuthError::OAuthFailed(_)) => "Sign-in failed. Please try again.",
            Self::Auth(AuthError::Rejected { .. }) => "Sign-in failed. Please try again.",
            Self::Auth(AuthError::TokenRefreshFailed(_)) => {
                "Session expired. Please sign in again."
            }
            Self::Auth(AuthError::StateValidationFailed) => {
                "Security error. Please try signing in again."
            }
            Self::Auth(AuthError::CallbackTimeout) => "Sign-in timed out. Please try again.",
            Self::Auth(AuthError::CookieHarvestTimeout { .. }) => {
                "Browser sign-in timed out. Please try again."
            }
            Self::Auth(AuthError::AntiForgeryTokenNotFound) => {
                "Signed in, but the page layout was not recognised."
            }
            Self::Cache(CacheError::StoreFailed(_)) => "Failed to save credentials securely.",
            Self::Cache(CacheError::LockTimeout(_)) => {
                "Credential cache is busy. Is another sign-in running?"
            }
            Self::Browser(BrowserError::LaunchFailed(_)) => {
                "Could not start the browser. Check the chromedriver settings."
            }
            Self::Api(ApiError::Unauthorized) => "Authentication expired. Sign in again.",
            Self::Api(ApiError::AntiForgeryValidation) => "Session rejected. Sign in again.",
            Self::Network(_) => "Network error. Check your connection.",
            Self::Config(_) => "Configuration error. Please check settings.",
            Self::Csv(_) => "Could not read or write a client ID CSV file.",
            _ => "An error occurred. Please try again.",
        }
    }

    /// Returns true if this error can only be cleared by a fresh interactive sign-in.
    pub fn requires_interactive(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::TokenRefreshFailed(_))
                | Self::Auth(AuthError::InvalidToken(_))
                | Self::Api(ApiError::Unauthorized)
                | Self::Api(ApiError::AntiForgeryValidation)
        )
    }
}
