//! Browser-harvested session credentials for the Forms web API.
//!
//! The session cookie and anti-forgery token are reused from the cache while
//! the cookie outlives the safety margin. Otherwise a headless browser is
//! tried first, which succeeds when the browser profile still holds a sign-in,
//! and a visible browser is opened for the user when it does not.

use super::antiforgery::{extract_antiforgery_token, DEFAULT_ANTIFORGERY_REGEX};
use super::session::HttpSession;
use crate::auth::claims::{decode_claims, DecodedClaims};
use crate::auth::token_manager::BearerTokenProvider;
use crate::browser::{BrowserCookie, BrowserDriver, BrowserLauncher, ChromeLauncher, ChromeSettings};
use crate::cache::{CredentialCache, SecureString, StoreLock, COOKIE_CACHE_KEY};
use crate::config::Config;
use crate::error::{AppError, AuthError};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const FORMS_LOGIN_URL: &str = "https://forms.office.com/Pages/DesignPageV2.aspx?origin=Marketing";
const OFFICE_LOGIN_URL: &str = "https://www.office.com/login?es=Click&ru=%2F";
const SESSION_COOKIE: &str = "OIDCAuth.forms";
const ANTIFORGERY_HEADER: &str = "__RequestVerificationToken";
const TOKEN_REQUEST_PATTERN: &str = "search/_api/SP.OAuth.Token/Acquire";

/// Interval between page-source reads while waiting for the anti-forgery token.
const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Session cookies plus the anti-forgery token scraped alongside them.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieCredential {
    pub cookies: Vec<BrowserCookie>,
    pub antiforgery_token: String,
}

impl std::fmt::Debug for CookieCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|c| c.name.as_str()).collect();
        f.debug_struct("CookieCredential")
            .field("cookies", &names)
            .field("antiforgery_token", &"[REDACTED]")
            .finish()
    }
}

impl CookieCredential {
    pub fn cookie(&self, name: &str) -> Option<&BrowserCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }
}

/// Bearer token read from an intercepted token response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedBearer {
    pub access_token: SecureString,
    /// Seconds since the epoch, from the token's `exp` claim.
    #[serde(default)]
    pub expires_on: Option<i64>,
}

/// Cookie cache entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CookieCacheEntry {
    #[serde(default)]
    forms: Option<CookieCredential>,
    #[serde(default)]
    bearer: Option<CapturedBearer>,
}

/// Where and how long to look.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub login_url: String,
    pub session_cookie: String,
    pub antiforgery_header: String,
    pub antiforgery_pattern: Regex,
    /// Cached cookies expiring within this margin are not reused.
    pub expiry_margin: Duration,
    pub headless_timeout: Duration,
    pub interactive_timeout: Duration,
    pub office_login_url: String,
    pub token_request_pattern: String,
    pub capture_timeout: Duration,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            login_url: FORMS_LOGIN_URL.to_string(),
            session_cookie: SESSION_COOKIE.to_string(),
            antiforgery_header: ANTIFORGERY_HEADER.to_string(),
            antiforgery_pattern: DEFAULT_ANTIFORGERY_REGEX.clone(),
            expiry_margin: Duration::from_secs(60),
            headless_timeout: Duration::from_secs(5),
            interactive_timeout: Duration::from_secs(120),
            office_login_url: OFFICE_LOGIN_URL.to_string(),
            token_request_pattern: TOKEN_REQUEST_PATTERN.to_string(),
            capture_timeout: Duration::from_secs(200),
        }
    }
}

impl HarvestSettings {
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let forms = &config.forms;
        let office = &config.office;
        let antiforgery_pattern = Regex::new(&forms.antiforgery_pattern)
            .map_err(|e| AppError::Config(format!("Invalid anti-forgery pattern: {}", e)))?;

        Ok(Self {
            login_url: forms.login_url.clone(),
            session_cookie: forms.session_cookie.clone(),
            antiforgery_header: forms.antiforgery_header.clone(),
            antiforgery_pattern,
            expiry_margin: Duration::from_secs(forms.expiry_margin_seconds),
            headless_timeout: Duration::from_secs(forms.headless_timeout_seconds),
            interactive_timeout: Duration::from_secs(forms.interactive_timeout_seconds),
            office_login_url: office.login_url.clone(),
            token_request_pattern: office.token_request_pattern.clone(),
            capture_timeout: Duration::from_secs(office.capture_timeout_seconds),
        })
    }
}

/// Obtains, validates and persists browser session credentials.
pub struct CookieSessionHarvester {
    launcher: Arc<dyn BrowserLauncher>,
    cache: CredentialCache,
    settings: HarvestSettings,
}

impl CookieSessionHarvester {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        cache: CredentialCache,
        settings: HarvestSettings,
    ) -> Self {
        Self {
            launcher,
            cache,
            settings,
        }
    }

    /// Harvester driving Chrome as configured.
    pub fn from_config(config: &Config, cache: CredentialCache) -> Result<Self, AppError> {
        let launcher = ChromeLauncher::new(ChromeSettings::from(&config.browser));
        Ok(Self::new(
            Arc::new(launcher),
            cache,
            HarvestSettings::from_config(config)?,
        ))
    }

    pub fn settings(&self) -> &HarvestSettings {
        &self.settings
    }

    /// An HTTP session carrying the harvested cookies and anti-forgery header.
    ///
    /// `fresh` skips the cache and always drives the browser.
    pub async fn harvest(&self, fresh: bool) -> Result<HttpSession, AppError> {
        let credential = self.credential(fresh).await?;
        HttpSession::assemble(&credential, &self.settings.antiforgery_header)
    }

    /// True while the session cookie outlives the expiry margin. A cookie
    /// without an expiry cannot be checked and is not trusted.
    pub fn is_valid(&self, credential: &CookieCredential) -> bool {
        if credential.antiforgery_token.is_empty() {
            return false;
        }
        let margin = self.settings.expiry_margin.as_secs() as i64;
        credential
            .cookie(&self.settings.session_cookie)
            .and_then(|c| c.expiry)
            .map(|expiry| expiry > Utc::now().timestamp() + margin)
            .unwrap_or(false)
    }

    pub(crate) async fn credential(&self, fresh: bool) -> Result<CookieCredential, AppError> {
        if !fresh {
            if let Some(credential) = self.cached_credential()? {
                debug!("Reusing cached {} cookie", self.settings.session_cookie);
                return Ok(credential);
            }
        }

        let lock = self.cache.lock(COOKIE_CACHE_KEY).await?;
        // Another process may have harvested while we waited for the lock
        if !fresh {
            if let Some(credential) = self.cached_credential()? {
                return Ok(credential);
            }
        }

        let credential = match self.capture(true, self.settings.headless_timeout).await? {
            Some(credential) => credential,
            None => {
                info!(
                    "No {} cookie from headless browser; opening browser for sign-in",
                    self.settings.session_cookie
                );
                match self.capture(false, self.settings.interactive_timeout).await? {
                    Some(credential) => credential,
                    None => {
                        error!(
                            "Timed out waiting for {} cookie",
                            self.settings.session_cookie
                        );
                        return Err(AuthError::CookieHarvestTimeout {
                            cookie: self.settings.session_cookie.clone(),
                            seconds: self.settings.interactive_timeout.as_secs(),
                        }
                        .into());
                    }
                }
            }
        };

        self.write_entry(&lock, |entry| entry.forms = Some(credential.clone()))?;
        info!("Harvested {} cookies", credential.cookies.len());
        Ok(credential)
    }

    fn cached_credential(&self) -> Result<Option<CookieCredential>, AppError> {
        let entry: CookieCacheEntry = self.cache.load(COOKIE_CACHE_KEY)?.unwrap_or_default();
        Ok(entry.forms.filter(|c| self.is_valid(c)))
    }

    fn write_entry(
        &self,
        lock: &StoreLock,
        f: impl FnOnce(&mut CookieCacheEntry),
    ) -> Result<(), AppError> {
        let mut entry: CookieCacheEntry = self.cache.load(COOKIE_CACHE_KEY)?.unwrap_or_default();
        f(&mut entry);
        self.cache.write(lock, COOKIE_CACHE_KEY, &entry)
    }

    /// One browser attempt. The browser is closed whatever the outcome.
    async fn capture(
        &self,
        headless: bool,
        timeout: Duration,
    ) -> Result<Option<CookieCredential>, AppError> {
        let driver = self.launcher.launch(headless).await?;
        let outcome = self.capture_with(driver.as_ref(), timeout).await;
        close_quietly(driver.as_ref()).await;
        outcome
    }

    async fn capture_with(
        &self,
        driver: &dyn BrowserDriver,
        timeout: Duration,
    ) -> Result<Option<CookieCredential>, AppError> {
        driver.navigate(&self.settings.login_url).await?;
        if driver
            .wait_for_cookie(&self.settings.session_cookie, timeout)
            .await?
            .is_none()
        {
            return Ok(None);
        }

        let cookies = driver.get_cookies().await?;
        let antiforgery_token = self.scrape_token(driver).await?;
        Ok(Some(CookieCredential {
            cookies,
            antiforgery_token,
        }))
    }

    /// The page may still be rendering when the cookie lands.
    async fn scrape_token(&self, driver: &dyn BrowserDriver) -> Result<String, AppError> {
        let deadline = Instant::now() + self.settings.headless_timeout;
        loop {
            let source = driver.page_source().await?;
            match extract_antiforgery_token(&source, &self.settings.antiforgery_pattern) {
                Ok(token) => return Ok(token),
                Err(e) if Instant::now() >= deadline => {
                    warn!("Signed in, but no anti-forgery token found in page");
                    return Err(e.into());
                }
                Err(_) => sleep(SOURCE_POLL_INTERVAL).await,
            }
        }
    }

    /// Bearer token issued to the Office web app, captured from its token
    /// request. Reused from the cache while unexpired.
    pub async fn capture_bearer_token(&self) -> Result<CapturedBearer, AppError> {
        if let Some(bearer) = self.cached_bearer()? {
            debug!("Reusing cached bearer token");
            return Ok(bearer);
        }

        let lock = self.cache.lock(COOKIE_CACHE_KEY).await?;
        let driver = self.launcher.launch(false).await?;
        let outcome = self.bearer_with(driver.as_ref()).await;
        close_quietly(driver.as_ref()).await;
        let bearer = outcome?;

        self.write_entry(&lock, |entry| entry.bearer = Some(bearer.clone()))?;
        info!("Captured bearer token from {}", self.settings.token_request_pattern);
        Ok(bearer)
    }

    async fn bearer_with(&self, driver: &dyn BrowserDriver) -> Result<CapturedBearer, AppError> {
        driver.navigate(&self.settings.office_login_url).await?;
        let request = driver
            .wait_for_request(
                &self.settings.token_request_pattern,
                self.settings.capture_timeout,
            )
            .await?;
        parse_bearer(&request.body, &request.url)
    }

    fn cached_bearer(&self) -> Result<Option<CapturedBearer>, AppError> {
        let entry: CookieCacheEntry = self.cache.load(COOKIE_CACHE_KEY)?.unwrap_or_default();
        let not_before = Utc::now().timestamp() + self.settings.expiry_margin.as_secs() as i64;
        Ok(entry
            .bearer
            .filter(|b| b.expires_on.map(|e| e > not_before).unwrap_or(false)))
    }

    /// Claims (`upn`, `aud`, ...) of the captured bearer token.
    pub async fn bearer_claims(&self) -> Result<DecodedClaims, AppError> {
        let bearer = self.capture_bearer_token().await?;
        Ok(decode_claims(bearer.access_token.as_str())?)
    }

    /// Erase every cached credential, OAuth tokens included.
    pub async fn clear_cache(&self) -> Result<(), AppError> {
        self.cache.clear().await
    }
}

#[async_trait]
impl BearerTokenProvider for CookieSessionHarvester {
    async fn bearer_token(&self) -> Result<SecureString, AppError> {
        Ok(self.capture_bearer_token().await?.access_token)
    }
}

async fn close_quietly(driver: &dyn BrowserDriver) {
    if let Err(e) = driver.close().await {
        warn!("Failed to close browser: {}", e);
    }
}

/// Token field names seen in token acquisition responses.
const TOKEN_FIELDS: [&str; 3] = ["access_token", "accessToken", "AccessToken"];

fn parse_bearer(body: &str, url: &str) -> Result<CapturedBearer, AppError> {
    let not_captured = || AuthError::BearerNotCaptured(url.to_string());
    let value: Value = serde_json::from_str(body).map_err(|_| not_captured())?;
    let token = TOKEN_FIELDS
        .iter()
        .find_map(|field| value[field].as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(not_captured)?;

    let expires_on = decode_claims(token).ok().and_then(|c| c.exp);
    Ok(CapturedBearer {
        access_token: SecureString::from(token),
        expires_on,
    })
}
