//! Configuration loading and management.
//!
//! Loads configuration from embedded config.toml with environment variable overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    pub browser: BrowserConfig,
    pub forms: FormsConfig,
    pub office: OfficeConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub tenant: String,
    pub email: String,
    #[serde(default)]
    pub server: Option<String>,
    pub permissions: Vec<String>,
    pub interactive_timeout_seconds: u64,
    #[serde(default)]
    pub callback_port: u16,
}

impl OAuthConfig {
    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    #[serde(default)]
    pub chromedriver_path: Option<PathBuf>,
    #[serde(default)]
    pub binary_path: Option<PathBuf>,
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
    #[serde(default)]
    pub blocked_url_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormsConfig {
    pub login_url: String,
    pub api_base_url: String,
    pub session_cookie: String,
    pub antiforgery_header: String,
    pub antiforgery_pattern: String,
    pub expiry_margin_seconds: u64,
    pub headless_timeout_seconds: u64,
    pub interactive_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfficeConfig {
    pub login_url: String,
    pub token_request_pattern: String,
    pub capture_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub backend: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    pub lock_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Load configuration from embedded config.toml with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::defaults()?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// The embedded configuration, without overrides or validation.
    pub fn defaults() -> Result<Self> {
        toml::from_str(CONFIG_TOML).context("Failed to parse embedded config.toml")
    }

    fn apply_env(&mut self) {
        if let Ok(client_id) = env::var("O365_CLIENT_ID") {
            self.oauth.client_id = client_id;
        }

        if let Ok(tenant) = env::var("O365_TENANT") {
            self.oauth.tenant = tenant;
        }

        if let Ok(email) = env::var("O365_EMAIL") {
            self.oauth.email = email;
        }

        if let Ok(server) = env::var("O365_SERVER") {
            self.oauth.server = Some(server).filter(|s| !s.is_empty());
        }

        if let Ok(scopes) = env::var("O365_SCOPES") {
            self.oauth.permissions = split_list(&scopes);
        }

        if let Some(timeout) = env::var("O365_INTERACTIVE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.oauth.interactive_timeout_seconds = timeout;
        }

        if let Ok(binary) = env::var("O365_CHROME_BINARY") {
            self.browser.binary_path = Some(binary.into());
        }

        if let Ok(profile) = env::var("O365_CHROME_PROFILE") {
            self.browser.profile_path = Some(profile.into());
        }

        if let Ok(driver) = env::var("O365_CHROMEDRIVER") {
            self.browser.chromedriver_path = Some(driver.into());
        }

        if let Ok(webdriver_url) = env::var("O365_WEBDRIVER_URL") {
            self.browser.webdriver_url = webdriver_url;
        }

        if let Ok(dir) = env::var("O365_CACHE_DIR") {
            self.cache.dir = Some(dir.into());
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    /// Validate settings every command depends on.
    fn validate(&self) -> Result<()> {
        if self.oauth.interactive_timeout_seconds == 0 {
            anyhow::bail!("oauth.interactive_timeout_seconds must be greater than zero");
        }

        regex::Regex::new(&self.forms.antiforgery_pattern)
            .context("forms.antiforgery_pattern is not a valid regular expression")?;

        Ok(())
    }

    /// Check the principal settings needed to request OAuth tokens. Only
    /// commands that sign in through Entra ID call this; the browser-based
    /// Forms commands run without them.
    pub fn require_oauth(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() || self.oauth.client_id == "YOUR_CLIENT_ID" {
            anyhow::bail!(
                "client_id not configured. Set O365_CLIENT_ID environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.tenant.is_empty() || self.oauth.tenant == "YOUR_TENANT" {
            anyhow::bail!(
                "tenant not configured. Set O365_TENANT environment variable \
                 or update config.toml"
            );
        }

        if self.oauth.email.is_empty() || self.oauth.email == "YOUR_EMAIL" {
            anyhow::bail!(
                "email not configured. Set O365_EMAIL environment variable \
                 or update config.toml"
            );
        }

        Ok(())
    }
}

/// Split a comma or whitespace separated list.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
