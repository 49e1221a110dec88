//! Browser automation behind a small capability interface.
//!
//! The cookie harvester only needs to navigate, read cookies, watch network
//! traffic and read the rendered page. [`webdriver`] implements this against
//! chromedriver.

pub mod webdriver;

use crate::error::BrowserError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub use webdriver::{ChromeLauncher, ChromeSettings};

/// Interval between cookie polls.
const COOKIE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Cookie as reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Seconds since the epoch; absent for session cookies.
    #[serde(default)]
    pub expiry: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

/// A network response observed while the page was loading.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedRequest {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// One controlled browser window.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn get_cookie(&self, name: &str) -> Result<Option<BrowserCookie>, BrowserError>;

    /// Every cookie visible to the current page.
    async fn get_cookies(&self) -> Result<Vec<BrowserCookie>, BrowserError>;

    /// Poll for `name` until it shows up or `timeout` passes.
    async fn wait_for_cookie(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<BrowserCookie>, BrowserError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(cookie) = self.get_cookie(name).await? {
                return Ok(Some(cookie));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(COOKIE_POLL_INTERVAL).await;
        }
    }

    /// Wait for a response whose URL contains `pattern` and return its body.
    async fn wait_for_request(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<CapturedRequest, BrowserError>;

    async fn page_source(&self) -> Result<String, BrowserError>;

    /// End the session. Further calls fail with [`BrowserError::Closed`].
    async fn close(&self) -> Result<(), BrowserError>;
}

/// Starts browser sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserDriver>, BrowserError>;
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;

    #[test]
    fn test_cookie_wire_format() {
        let cookie: BrowserCookie = serde_json::from_str(
            r#"{"name":"OIDCAuth.forms","value":"v","domain":".forms.office.com",
                "path":"/","expiry":1700000000,"secure":true,"httpOnly":true,"sameSite":"None"}"#,
        )
        .unwrap();
        assert!(cookie.http_only);
        assert_eq!(cookie.expiry, Some(1_700_000_000));

        let bare: BrowserCookie = serde_json::from_str(r#"{"name":"a","value":"b"}"#).unwrap();
        assert_eq!(bare.expiry, None);
        assert!(!bare.secure);
    }

    #[tokio::test]
    async fn test_wait_for_cookie_gives_up() {
        let launcher = FakeLauncher::default();
        let driver = launcher.launch(true).await.unwrap();
        let found = driver
            .wait_for_cookie("missing", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(found.is_none());

        let launcher = FakeLauncher {
            headless: Script {
                cookies: vec![cookie("present", "1", None)],
                ..Script::default()
            },
            ..FakeLauncher::default()
        };
        let driver = launcher.launch(true).await.unwrap();
        let found = driver
            .wait_for_cookie("present", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.value), Some("1".to_string()));
    }
}
