//! W3C WebDriver client for Chrome via chromedriver.
//!
//! Network traffic is observed through Chrome's performance log, and response
//! bodies plus URL blocking go through the chromedriver CDP bridge
//! (`/goog/cdp/execute`).

use super::{BrowserCookie, BrowserDriver, BrowserLauncher, CapturedRequest};
use crate::config::BrowserConfig;
use crate::error::BrowserError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// HTTP request timeout for driver commands.
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a spawned chromedriver gets to report ready.
const DRIVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between performance log polls.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How to start Chrome sessions.
#[derive(Debug, Clone, Default)]
pub struct ChromeSettings {
    /// Where a running chromedriver listens. Ignored when `chromedriver_path` is set.
    pub webdriver_url: String,
    /// Spawn this chromedriver binary instead of connecting to `webdriver_url`.
    pub chromedriver_path: Option<PathBuf>,
    pub binary_path: Option<PathBuf>,
    pub profile_path: Option<PathBuf>,
    pub blocked_url_patterns: Vec<String>,
}

impl From<&BrowserConfig> for ChromeSettings {
    fn from(config: &BrowserConfig) -> Self {
        Self {
            webdriver_url: config.webdriver_url.clone(),
            chromedriver_path: config.chromedriver_path.clone(),
            binary_path: config.binary_path.clone(),
            profile_path: config.profile_path.clone(),
            blocked_url_patterns: config.blocked_url_patterns.clone(),
        }
    }
}

impl ChromeSettings {
    /// New-session payload for the requested mode.
    fn capabilities(&self, headless: bool) -> Value {
        let mut args = vec!["--no-first-run".to_string(), "--disable-gpu".to_string()];
        if headless {
            args.push("--headless=new".to_string());
        }
        if let Some(profile) = &self.profile_path {
            args.push(format!("--user-data-dir={}", profile.display()));
        }

        let mut chrome_options = json!({ "args": args });
        if let Some(binary) = &self.binary_path {
            chrome_options["binary"] = json!(binary.display().to_string());
        }

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": chrome_options,
                    "goog:loggingPrefs": { "performance": "ALL" }
                }
            }
        })
    }
}

/// Thin HTTP client for a WebDriver endpoint.
#[derive(Clone)]
struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    #[serde(default)]
    message: String,
}

impl WebDriverClient {
    fn new(base_url: &str) -> Result<Self, BrowserError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Send a command and return the status with the `value` member of the reply.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), BrowserError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let command_error = |message: String| BrowserError::Command {
            command: path.to_string(),
            message,
        };
        let response = request.send().await.map_err(|e| command_error(e.to_string()))?;
        let status = response.status();
        let mut reply: Value = response
            .json()
            .await
            .map_err(|e| command_error(e.to_string()))?;
        Ok((status, reply["value"].take()))
    }

    async fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, BrowserError> {
        let (status, value) = self.execute(method, path, body).await?;
        if status.is_success() {
            return Ok(value);
        }
        Err(BrowserError::Command {
            command: path.to_string(),
            message: describe_error(status, &value),
        })
    }
}

fn describe_error(status: StatusCode, value: &Value) -> String {
    match serde_json::from_value::<WireError>(value.clone()) {
        Ok(e) => format!("{}: {}", e.error, e.message.lines().next().unwrap_or("")),
        Err(_) => format!("HTTP {}", status.as_u16()),
    }
}

/// chromedriver child process; killed when dropped.
struct DriverProcess {
    _child: Child,
    url: String,
}

impl DriverProcess {
    async fn spawn(path: &Path) -> Result<Self, BrowserError> {
        let port = std::net::TcpListener::bind(("127.0.0.1", 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        let child = Command::new(path)
            .arg(format!("--port={}", port))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BrowserError::LaunchFailed(format!("{}: {}", path.display(), e))
            })?;
        let url = format!("http://127.0.0.1:{}", port);
        info!("Started chromedriver on port {}", port);

        let client = WebDriverClient::new(&url)?;
        let deadline = Instant::now() + DRIVER_STARTUP_TIMEOUT;
        loop {
            if let Ok(status) = client.command(Method::GET, "/status", None).await {
                if status["ready"].as_bool().unwrap_or(true) {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::LaunchFailed(
                    "chromedriver did not become ready".into(),
                ));
            }
            sleep(Duration::from_millis(100)).await;
        }

        Ok(Self { _child: child, url })
    }
}

/// Launches Chrome sessions through chromedriver.
pub struct ChromeLauncher {
    settings: ChromeSettings,
    driver: tokio::sync::Mutex<Option<DriverProcess>>,
}

impl ChromeLauncher {
    pub fn new(settings: ChromeSettings) -> Self {
        Self {
            settings,
            driver: tokio::sync::Mutex::new(None),
        }
    }

    async fn endpoint(&self) -> Result<String, BrowserError> {
        let Some(path) = &self.settings.chromedriver_path else {
            return Ok(self.settings.webdriver_url.clone());
        };
        let mut driver = self.driver.lock().await;
        if driver.is_none() {
            *driver = Some(DriverProcess::spawn(path).await?);
        }
        Ok(driver
            .as_ref()
            .map(|d| d.url.clone())
            .unwrap_or_else(|| self.settings.webdriver_url.clone()))
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, headless: bool) -> Result<Box<dyn BrowserDriver>, BrowserError> {
        let client = WebDriverClient::new(&self.endpoint().await?)?;
        let value = client
            .command(
                Method::POST,
                "/session",
                Some(self.settings.capabilities(headless)),
            )
            .await
            .map_err(|e| BrowserError::SessionFailed(e.to_string()))?;
        let id = value["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::SessionFailed("reply carried no sessionId".into()))?
            .to_string();
        debug!("WebDriver session {} started (headless: {})", id, headless);

        let session = WebDriverSession {
            client,
            id,
            closed: AtomicBool::new(false),
            seen_requests: Mutex::new(HashSet::new()),
        };

        if !self.settings.blocked_url_patterns.is_empty() {
            session.cdp("Network.enable", json!({})).await?;
            session
                .cdp(
                    "Network.setBlockedURLs",
                    json!({ "urls": self.settings.blocked_url_patterns }),
                )
                .await?;
        }

        Ok(Box::new(session))
    }
}

/// One WebDriver session.
pub struct WebDriverSession {
    client: WebDriverClient,
    id: String,
    closed: AtomicBool,
    /// Request ids already matched, so a later wait does not return them again.
    seen_requests: Mutex<HashSet<String>>,
}

impl WebDriverSession {
    fn path(&self, suffix: &str) -> Result<String, BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::Closed);
        }
        Ok(format!("/session/{}{}", self.id, suffix))
    }

    async fn cdp(&self, cmd: &str, params: Value) -> Result<Value, BrowserError> {
        let path = self.path("/goog/cdp/execute")?;
        self.client
            .command(
                Method::POST,
                &path,
                Some(json!({ "cmd": cmd, "params": params })),
            )
            .await
    }

    /// Responses in the performance log whose URL contains `pattern`.
    async fn matching_responses(&self, pattern: &str) -> Result<Vec<LoggedResponse>, BrowserError> {
        let path = self.path("/se/log")?;
        let entries = self
            .client
            .command(Method::POST, &path, Some(json!({ "type": "performance" })))
            .await?;

        Ok(entries
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e["message"].as_str())
                    .filter_map(parse_response_event)
                    .filter(|r| r.url.contains(pattern))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn response_body(&self, request_id: &str) -> Result<String, BrowserError> {
        let value = self
            .cdp("Network.getResponseBody", json!({ "requestId": request_id }))
            .await?;
        let body = value["body"].as_str().unwrap_or_default();
        if value["base64Encoded"].as_bool().unwrap_or(false) {
            let bytes = STANDARD.decode(body).map_err(|e| BrowserError::Command {
                command: "Network.getResponseBody".into(),
                message: e.to_string(),
            })?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(body.to_string())
    }
}

/// `Network.responseReceived` event from the performance log.
#[derive(Debug, Clone, PartialEq)]
struct LoggedResponse {
    request_id: String,
    url: String,
    status: u16,
}

fn parse_response_event(message: &str) -> Option<LoggedResponse> {
    let event: Value = serde_json::from_str(message).ok()?;
    let event = &event["message"];
    if event["method"] != "Network.responseReceived" {
        return None;
    }
    let params = &event["params"];
    Some(LoggedResponse {
        request_id: params["requestId"].as_str()?.to_string(),
        url: params["response"]["url"].as_str()?.to_string(),
        status: params["response"]["status"].as_f64().unwrap_or(0.0) as u16,
    })
}

#[async_trait]
impl BrowserDriver for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let path = self.path("/url")?;
        self.client
            .command(Method::POST, &path, Some(json!({ "url": url })))
            .await?;
        Ok(())
    }

    async fn get_cookie(&self, name: &str) -> Result<Option<BrowserCookie>, BrowserError> {
        let path = self.path(&format!("/cookie/{}", urlencoding::encode(name)))?;
        let (status, value) = self.client.execute(Method::GET, &path, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(BrowserError::Command {
                command: path,
                message: describe_error(status, &value),
            });
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| BrowserError::Command {
                command: path,
                message: e.to_string(),
            })
    }

    async fn get_cookies(&self) -> Result<Vec<BrowserCookie>, BrowserError> {
        let path = self.path("/cookie")?;
        let value = self.client.command(Method::GET, &path, None).await?;
        serde_json::from_value(value).map_err(|e| BrowserError::Command {
            command: path,
            message: e.to_string(),
        })
    }

    async fn wait_for_request(
        &self,
        pattern: &str,
        timeout: Duration,
    ) -> Result<CapturedRequest, BrowserError> {
        let deadline = Instant::now() + timeout;
        // The log is drained on every read; keep matches until their body is available
        let mut pending: Vec<LoggedResponse> = Vec::new();

        loop {
            for response in self.matching_responses(pattern).await? {
                let seen = self
                    .seen_requests
                    .lock()
                    .map(|s| s.contains(&response.request_id))
                    .unwrap_or(false);
                if !seen && !pending.contains(&response) {
                    pending.push(response);
                }
            }

            for response in &pending {
                match self.response_body(&response.request_id).await {
                    Ok(body) => {
                        if let Ok(mut seen) = self.seen_requests.lock() {
                            seen.insert(response.request_id.clone());
                        }
                        debug!("Captured response from {}", response.url);
                        return Ok(CapturedRequest {
                            url: response.url.clone(),
                            status: response.status,
                            body,
                        });
                    }
                    Err(e) => debug!("Body for {} not available yet: {}", response.url, e),
                }
            }

            if Instant::now() >= deadline {
                return Err(BrowserError::RequestTimeout {
                    pattern: pattern.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            sleep(LOG_POLL_INTERVAL).await;
        }
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        let path = self.path("/source")?;
        let value = self.client.command(Method::GET, &path, None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let path = format!("/session/{}", self.id);
        self.client.command(Method::DELETE, &path, None).await?;
        debug!("WebDriver session {} closed", self.id);
        Ok(())
    }
}

impl Drop for WebDriverSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Not closed explicitly: end the session in the background
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("WebDriver session {} dropped outside a runtime", self.id);
            return;
        };
        let client = self.client.clone();
        let path = format!("/session/{}", self.id);
        handle.spawn(async move {
            let _ = client.command(Method::DELETE, &path, None).await;
        });
    }
}
