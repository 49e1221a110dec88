//! HTTP sessions assembled from harvested browser credentials.

use super::harvester::{CookieCredential, CookieSessionHarvester};
use crate::browser::BrowserCookie;
use crate::error::{ApiError, AppError};
use chrono::DateTime;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// Error text the Forms API returns when the anti-forgery header is rejected.
pub const ANTIFORGERY_ERROR_MARKER: &str = "AntiForgery token validation error";

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A client carrying the session cookies and anti-forgery header.
#[derive(Clone)]
pub struct HttpSession {
    client: reqwest::Client,
    cookie_names: Vec<String>,
}

impl HttpSession {
    /// Load every cookie into a jar and set the anti-forgery header on every
    /// request.
    pub fn assemble(credential: &CookieCredential, header_name: &str) -> Result<Self, AppError> {
        let jar = Jar::default();
        for cookie in &credential.cookies {
            match cookie_origin(cookie) {
                Some(origin) => jar.add_cookie_str(&set_cookie_header(cookie), &origin),
                None => warn!("Skipping cookie {} without a domain", cookie.name),
            }
        }

        let name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| AppError::Config(format!("Invalid header name {}: {}", header_name, e)))?;
        let mut value = HeaderValue::from_str(&credential.antiforgery_token).map_err(|e| {
            AppError::Config(format!("Anti-forgery token is not a valid header value: {}", e))
        })?;
        value.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(name, value);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .cookie_provider(Arc::new(jar))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            cookie_names: credential.cookies.iter().map(|c| c.name.clone()).collect(),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cookie_names(&self) -> &[String] {
        &self.cookie_names
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("cookies", &self.cookie_names)
            .finish()
    }
}

/// URL a browser cookie belongs to. The jar derives the cookie's scope from it.
fn cookie_origin(cookie: &BrowserCookie) -> Option<Url> {
    let host = cookie.domain.as_deref()?.trim_start_matches('.');
    if host.is_empty() {
        return None;
    }
    let scheme = if cookie.secure { "https" } else { "http" };
    let path = cookie.path.as_deref().unwrap_or("/");
    Url::parse(&format!("{}://{}{}", scheme, host, path)).ok()
}

/// Browser cookie as a `Set-Cookie` header value.
///
/// A leading dot on the domain marks a domain cookie; without it the cookie
/// stays host-only. `SameSite` has no meaning outside a browser and is dropped.
fn set_cookie_header(cookie: &BrowserCookie) -> String {
    let mut header = format!("{}={}", cookie.name, cookie.value);
    if let Some(domain) = cookie.domain.as_deref().filter(|d| d.starts_with('.')) {
        header.push_str(&format!("; Domain={}", domain));
    }
    header.push_str(&format!("; Path={}", cookie.path.as_deref().unwrap_or("/")));
    if let Some(expires) = cookie.expiry.and_then(|e| DateTime::from_timestamp(e, 0)) {
        header.push_str(&format!(
            "; Expires={}",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    if cookie.secure {
        header.push_str("; Secure");
    }
    if cookie.http_only {
        header.push_str("; HttpOnly");
    }
    header
}

/// Forms web API client.
///
/// A request rejected for its anti-forgery token triggers one fresh harvest
/// and a single retry; a second rejection is returned to the caller.
pub struct FormsClient {
    harvester: Arc<CookieSessionHarvester>,
    session: RwLock<HttpSession>,
    base_url: String,
}

impl FormsClient {
    /// Connect with a cached or newly harvested session.
    pub async fn connect(
        harvester: Arc<CookieSessionHarvester>,
        base_url: &str,
    ) -> Result<Self, AppError> {
        let session = harvester.harvest(false).await?;
        Ok(Self {
            harvester,
            session: RwLock::new(session),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Send a request to `entity` (relative to the API base, or an absolute URL).
    pub async fn request(
        &self,
        method: Method,
        entity: &str,
        body: Option<&Value>,
    ) -> Result<Value, AppError> {
        let url = if entity.starts_with("http://") || entity.starts_with("https://") {
            entity.to_string()
        } else {
            format!("{}/{}", self.base_url, entity.trim_start_matches('/'))
        };

        match self.send_once(method.clone(), &url, body).await {
            Err(AppError::Api(ApiError::AntiForgeryValidation)) => {
                warn!("Anti-forgery token rejected; harvesting a fresh session");
                let fresh = self.harvester.harvest(true).await?;
                *self.session.write().await = fresh;
                self.send_once(method, &url, body).await
            }
            other => other,
        }
    }

    pub async fn get(&self, entity: &str) -> Result<Value, AppError> {
        self.request(Method::GET, entity, None).await
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value, AppError> {
        let client = self.session.read().await.client().clone();
        let mut request = client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("{} -> HTTP {}", url, status.as_u16());

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| ApiError::ParseFailed(e.to_string()).into());
        }

        if text.contains(ANTIFORGERY_ERROR_MARKER) {
            return Err(ApiError::AntiForgeryValidation.into());
        }
        match status.as_u16() {
            401 => Err(ApiError::Unauthorized.into()),
            code => Err(ApiError::RequestFailed {
                status: code,
                body: text,
            }
            .into()),
        }
    }
}
