//! Local redirect listener for the interactive OAuth flow.
//!
//! Binds a loopback port, waits for the identity platform to redirect the
//! browser back with `code`/`state` (or `error`), answers with a small HTML
//! page and hands the full callback URL to the caller.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Per-connection read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Result from the callback listener.
#[derive(Debug, PartialEq)]
pub enum CallbackResult {
    /// Successfully received callback with the full URL.
    Success(String),
    /// Nothing arrived before the deadline.
    Timeout,
    /// Error occurred.
    Error(String),
}

/// Listener bound to a loopback port.
///
/// The redirect URI names `localhost`, which a browser may resolve to either
/// address family, so the port is bound on `::1` too when IPv6 is available.
pub struct CallbackListener {
    listener_v4: TcpListener,
    listener_v6: Option<TcpListener>,
    port: u16,
}

impl CallbackListener {
    /// Bind `127.0.0.1:{port}` and, if possible, `[::1]:{port}`. Port 0 picks
    /// a free port.
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let listener_v4 = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener_v4.local_addr()?.port();
        let listener_v6 = match TcpListener::bind(("::1", port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                debug!("IPv6 loopback unavailable on port {}: {}", port, e);
                None
            }
        };
        info!(
            "OAuth callback listener on 127.0.0.1:{}{}",
            port,
            if listener_v6.is_some() { " and [::1]" } else { "" }
        );
        Ok(Self {
            listener_v4,
            listener_v6,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_dual_stack(&self) -> bool {
        self.listener_v6.is_some()
    }

    /// Redirect URI registered for public clients on loopback.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    /// Wait for a single OAuth callback, up to `wait`.
    ///
    /// Stray requests (favicon, port scans) are answered and ignored.
    pub async fn wait_for_callback(self, wait: Duration) -> CallbackResult {
        match timeout(wait, self.accept_loop()).await {
            Ok(result) => result,
            Err(_) => {
                info!("No OAuth callback within {:?}", wait);
                CallbackResult::Timeout
            }
        }
    }

    async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        match &self.listener_v6 {
            Some(v6) => tokio::select! {
                accepted = self.listener_v4.accept() => accepted,
                accepted = v6.accept() => accepted,
            },
            None => self.listener_v4.accept().await,
        }
    }

    async fn accept_loop(&self) -> CallbackResult {
        loop {
            match self.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Connection from {}", peer_addr);
                    if let Some(url) = handle_connection(stream, self.port).await {
                        info!("OAuth callback received");
                        return CallbackResult::Success(url);
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    return CallbackResult::Error(format!("Connection error: {}", e));
                }
            }
        }
    }
}

/// Returns the callback URL if this connection carried one.
async fn handle_connection(mut stream: TcpStream, port: u16) -> Option<String> {
    let mut buffer = [0; 8192];
    let bytes_read = match timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Failed to read request: {}", e);
            return None;
        }
        Err(_) => return None,
    };

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let mut parts = request.lines().next()?.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m, p),
        _ => {
            respond(&mut stream, "400 Bad Request", "text/plain", "Bad Request").await;
            return None;
        }
    };

    if method != "GET" {
        respond(&mut stream, "405 Method Not Allowed", "text/plain", "Method Not Allowed").await;
        return None;
    }

    let url = format!("http://localhost:{}{}", port, path);
    let params: Vec<(String, String)> = url::Url::parse(&url)
        .map(|u| u.query_pairs().into_owned().collect())
        .unwrap_or_default();
    let param = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    if let Some(error) = param("error") {
        let detail = param("error_description").unwrap_or(error);
        respond(&mut stream, "200 OK", "text/html; charset=utf-8", &result_page(false, detail)).await;
        // The caller still needs the URL to report the error
        return Some(url);
    }

    if param("code").is_none() {
        respond(&mut stream, "404 Not Found", "text/plain", "Not Found").await;
        return None;
    }

    respond(
        &mut stream,
        "200 OK",
        "text/html; charset=utf-8",
        &result_page(true, "You can close this tab now."),
    )
    .await;
    Some(url)
}

fn result_page(success: bool, detail: &str) -> String {
    let title = if success {
        "Signed in"
    } else {
        "Sign-in failed"
    };
    let detail = detail
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{title}</title>
<style>body {{ font-family: -apple-system, 'Segoe UI', sans-serif; text-align: center; margin-top: 4rem; color: #1F2937; }}</style>
</head>
<body>
<h1>{title}</h1>
<p>{detail}</p>
<script>setTimeout(function () {{ window.close(); }}, 1500);</script>
</body>
</html>"#
    )
}

async fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}
