//! Shared HTTP plumbing for the cloud adapters.

use std::time::Duration;

use reqwest::{Client, Response, Url};
use sonarq_core::error::{Result, ScanError};
use tracing::warn;

const MAX_LOGGED_BODY: usize = 512;

pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("sonarq-worker/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Map a client-side failure onto the scan error taxonomy. Connection and
/// timeout failures stay retryable.
pub fn transport_error(err: reqwest::Error) -> ScanError {
    if let Some(status) = err.status() {
        return ScanError::HttpStatus {
            status: status.as_u16(),
            url: err.url().map(display_url).unwrap_or_default(),
        };
    }
    if err.is_timeout() {
        return ScanError::Transport(format!("request timed out: {err}"));
    }
    ScanError::Transport(err.to_string())
}

/// Pass 2xx responses through; log and convert anything else.
pub async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = display_url(response.url());
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), %url, body = %truncate(&body), "request failed");
    Err(ScanError::HttpStatus {
        status: status.as_u16(),
        url,
    })
}

/// URL without query string, safe to log.
pub fn display_url(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

pub fn truncate(body: &str) -> &str {
    if body.len() <= MAX_LOGGED_BODY {
        return body;
    }
    let mut end = MAX_LOGGED_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_url_drops_query() {
        let url = Url::parse("https://sonarcloud.io/api/measures/component?component=p&organization=o")
            .expect("url");
        assert_eq!(display_url(&url), "https://sonarcloud.io/api/measures/component");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_LOGGED_BODY);
        assert!(long.starts_with(cut));
        assert_eq!(truncate("short"), "short");
    }
}
