//! Responses synthesized when the network is unreachable and nothing is cached.

use chrono::{SecondsFormat, Utc};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::json;
use swcache_net::{Destination, Request, Response, ResponseType, UrlPattern};

/// Marker class present in the offline page.
pub const OFFLINE_MARKER: &str = "offline";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>Offline</title>
    <style>
        body { font-family: Arial, sans-serif; text-align: center; padding: 50px; }
        .offline { color: #666; }
    </style>
</head>
<body>
    <div class="offline">
        <h1>You are offline</h1>
        <p>Check your internet connection.</p>
        <button onclick="location.reload()">Retry</button>
    </div>
</body>
</html>
"#;

/// Decides which fallback, if any, answers a failed request.
#[derive(Debug, Clone)]
pub struct OfflinePolicy {
    api_patterns: Vec<UrlPattern>,
}

impl OfflinePolicy {
    pub fn new(api_patterns: Vec<UrlPattern>) -> Self {
        Self { api_patterns }
    }

    /// Build from plain substrings, as found in the config file.
    pub fn from_substrings<S: AsRef<str>>(patterns: &[S]) -> Self {
        Self::new(
            patterns
                .iter()
                .map(|p| UrlPattern::contains(p.as_ref()))
                .collect(),
        )
    }

    /// Whether the URL is an API call.
    pub fn is_api(&self, request: &Request) -> bool {
        UrlPattern::any_matches(&self.api_patterns, &request.url)
    }

    /// Fallback for a request whose fetch failed. `None` means the failure propagates.
    pub fn fallback_for(&self, request: &Request) -> Option<Response> {
        if request.destination == Destination::Document {
            Some(self.offline_page(request))
        } else if self.is_api(request) {
            Some(self.offline_json(request))
        } else {
            None
        }
    }

    fn offline_page(&self, request: &Request) -> Response {
        synthesize(request, "text/html; charset=utf-8", OFFLINE_PAGE.to_string())
    }

    fn offline_json(&self, request: &Request) -> Response {
        let body = json!({
            "error": "offline",
            "message": "Unable to reach the network",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "offline": true,
        });
        synthesize(request, "application/json", body.to_string())
    }
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        Self::from_substrings(&["/api/", "jsonplaceholder"])
    }
}

fn synthesize(request: &Request, content_type: &'static str, body: String) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    Response::new(
        request.url.clone(),
        StatusCode::OK,
        headers,
        body,
        ResponseType::Synthetic,
    )
}
