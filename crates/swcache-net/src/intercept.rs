//! Request routing and URL classification.

use crate::{Request, Url};
use http::Method;
use tracing::trace;

/// What to do with an observed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// Answer through the cache.
    Intercept,
    /// Send to the network unmodified.
    Passthrough,
}

impl InterceptAction {
    /// Only GET requests are intercepted.
    pub fn for_request(request: &Request) -> Self {
        let action = if request.method == Method::GET {
            InterceptAction::Intercept
        } else {
            InterceptAction::Passthrough
        };
        trace!(url = %request.url, method = %request.method, ?action, "Routing request");
        action
    }
}

/// Substring matched anywhere in a URL, e.g. `/api/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    pub pattern: String,
}

impl UrlPattern {
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern: substring.to_string(),
        }
    }

    pub fn matches(&self, url: &Url) -> bool {
        url.as_str().contains(&self.pattern)
    }

    /// True if any pattern in `patterns` matches.
    pub fn any_matches(patterns: &[UrlPattern], url: &Url) -> bool {
        patterns.iter().any(|p| p.matches(url))
    }
}
