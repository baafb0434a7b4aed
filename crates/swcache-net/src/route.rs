//! A scripted in-memory fetcher.
//!
//! Serves fixed responses per URL, can be switched offline, and counts calls.
//! Used wherever a real network is unwanted: tests, demos, dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tracing::trace;
use url::Url;

use crate::{Fetcher, NetError, Request, Response, ResponseType};

#[derive(Debug, Clone)]
struct Route {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    body: Bytes,
}

/// Fetcher answering from a route table. Unknown URLs get a 404.
#[derive(Debug)]
pub struct RouteFetcher {
    origin: Url,
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<Duration>>,
    offline: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RouteFetcher {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    fn key(&self, path: &str) -> String {
        match self.origin.join(path) {
            Ok(url) => url.to_string(),
            Err(_) => path.to_string(),
        }
    }

    /// Serve `body` with status 200 at `path`. JSON-looking bodies get a JSON content type.
    pub fn route(&self, path: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let content_type = if body.starts_with(b"{") || body.starts_with(b"[") {
            "application/json"
        } else if body.starts_with(b"<") {
            "text/html; charset=utf-8"
        } else {
            "text/plain; charset=utf-8"
        };
        self.route_with(path, StatusCode::OK, Some(content_type), body);
    }

    /// Serve an arbitrary status and body at `path`.
    pub fn route_with(
        &self,
        path: &str,
        status: StatusCode,
        content_type: Option<&'static str>,
        body: impl Into<Bytes>,
    ) {
        let route = Route {
            status,
            content_type: content_type.map(HeaderValue::from_static),
            body: body.into(),
        };
        lock(&self.routes).insert(self.key(path), route);
    }

    /// Remove a route; the URL answers 404 afterwards.
    pub fn unroute(&self, path: &str) {
        lock(&self.routes).remove(&self.key(path));
    }

    /// Fail every fetch as unreachable while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every response.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// How many fetches reached `path`, offline attempts included.
    pub fn calls(&self, path: &str) -> usize {
        lock(&self.calls).get(&self.key(path)).copied().unwrap_or(0)
    }

    async fn respond(&self, request: &Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(format!("{key} unreachable")));
        }

        let route = lock(&self.routes).get(&key).cloned();
        let route = route.unwrap_or(Route {
            status: StatusCode::NOT_FOUND,
            content_type: None,
            body: Bytes::new(),
        });
        trace!(url = %key, status = %route.status, "Scripted response");

        let mut headers = HeaderMap::new();
        if let Some(content_type) = route.content_type {
            headers.insert(header::CONTENT_TYPE, content_type);
        }
        let response_type = if request.url.origin() == self.origin.origin() {
            ResponseType::Basic
        } else {
            ResponseType::Opaque
        };
        Ok(Response::new(
            request.url.clone(),
            route.status,
            headers,
            route.body,
            response_type,
        ))
    }
}

impl Fetcher for RouteFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        self.respond(request).boxed()
    }
}
