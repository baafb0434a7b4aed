//! The caching worker: install, activate, fetch and message handling.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::try_join_all;
use http::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use swcache_common::{maybe_with_timeout, SwConfig};
use swcache_net::{Fetcher, InterceptAction, NetError, Request, Response};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{dedup_by_key, CacheEntry, CacheKey, CacheStore};
use crate::error::ServiceWorkerError;
use crate::fallback::OfflinePolicy;
use crate::lifecycle::{
    GenerationState, Registration, ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
};
use crate::message::{ControlMessage, ControlReply, MessageEnvelope, MessagePort};

/// How an intercepted request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    FromCache,
    NetworkCached,
    NetworkUncached,
    OfflineFallback,
}

/// Response to an intercepted request, with how it was produced.
#[derive(Debug, Clone)]
pub struct Interception {
    pub response: Response,
    pub outcome: Outcome,
}

/// Offline-first request interceptor over one versioned cache generation.
///
/// Assumes it is the only worker serving its origin; nothing here guards
/// against a second instance writing the same store.
pub struct ServiceWorker {
    config: SwConfig,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    policy: OfflinePolicy,
    registration: RwLock<Registration>,
    revalidations: Mutex<JoinSet<()>>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorker {
    /// Create a worker. Events are delivered on the returned receiver.
    pub fn new(
        config: SwConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let policy = OfflinePolicy::from_substrings(&config.api_patterns);

        (
            Self {
                config,
                store,
                fetcher,
                policy,
                registration: RwLock::new(Registration::new()),
                revalidations: Mutex::new(JoinSet::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Version tag, also the active generation name.
    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &SwConfig {
        &self.config
    }

    /// State of the newest worker version.
    pub async fn state(&self) -> ServiceWorkerState {
        self.registration.read().await.state()
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            version: self.config.version.clone(),
            new_state,
        });
    }

    // ==================== Install ====================

    /// Create the generation and pre-populate it with the seed resources.
    ///
    /// All seeds are fetched before anything is written; a single failure
    /// fails the install and leaves the store untouched.
    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        let id = self
            .registration
            .write()
            .await
            .begin_install(&self.config.version);
        self.emit_state(id, ServiceWorkerState::Installing);
        info!(version = %self.config.version, "Installing");

        match self.populate().await {
            Ok(count) => {
                self.registration.write().await.install_complete();
                self.emit_state(id, ServiceWorkerState::Installed);
                info!(version = %self.config.version, count, "Install complete");
                Ok(())
            }
            Err(e) => {
                self.registration.write().await.install_failed();
                self.emit_state(id, ServiceWorkerState::Redundant);
                error!(version = %self.config.version, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn populate(&self) -> Result<usize, ServiceWorkerError> {
        let generation = self.version();
        self.store.open(generation).await?;

        let mut urls = Vec::with_capacity(self.config.seed_resources.len());
        for seed in &self.config.seed_resources {
            let url = self.config.resolve(seed).map_err(|e| ServiceWorkerError::InstallFailed {
                url: seed.clone(),
                reason: e.to_string(),
            })?;
            // Cross-origin seeds are opaque and never stored.
            if url.origin() != self.config.origin.origin() {
                debug!(%url, "Skipping cross-origin seed");
                continue;
            }
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let install_failed = |reason: String| ServiceWorkerError::InstallFailed {
                url: request.url.to_string(),
                reason,
            };
            let response = self
                .fetch_network(&request)
                .await
                .map_err(|e| install_failed(e.to_string()))?;
            if !response.ok() {
                return Err(install_failed(format!("status {}", response.status)));
            }
            Ok::<_, ServiceWorkerError>(CacheEntry::from_response(
                CacheKey::for_request(&request),
                &response,
            ))
        });
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        let entries = dedup_by_key(entries);
        self.store.put_all(generation, entries).await?;
        Ok(count)
    }

    // ==================== Activate ====================

    /// Sweep every other generation and take control of all clients.
    ///
    /// Never waits for clients of an older version to go away. Activation
    /// completes even if the sweep fails; the sweep error is returned afterwards.
    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        {
            let mut registration = self.registration.write().await;
            if registration.waiting.is_none() && registration.active.is_none() {
                return Err(ServiceWorkerError::StateError(
                    "no installed worker to activate".to_string(),
                ));
            }
            if let Some(id) = registration.begin_activation() {
                self.emit_state(id, ServiceWorkerState::Activating);
            }
        }

        let swept = self.clean_old_generations().await;

        let mut registration = self.registration.write().await;
        if let Some(id) = registration.activate() {
            self.emit_state(id, ServiceWorkerState::Activated);
        }
        if registration.claim().is_some() {
            self.emit(ServiceWorkerEvent::ControllerChange {
                version: self.config.version.clone(),
            });
        }
        info!(version = %self.config.version, "Activated");

        swept.map(|_| ())
    }

    /// Promote a waiting worker now. A no-op when nothing is waiting.
    pub async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        let waiting = self.registration.read().await.waiting.is_some();
        if waiting {
            self.activate().await?;
        }
        Ok(())
    }

    /// Delete every generation except the active one. Returns the deleted names.
    pub async fn clean_old_generations(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let mut deleted = Vec::new();
        for name in self.store.generations().await? {
            if name == self.config.version {
                continue;
            }
            if self.store.delete_generation(&name).await? {
                info!(generation = %name, "Deleted old cache generation");
                self.registration.write().await.record_deleted(&name);
                self.emit(ServiceWorkerEvent::GenerationDeleted { name: name.clone() });
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    // ==================== Fetch ====================

    /// Entry point for every observed request. `None` means the caller
    /// sends the request to the network unmodified.
    pub async fn handle_fetch(
        &self,
        request: &Request,
    ) -> Result<Option<Interception>, ServiceWorkerError> {
        match InterceptAction::for_request(request) {
            InterceptAction::Passthrough => Ok(None),
            InterceptAction::Intercept => self.intercept(request).await.map(Some),
        }
    }

    /// Answer a GET request: cache first with background revalidation,
    /// network on a miss, offline fallback when the network fails.
    pub async fn intercept(&self, request: &Request) -> Result<Interception, ServiceWorkerError> {
        if InterceptAction::for_request(request) != InterceptAction::Intercept {
            return Err(ServiceWorkerError::NotIntercepted(
                request.method.to_string(),
            ));
        }

        let generation = self.version();
        let key = CacheKey::for_request(request);
        debug!(url = %request.url, "Intercepting request");

        // A broken store degrades this request to network-only.
        let mut cache_usable = true;
        match self.store.get(generation, &key).await {
            Ok(Some(entry)) => match entry.to_response() {
                Ok(response) => {
                    debug!(url = %request.url, "Serving from cache");
                    self.spawn_revalidation(request.clone());
                    return Ok(Interception {
                        response,
                        outcome: Outcome::FromCache,
                    });
                }
                Err(e) => {
                    warn!(url = %request.url, error = %e, "Unreadable cache entry");
                    cache_usable = false;
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                cache_usable = false;
            }
        }

        match self.fetch_network(request).await {
            Ok(response) => {
                if cache_usable && response.is_cacheable() {
                    let entry = CacheEntry::from_response(key, &response);
                    match self.store.put(generation, entry).await {
                        Ok(()) => {
                            debug!(url = %request.url, "Cached network response");
                            self.emit(ServiceWorkerEvent::CacheUpdated {
                                url: request.url.to_string(),
                            });
                            return Ok(Interception {
                                response,
                                outcome: Outcome::NetworkCached,
                            });
                        }
                        Err(e) => warn!(url = %request.url, error = %e, "Cache write failed"),
                    }
                }
                Ok(Interception {
                    response,
                    outcome: Outcome::NetworkUncached,
                })
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network error");
                match self.policy.fallback_for(request) {
                    Some(response) => Ok(Interception {
                        response,
                        outcome: Outcome::OfflineFallback,
                    }),
                    None => Err(e.into()),
                }
            }
        }
    }

    async fn fetch_network(&self, request: &Request) -> Result<Response, NetError> {
        fetch_with_timeout(self.fetcher.as_ref(), request, self.config.fetch_timeout()).await
    }

    fn lock_revalidations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.revalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refresh a cached entry without holding up the caller.
    fn spawn_revalidation(&self, request: Request) {
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let generation = self.config.version.clone();
        let timeout = self.config.fetch_timeout();
        let event_tx = self.event_tx.clone();

        let mut tasks = self.lock_revalidations();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let response = match fetch_with_timeout(fetcher.as_ref(), &request, timeout).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Revalidation fetch failed");
                    return;
                }
            };
            if response.status != StatusCode::OK {
                debug!(url = %request.url, status = %response.status, "Revalidation not stored");
                return;
            }
            let entry = CacheEntry::from_response(CacheKey::for_request(&request), &response);
            match store.put(&generation, entry).await {
                Ok(()) => {
                    debug!(url = %request.url, "Revalidated cache entry");
                    let _ = event_tx.send(ServiceWorkerEvent::CacheUpdated {
                        url: request.url.to_string(),
                    });
                }
                Err(e) => warn!(url = %request.url, error = %e, "Revalidation write failed"),
            }
        });
    }

    /// Wait for every pending background revalidation.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.lock_revalidations());
            if pending.is_empty() {
                break;
            }
            while pending.join_next().await.is_some() {}
        }
    }

    /// Abort pending revalidations. Their writes are dropped.
    pub fn shutdown(&self) {
        self.lock_revalidations().abort_all();
    }

    // ==================== Administration ====================

    /// Store one resource in the active generation.
    pub async fn cache_url(&self, url: &str) -> Result<(), ServiceWorkerError> {
        let url = self
            .config
            .resolve(url)
            .map_err(|e| ServiceWorkerError::InvalidUrl(e.to_string()))?;
        let request = Request::get(url);
        let response = self.fetch_network(&request).await?;
        if !response.ok() {
            return Err(NetError::RequestFailed(format!(
                "{} answered {}",
                request.url, response.status
            ))
            .into());
        }

        let entry = CacheEntry::from_response(CacheKey::for_request(&request), &response);
        self.store.put(self.version(), entry).await?;
        info!(url = %request.url, "Cached URL");
        self.emit(ServiceWorkerEvent::CacheUpdated {
            url: request.url.to_string(),
        });
        Ok(())
    }

    /// Remove the cached GET entry for `url`. Absent entries are not an error.
    pub async fn evict(&self, url: &Url) -> Result<bool, ServiceWorkerError> {
        let removed = self.store.delete(self.version(), &CacheKey::get(url)).await?;
        debug!(%url, removed, "Evicted");
        Ok(removed)
    }

    /// Delete every generation, the active one included. Returns how many went.
    pub async fn clear(&self) -> Result<usize, ServiceWorkerError> {
        let mut count = 0;
        for name in self.store.generations().await? {
            if self.store.delete_generation(&name).await? {
                self.emit(ServiceWorkerEvent::GenerationDeleted { name });
                count += 1;
            }
        }
        self.registration.write().await.forget_deleted();
        info!(count, "Cleared all cache generations");
        Ok(count)
    }

    /// Keys of the active generation.
    pub async fn keys(&self) -> Result<Vec<CacheKey>, ServiceWorkerError> {
        Ok(self.store.keys(self.version()).await?)
    }

    /// Every stored generation with its lifecycle state, plus the active one if absent.
    pub async fn generations(&self) -> Result<Vec<(String, GenerationState)>, ServiceWorkerError> {
        let names = self.store.generations().await?;
        let registration = self.registration.read().await;
        let mut states: Vec<(String, GenerationState)> = names
            .iter()
            .map(|name| (name.clone(), registration.generation_state(name, true)))
            .collect();
        if !names.iter().any(|name| name == self.version()) {
            states.push((
                self.version().to_string(),
                registration.generation_state(self.version(), false),
            ));
        }
        Ok(states)
    }

    // ==================== Messages ====================

    /// Handle one control message. Returns the reply, if the command has one.
    pub async fn handle_message(&self, data: JsonValue) -> Option<JsonValue> {
        let message = match ControlMessage::parse(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring control message");
                return None;
            }
        };
        debug!(?message, "Control message");

        let reply = match message {
            ControlMessage::SkipWaiting => {
                if let Err(e) = self.skip_waiting().await {
                    warn!(error = %e, "Skip waiting failed");
                }
                return None;
            }
            ControlMessage::GetVersion => ControlReply::Version {
                version: self.config.version.clone(),
            },
            ControlMessage::CleanCache => match self.clean_old_generations().await {
                Ok(_) => ControlReply::success(),
                Err(e) => ControlReply::error(e),
            },
            ControlMessage::CacheUrl { url } => match self.cache_url(&url).await {
                Ok(()) => ControlReply::success(),
                Err(e) => ControlReply::error(e),
            },
        };
        Some(reply.into_value())
    }

    /// Serve messages until every sender is dropped.
    pub async fn serve_messages(self: Arc<Self>, mut rx: mpsc::Receiver<MessageEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            let reply = self.handle_message(envelope.data).await;
            if let (Some(reply), Some(reply_to)) = (reply, envelope.reply_to) {
                let _ = reply_to.send(reply);
            }
        }
        debug!("Message channel closed");
    }

    /// Spawn a message loop and return the port that feeds it.
    pub fn connect(self: &Arc<Self>) -> MessagePort {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(Arc::clone(self).serve_messages(rx));
        MessagePort::new(tx)
    }
}

impl Drop for ServiceWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn fetch_with_timeout(
    fetcher: &dyn Fetcher,
    request: &Request,
    timeout: Option<Duration>,
) -> Result<Response, NetError> {
    match maybe_with_timeout(timeout, || fetcher.fetch(request)).await {
        Ok(result) => result,
        Err(_) => Err(NetError::Timeout(timeout.unwrap_or_default())),
    }
}
