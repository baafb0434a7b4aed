//! Worker lifecycle: installing, waiting and active versions of one registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

// ==================== Types ====================

/// Unique identifier for a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Pre-populating its cache generation.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Sweeping old generations.
    Activating,
    /// Active and controlling clients.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

/// Where a cache generation stands relative to the registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Absent,
    Installing,
    Active,
    Superseded,
    Deleted,
}

/// One installed (or installing) version of the worker.
#[derive(Debug, Clone)]
pub struct WorkerVersion {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Version tag, also the name of its cache generation.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl WorkerVersion {
    pub fn new(version: &str) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.to_string(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

// ==================== Events ====================

/// Events emitted by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// The active version claimed all clients.
    ControllerChange { version: String },
    /// An entry of the active generation was written.
    CacheUpdated { url: String },
    /// A generation was removed.
    GenerationDeleted { name: String },
}

// ==================== Registration ====================

/// Lifecycle bookkeeping for one origin.
#[derive(Debug, Default)]
pub struct Registration {
    /// Installing worker.
    pub installing: Option<WorkerVersion>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<WorkerVersion>,

    /// Active worker.
    pub active: Option<WorkerVersion>,

    /// Version controlling clients, set by `claim`.
    pub controller: Option<ServiceWorkerId>,

    /// Generations swept by this registration.
    deleted: HashSet<String>,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start installing `version`. Replaces any previous installing worker.
    pub fn begin_install(&mut self, version: &str) -> ServiceWorkerId {
        let mut worker = WorkerVersion::new(version);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        if let Some(mut stale) = self.installing.replace(worker) {
            stale.set_state(ServiceWorkerState::Redundant);
        }
        self.deleted.remove(version);
        id
    }

    /// Transition installing to waiting.
    pub fn install_complete(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let id = worker.id;
        if let Some(mut replaced) = self.waiting.replace(worker) {
            replaced.set_state(ServiceWorkerState::Redundant);
        }
        Some(id)
    }

    /// Drop the installing worker after a failed install.
    pub fn install_failed(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker.id)
    }

    /// Mark the waiting worker as activating.
    pub fn begin_activation(&mut self) -> Option<ServiceWorkerId> {
        let worker = self.waiting.as_mut()?;
        worker.set_state(ServiceWorkerState::Activating);
        Some(worker.id)
    }

    /// Promote the waiting worker. The previous active worker becomes redundant.
    pub fn activate(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.waiting.take()?;
        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }
        worker.set_state(ServiceWorkerState::Activated);
        let id = worker.id;
        self.active = Some(worker);
        Some(id)
    }

    /// Make the active worker the controller of every client.
    pub fn claim(&mut self) -> Option<ServiceWorkerId> {
        let id = self.active.as_ref()?.id;
        self.controller = Some(id);
        Some(id)
    }

    /// Record a generation removed from the store.
    pub fn record_deleted(&mut self, generation: &str) {
        self.deleted.insert(generation.to_string());
    }

    /// Forget every sweep, after the whole store was cleared.
    pub fn forget_deleted(&mut self) {
        self.deleted.clear();
    }

    /// State of the newest worker: installing, then waiting, then active.
    pub fn state(&self) -> ServiceWorkerState {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
            .map(|w| w.state)
            .unwrap_or_default()
    }

    /// Classify a generation name. `exists` says whether the store holds it.
    pub fn generation_state(&self, generation: &str, exists: bool) -> GenerationState {
        let is = |w: &Option<WorkerVersion>| w.as_ref().is_some_and(|w| w.version == generation);

        if !exists {
            return if self.deleted.contains(generation) {
                GenerationState::Deleted
            } else {
                GenerationState::Absent
            };
        }
        if is(&self.active) {
            GenerationState::Active
        } else if is(&self.installing) || is(&self.waiting) {
            GenerationState::Installing
        } else {
            GenerationState::Superseded
        }
    }
}
