//! Run registry: the durable map of active and recent subagent runs.
//!
//! The registry owns the slot ledger and the per-run runtime handles
//! (provider reservation, cancellation token). Slot release is tied to
//! retiring a run's handles, which can happen exactly once; removing the
//! record retires it first, so no path can double-release.
//!
//! Persistence is advisory: a snapshot is rewritten after each mutation off
//! the caller's path, and a snapshot that fails to load on startup yields an
//! empty registry rather than a startup failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::slots::{ProviderReservation, SlotLedger};
use super::spawn::SpawnRequest;
use super::verification::{VerificationContract, VerificationOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Keep,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    #[default]
    Pending,
    Passed,
    Failed,
}

/// One delegated task, as the registry tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub requester_display_key: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    pub run_timeout_seconds: u64,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationContract>,
    #[serde(default)]
    pub verification_state: VerificationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<VerificationOutcome>,
    /// Set when a retry spawn has been used; a second failure never retries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempted_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_spawn_params: Option<SpawnRequest>,
}

/// Runtime-only state for a registered run. Not persisted; a run loaded
/// from a snapshot after restart has no handles and holds no slots.
pub struct RunHandles {
    pub provider_reservation: Option<ProviderReservation>,
    pub cancel: CancellationToken,
}

/// Persistence port for the registry snapshot.
pub trait RegistrySnapshotStore: Send + Sync {
    fn load(&self) -> Result<HashMap<String, SubagentRun>>;
    fn save(&self, runs: &HashMap<String, SubagentRun>) -> Result<()>;
}

/// No-op store for tests and ephemeral registries.
#[derive(Default)]
pub struct NullSnapshotStore;

impl RegistrySnapshotStore for NullSnapshotStore {
    fn load(&self) -> Result<HashMap<String, SubagentRun>> {
        Ok(HashMap::new())
    }

    fn save(&self, _runs: &HashMap<String, SubagentRun>) -> Result<()> {
        Ok(())
    }
}

/// Flat JSON snapshot keyed by run id.
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RegistrySnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Result<HashMap<String, SubagentRun>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, runs: &HashMap<String, SubagentRun>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // write-then-rename so readers never see a half-written snapshot
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(runs)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

struct Inner {
    runs: HashMap<String, SubagentRun>,
    by_child: HashMap<String, String>,
    handles: HashMap<String, RunHandles>,
}

pub struct RunRegistry {
    ledger: SlotLedger,
    inner: Mutex<Inner>,
    store: Arc<dyn RegistrySnapshotStore>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RegistrySnapshotStore>) -> Self {
        let runs = match store.load() {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Failed to load run registry snapshot, starting empty: {e}");
                HashMap::new()
            }
        };
        let by_child = runs
            .values()
            .map(|run| (run.child_session_key.clone(), run.run_id.clone()))
            .collect();
        Self {
            ledger: SlotLedger::new(),
            inner: Mutex::new(Inner {
                runs,
                by_child,
                handles: HashMap::new(),
            }),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(NullSnapshotStore))
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    /// Write the snapshot off the caller's path. Persistence failures are
    /// logged, never propagated.
    fn persist(&self, runs: HashMap<String, SubagentRun>) {
        let store = self.store.clone();
        let write = move || {
            if let Err(e) = store.save(&runs) {
                warn!("Failed to persist run registry snapshot: {e}");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    pub fn add_run(&self, run: SubagentRun, handles: RunHandles) {
        let snapshot = {
            let mut inner = self.inner.lock().expect("run registry poisoned");
            inner
                .by_child
                .insert(run.child_session_key.clone(), run.run_id.clone());
            inner.handles.insert(run.run_id.clone(), handles);
            inner.runs.insert(run.run_id.clone(), run);
            inner.runs.clone()
        };
        self.persist(snapshot);
    }

    pub fn get_run(&self, run_id: &str) -> Option<SubagentRun> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.runs.get(run_id).cloned()
    }

    pub fn get_run_by_child_key(&self, child_session_key: &str) -> Option<SubagentRun> {
        let inner = self.inner.lock().expect("run registry poisoned");
        let run_id = inner.by_child.get(child_session_key)?;
        inner.runs.get(run_id).cloned()
    }

    pub fn list_runs(&self) -> Vec<SubagentRun> {
        let inner = self.inner.lock().expect("run registry poisoned");
        let mut runs: Vec<_> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|run| run.created_at_ms);
        runs
    }

    pub fn list_runs_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRun> {
        self.list_runs()
            .into_iter()
            .filter(|run| run.requester_session_key == requester_session_key)
            .collect()
    }

    /// Apply a partial update to a run record. Returns false when the run is
    /// unknown. The patch closure runs under the registry lock; keep it
    /// cheap and free of I/O.
    pub fn update_run(&self, run_id: &str, patch: impl FnOnce(&mut SubagentRun)) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock().expect("run registry poisoned");
            let Some(run) = inner.runs.get_mut(run_id) else {
                return false;
            };
            patch(run);
            inner.runs.clone()
        };
        self.persist(snapshot);
        true
    }

    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        let inner = self.inner.lock().expect("run registry poisoned");
        inner.handles.get(run_id).map(|h| h.cancel.clone())
    }

    /// Release a run's slots and drop its runtime handles. Idempotent: the
    /// handles entry is taken, so a second call finds nothing to release.
    pub fn retire_run(&self, run_id: &str) {
        let (parent_key, reservation) = {
            let mut inner = self.inner.lock().expect("run registry poisoned");
            let Some(handles) = inner.handles.remove(run_id) else {
                return;
            };
            let parent_key = inner
                .runs
                .get(run_id)
                .map(|run| run.requester_session_key.clone());
            (parent_key, handles.provider_reservation)
        };
        if let Some(parent_key) = parent_key {
            self.ledger.release_child_slot(&parent_key);
        }
        if let Some(reservation) = reservation {
            self.ledger.release_provider_slot(reservation);
        }
        debug!("Retired run {run_id}");
    }

    /// Synchronously write the snapshot (process shutdown, CLI one-shots).
    pub fn flush(&self) {
        let runs = {
            let inner = self.inner.lock().expect("run registry poisoned");
            inner.runs.clone()
        };
        if let Err(e) = self.store.save(&runs) {
            warn!("Failed to flush run registry snapshot: {e}");
        }
    }

    /// Drop a run record entirely, retiring it first if still live.
    pub fn remove_run(&self, run_id: &str) -> Option<SubagentRun> {
        self.retire_run(run_id);
        let (removed, snapshot) = {
            let mut inner = self.inner.lock().expect("run registry poisoned");
            let removed = inner.runs.remove(run_id);
            if let Some(run) = &removed {
                inner.by_child.remove(&run.child_session_key);
            }
            (removed, inner.runs.clone())
        };
        if removed.is_some() {
            self.persist(snapshot);
        }
        removed
    }
}
