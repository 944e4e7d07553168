//! In-memory table of connected hosts.
//!
//! The registry is the source of truth for dispatch: a host is reachable iff
//! it has an entry here. Entries are created by the stream session after a
//! successful handshake, touched by the receive loop and the heartbeat
//! monitor, and removed by the session's teardown path. The persistent store
//! only ever trails this table.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use corralproto::HostRegistration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::session::SendHandle;

/// Liveness status of a connected host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Heartbeats are arriving within the threshold.
    Online,
    /// No inbound traffic for longer than the overdue threshold. Still
    /// connected; not eligible for placement.
    Overdue,
    /// Terminal; the session is gone and the entry is about to be (or has
    /// been) dropped.
    Disconnected,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Online => "ONLINE",
            HostStatus::Overdue => "OVERDUE",
            HostStatus::Disconnected => "DISCONNECTED",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("host id must not be empty")]
    EmptyHostId,
}

/// A registered host as seen by external callers. A stable copy; mutating it
/// has no effect on the registry.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub host_id: String,
    pub hostname: String,
    pub version: String,
    pub status: HostStatus,
    /// Time since the last inbound message.
    pub last_heartbeat_age: Duration,
    pub snapshot: Option<HostRegistration>,
}

/// What the dispatcher needs to reach a host.
#[derive(Clone)]
pub(crate) struct DispatchTarget {
    pub sender: SendHandle,
    pub session_id: Uuid,
}

/// The session that was displaced by a re-registration, so the caller can
/// fail its outstanding slots and stop its task.
pub(crate) struct ReplacedSession {
    pub session_id: Uuid,
    pub stop: mpsc::Sender<()>,
}

struct HostEntry {
    host_id: String,
    hostname: String,
    version: String,
    session_id: Uuid,
    sender: SendHandle,
    stop: mpsc::Sender<()>,
    last_heartbeat: Instant,
    snapshot: Option<HostRegistration>,
    status: HostStatus,
}

impl HostEntry {
    fn info(&self) -> HostInfo {
        HostInfo {
            host_id: self.host_id.clone(),
            hostname: self.hostname.clone(),
            version: self.version.clone(),
            status: self.status,
            last_heartbeat_age: self.last_heartbeat.elapsed(),
            snapshot: self.snapshot.clone(),
        }
    }
}

/// Thread-safe map of connected hosts, keyed by host id.
///
/// All operations take the single internal lock for the duration of the
/// call; none of them block on I/O while holding it.
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, HostEntry>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a host, atomically replacing any prior entry for the same id.
    ///
    /// Returns the replaced session (if any) so its owner can fail the slots
    /// still bound to it. Sets `last_heartbeat` to now.
    pub(crate) fn register(
        &self,
        host_id: &str,
        hostname: &str,
        version: &str,
        session_id: Uuid,
        sender: SendHandle,
        stop: mpsc::Sender<()>,
    ) -> Result<Option<ReplacedSession>, RegistryError> {
        if host_id.is_empty() {
            return Err(RegistryError::EmptyHostId);
        }

        let entry = HostEntry {
            host_id: host_id.to_string(),
            hostname: hostname.to_string(),
            version: version.to_string(),
            session_id,
            sender,
            stop,
            last_heartbeat: Instant::now(),
            snapshot: None,
            status: HostStatus::Online,
        };

        let mut hosts = self.hosts.write().unwrap();
        let replaced = hosts.insert(host_id.to_string(), entry);
        Ok(replaced.map(|prev| ReplacedSession {
            session_id: prev.session_id,
            stop: prev.stop,
        }))
    }

    /// Attach the advertised inventory to a host. No-op if unknown.
    pub fn set_registration(&self, host_id: &str, snapshot: HostRegistration) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(entry) = hosts.get_mut(host_id) {
            entry.snapshot = Some(snapshot);
        }
    }

    /// Advance a host's liveness timestamp. Idempotent with respect to
    /// structure; an `Overdue` host returns to `Online`. No-op if unknown.
    pub fn update_heartbeat(&self, host_id: &str) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(entry) = hosts.get_mut(host_id) {
            entry.last_heartbeat = Instant::now();
            if entry.status == HostStatus::Overdue {
                entry.status = HostStatus::Online;
            }
        }
    }

    /// Fold a heartbeat's availability figures into the stored snapshot so
    /// host selection sees current numbers. No-op if unknown or not yet
    /// registered.
    pub fn set_availability(&self, host_id: &str, cpus: u32, memory_mb: u64, disk_mb: u64) {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(snapshot) = hosts.get_mut(host_id).and_then(|e| e.snapshot.as_mut()) {
            snapshot.available_cpus = cpus;
            snapshot.available_memory_mb = memory_mb;
            snapshot.available_disk_mb = disk_mb;
        }
    }

    pub fn get(&self, host_id: &str) -> Option<HostInfo> {
        self.hosts.read().unwrap().get(host_id).map(HostEntry::info)
    }

    /// Snapshot of all connected hosts at one instant.
    pub fn list(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self
            .hosts
            .read()
            .unwrap()
            .values()
            .map(HostEntry::info)
            .collect();
        hosts.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        hosts
    }

    pub(crate) fn dispatch_target(&self, host_id: &str) -> Option<DispatchTarget> {
        self.hosts.read().unwrap().get(host_id).map(|entry| DispatchTarget {
            sender: entry.sender.clone(),
            session_id: entry.session_id,
        })
    }

    /// Remove a host unconditionally. Idempotent.
    pub fn unregister(&self, host_id: &str) {
        self.hosts.write().unwrap().remove(host_id);
    }

    /// Remove a host only if the entry still belongs to the given session.
    ///
    /// Teardown of a replaced session must not evict its successor.
    pub(crate) fn unregister_session(&self, host_id: &str, session_id: Uuid) -> bool {
        let mut hosts = self.hosts.write().unwrap();
        if hosts.get(host_id).is_some_and(|e| e.session_id == session_id) {
            hosts.remove(host_id);
            true
        } else {
            false
        }
    }

    /// Transition `Online` -> `Overdue` when the host has been quiet longer
    /// than `threshold`. Returns true when the transition happened on this
    /// call. Owner-guarded so a stale monitor cannot flag a fresh session.
    pub(crate) fn mark_overdue_if_stale(
        &self,
        host_id: &str,
        session_id: Uuid,
        threshold: Duration,
    ) -> bool {
        let mut hosts = self.hosts.write().unwrap();
        if let Some(entry) = hosts.get_mut(host_id) {
            if entry.session_id == session_id
                && entry.status == HostStatus::Online
                && entry.last_heartbeat.elapsed() > threshold
            {
                entry.status = HostStatus::Overdue;
                return true;
            }
        }
        false
    }

    /// Pick a host that advertises `image` among its base images.
    ///
    /// Overdue hosts are not considered. Among eligible hosts the one with
    /// the most available CPUs wins; ties go to the lexicographically
    /// smallest host id so selection is deterministic.
    pub fn select_host_for_image(&self, image: &str) -> Option<HostInfo> {
        let hosts = self.hosts.read().unwrap();
        let mut best: Option<&HostEntry> = None;
        for entry in hosts.values() {
            if entry.status != HostStatus::Online {
                continue;
            }
            let Some(snapshot) = entry.snapshot.as_ref() else {
                continue;
            };
            if !snapshot.base_images.iter().any(|i| i == image) {
                continue;
            }
            best = match best {
                None => Some(entry),
                Some(current) => {
                    let current_cpus = current
                        .snapshot
                        .as_ref()
                        .map(|s| s.available_cpus)
                        .unwrap_or(0);
                    if snapshot.available_cpus > current_cpus
                        || (snapshot.available_cpus == current_cpus
                            && entry.host_id < current.host_id)
                    {
                        Some(entry)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best.map(HostEntry::info)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}
