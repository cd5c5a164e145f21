//! Per-connection file operation queue.
//!
//! Operations are submitted from any thread and executed strictly one at a
//! time, in submission order, by the owning connection's worker. Each
//! operation's lifecycle lives in an [`OperationSlot`]; every event for an
//! operation is published while holding the slot's state lock, so a cancel
//! racing a completion produces exactly one terminal `sftp.done`.

pub mod executor;
pub mod types;

pub use executor::{ActiveOperation, Step};
pub use types::*;

use crate::bus::{BusEvent, EventHub};
use crate::error::{AppError, AppResult};
use crate::session::{ConnectionStatus, SessionRegistry};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Lifecycle of one submitted operation
pub struct OperationSlot {
    pub id: String,
    pub connection_id: String,
    pub kind: &'static str,
    request: Mutex<Option<FileRequest>>,
    state: Mutex<OperationStatus>,
    hub: Arc<EventHub>,
}

impl OperationSlot {
    pub fn new(connection_id: &str, request: FileRequest, hub: Arc<EventHub>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            kind: request.kind(),
            request: Mutex::new(Some(request)),
            state: Mutex::new(OperationStatus::Queued),
            hub,
        })
    }

    pub fn status(&self) -> OperationStatus {
        *self.state.lock()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Queued -> Running. Hands the request to the executor exactly once.
    pub fn start(&self) -> Option<FileRequest> {
        let mut state = self.state.lock();
        if *state != OperationStatus::Queued {
            return None;
        }
        let request = self.request.lock().take()?;
        *state = OperationStatus::Running;
        Some(request)
    }

    /// Ignored unless the operation is still running.
    pub fn report_progress(&self, transferred: u64, total: u64) -> bool {
        let state = self.state.lock();
        if *state != OperationStatus::Running {
            return false;
        }
        self.hub.publish(BusEvent::SftpProgress {
            connection_id: self.connection_id.clone(),
            operation_id: self.id.clone(),
            transferred,
            total,
        });
        true
    }

    /// Move to a terminal state. Returns false if one was already reached.
    pub fn finish(&self, outcome: OperationOutcome) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = outcome.status();
        self.request.lock().take();
        tracing::debug!(
            "Operation {} ({}) finished as {:?} (connection {})",
            self.id,
            self.kind,
            *state,
            self.connection_id
        );
        self.hub.publish(BusEvent::SftpDone {
            connection_id: self.connection_id.clone(),
            operation_id: self.id.clone(),
            outcome,
        });
        true
    }
}

/// FIFO of operations owned by one connection
#[derive(Default)]
pub struct OperationQueue {
    accepting: bool,
    pending: VecDeque<Arc<OperationSlot>>,
    active: Option<Arc<OperationSlot>>,
}

impl OperationQueue {
    pub fn set_accepting(&mut self, accepting: bool) {
        self.accepting = accepting;
    }

    pub fn push(&mut self, slot: Arc<OperationSlot>) -> bool {
        if !self.accepting {
            return false;
        }
        self.pending.push_back(slot);
        true
    }

    /// Next operation to run, skipping ones cancelled while queued.
    /// Returns `None` while another operation is active.
    pub fn next(&mut self) -> Option<Arc<OperationSlot>> {
        if self.active.is_some() {
            return None;
        }
        while let Some(slot) = self.pending.pop_front() {
            if !slot.is_terminal() {
                self.active = Some(Arc::clone(&slot));
                return Some(slot);
            }
        }
        None
    }

    pub fn clear_active(&mut self, id: &str) {
        if self.active.as_ref().map(|slot| slot.id.as_str()) == Some(id) {
            self.active = None;
        }
    }

    /// Stop accepting and hand back everything that has not finished.
    pub fn drain(&mut self) -> (Option<Arc<OperationSlot>>, Vec<Arc<OperationSlot>>) {
        self.accepting = false;
        (self.active.take(), self.pending.drain(..).collect())
    }

    pub fn outstanding(&self) -> usize {
        self.active
            .iter()
            .chain(self.pending.iter())
            .filter(|slot| !slot.is_terminal())
            .count()
    }
}

/// Finished operations still answering `cancel` and `status`
pub const RETAINED_FINISHED: usize = 256;

struct Indexed {
    seq: u64,
    slot: Arc<OperationSlot>,
}

/// Entry point for file operations, across all connections
pub struct FileQueue {
    registry: Weak<SessionRegistry>,
    index: DashMap<String, Indexed>,
    next_seq: AtomicU64,
}

impl FileQueue {
    pub fn new(registry: Weak<SessionRegistry>) -> Self {
        Self {
            registry,
            index: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Operations currently addressable by id.
    pub fn tracked(&self) -> usize {
        self.index.len()
    }

    fn lookup(&self, operation_id: &str) -> AppResult<Arc<OperationSlot>> {
        self.index
            .get(operation_id)
            .map(|entry| Arc::clone(&entry.value().slot))
            .ok_or_else(|| AppError::NotFound(format!("Operation {}", operation_id)))
    }

    /// Forget finished operations of connections that are gone, then the
    /// oldest finished ones beyond [`RETAINED_FINISHED`].
    fn prune(&self, registry: &SessionRegistry) {
        self.index.retain(|_, entry| {
            !entry.slot.is_terminal() || registry.get(&entry.slot.connection_id).is_some()
        });
        let mut finished: Vec<(u64, String)> = self
            .index
            .iter()
            .filter(|entry| entry.value().slot.is_terminal())
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        if finished.len() <= RETAINED_FINISHED {
            return;
        }
        finished.sort_unstable();
        let excess = finished.len() - RETAINED_FINISHED;
        for (_, id) in finished.into_iter().take(excess) {
            self.index.remove(&id);
        }
    }

    fn registry(&self) -> AppResult<Arc<SessionRegistry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| AppError::Closed("Session registry is gone".to_string()))
    }

    /// Enqueue an operation; returns its id immediately.
    pub fn submit(&self, connection_id: &str, request: FileRequest) -> AppResult<String> {
        request.validate()?;
        let registry = self.registry()?;
        let handle = registry
            .get(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;
        if handle.status() != ConnectionStatus::Connected {
            return Err(AppError::NotConnected(connection_id.to_string()));
        }

        let slot = OperationSlot::new(connection_id, request, registry.hub());
        if !handle.enqueue(Arc::clone(&slot)) {
            return Err(AppError::NotConnected(connection_id.to_string()));
        }
        tracing::debug!(
            "Queued {} operation {} (connection {})",
            slot.kind,
            slot.id,
            connection_id
        );

        self.prune(&registry);
        let id = slot.id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.index.insert(id.clone(), Indexed { seq, slot });
        Ok(id)
    }

    /// True if the operation was queued or running and is now cancelled.
    pub fn cancel(&self, operation_id: &str) -> AppResult<bool> {
        let slot = self.lookup(operation_id)?;
        let cancelled = slot.finish(OperationOutcome::Cancelled);
        if cancelled {
            tracing::info!(
                "Cancelled operation {} (connection {})",
                operation_id,
                slot.connection_id
            );
        }
        Ok(cancelled)
    }

    pub fn status(&self, operation_id: &str) -> AppResult<OperationStatus> {
        Ok(self.lookup(operation_id)?.status())
    }
}
