//! Interactive shell sessions multiplexed over a connection.

use crate::bus::{BusEvent, EventHub, ShellExitReason};
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::session::{ConnectionStatus, SessionRegistry, WorkerCommand};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Bytes a session may have queued towards the remote before writes fail
pub const MAX_PENDING_BYTES: usize = 256 * 1024;

/// Closed sessions kept so a repeated `close` still succeeds
pub const RETAINED_CLOSED: usize = 64;

struct ShellState {
    open: bool,
    cols: u32,
    rows: u32,
}

/// Shared state of one shell session.
///
/// The worker owns the channel; callers only ever touch the slot. Events for
/// the session are published under `state`, so nothing is emitted for a
/// session after its exit event.
pub struct ShellSlot {
    pub id: String,
    pub connection_id: String,
    state: Mutex<ShellState>,
    pending_bytes: AtomicUsize,
    hub: Arc<EventHub>,
}

impl ShellSlot {
    pub fn new(connection_id: &str, cols: u32, rows: u32, hub: Arc<EventHub>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            state: Mutex::new(ShellState {
                open: true,
                cols,
                rows,
            }),
            pending_bytes: AtomicUsize::new(0),
            hub,
        })
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn geometry(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.cols, state.rows)
    }

    fn set_geometry(&self, cols: u32, rows: u32) {
        let mut state = self.state.lock();
        state.cols = cols;
        state.rows = rows;
    }

    pub fn emit_data(&self, data: &[u8]) -> bool {
        let state = self.state.lock();
        if !state.open {
            return false;
        }
        self.hub.publish(BusEvent::ShellData {
            connection_id: self.connection_id.clone(),
            session_id: self.id.clone(),
            data: data.to_vec(),
        });
        true
    }

    pub fn emit_error(&self, message: &str) {
        let state = self.state.lock();
        if !state.open {
            return;
        }
        self.hub.publish(BusEvent::ShellError {
            connection_id: self.connection_id.clone(),
            session_id: self.id.clone(),
            message: sanitize(message),
        });
    }

    /// Mark closed and emit the exit event. Only the first call emits.
    pub fn close(&self, reason: ShellExitReason) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.open = false;
        tracing::debug!(
            "Shell session {} closed: {:?} (connection {})",
            self.id,
            reason,
            self.connection_id
        );
        self.hub.publish(BusEvent::ShellExit {
            connection_id: self.connection_id.clone(),
            session_id: self.id.clone(),
            reason,
        });
        true
    }

    /// Account for bytes about to be queued; fails fast when over the limit.
    pub fn reserve(&self, len: usize) -> AppResult<()> {
        self.pending_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                let next = pending.checked_add(len)?;
                (next <= MAX_PENDING_BYTES).then_some(next)
            })
            .map(|_| ())
            .map_err(|pending| {
                AppError::QueueFull(format!(
                    "Shell session {} has {} bytes pending",
                    self.id, pending
                ))
            })
    }

    pub fn release(&self, len: usize) {
        let _ = self
            .pending_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |pending| {
                Some(pending.saturating_sub(len))
            });
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes.load(Ordering::SeqCst)
    }
}

struct Indexed {
    seq: u64,
    slot: Arc<ShellSlot>,
}

/// Caller-facing shell operations
pub struct ShellManager {
    registry: Weak<SessionRegistry>,
    index: DashMap<String, Indexed>,
    next_seq: AtomicU64,
}

impl ShellManager {
    pub fn new(registry: Weak<SessionRegistry>) -> Self {
        Self {
            registry,
            index: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Sessions currently addressable by id.
    pub fn tracked(&self) -> usize {
        self.index.len()
    }

    fn prune(&self, registry: &SessionRegistry) {
        self.index.retain(|_, entry| {
            entry.slot.is_open() || registry.get(&entry.slot.connection_id).is_some()
        });
        let mut closed: Vec<(u64, String)> = self
            .index
            .iter()
            .filter(|entry| !entry.value().slot.is_open())
            .map(|entry| (entry.value().seq, entry.key().clone()))
            .collect();
        if closed.len() <= RETAINED_CLOSED {
            return;
        }
        closed.sort_unstable();
        let excess = closed.len() - RETAINED_CLOSED;
        for (_, id) in closed.into_iter().take(excess) {
            self.index.remove(&id);
        }
    }

    fn registry(&self) -> AppResult<Arc<SessionRegistry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| AppError::Closed("Session registry is gone".to_string()))
    }

    fn slot(&self, session_id: &str) -> AppResult<Arc<ShellSlot>> {
        self.index
            .get(session_id)
            .map(|entry| Arc::clone(&entry.value().slot))
            .ok_or_else(|| AppError::NotFound(format!("Shell session {}", session_id)))
    }

    /// Open a PTY shell; resolves once the remote channel is up.
    pub async fn open(&self, connection_id: &str, cols: u32, rows: u32) -> AppResult<String> {
        if cols == 0 || rows == 0 {
            return Err(AppError::Validation(format!(
                "Invalid terminal size {}x{}",
                cols, rows
            )));
        }
        let registry = self.registry()?;
        let handle = registry
            .get(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;
        if handle.status() != ConnectionStatus::Connected {
            return Err(AppError::NotConnected(connection_id.to_string()));
        }

        let slot = ShellSlot::new(connection_id, cols, rows, registry.hub());
        let (reply, opened) = oneshot::channel();
        handle.send(WorkerCommand::OpenShell {
            slot: Arc::clone(&slot),
            reply,
        })?;
        opened
            .await
            .map_err(|_| AppError::NotConnected(connection_id.to_string()))??;

        self.prune(&registry);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.index.insert(
            slot.id.clone(),
            Indexed {
                seq,
                slot: Arc::clone(&slot),
            },
        );
        tracing::info!(
            "Opened shell session {} ({}x{}) (connection {})",
            slot.id,
            cols,
            rows,
            connection_id
        );
        Ok(slot.id.clone())
    }

    /// Queue bytes for the remote shell. Never blocks.
    pub fn write(&self, session_id: &str, data: &[u8]) -> AppResult<()> {
        let slot = self.slot(session_id)?;
        if !slot.is_open() {
            return Err(AppError::Closed(format!("Shell session {}", session_id)));
        }
        if data.is_empty() {
            return Ok(());
        }
        let handle = self
            .registry()?
            .get(&slot.connection_id)
            .ok_or_else(|| AppError::Closed(format!("Shell session {}", session_id)))?;

        slot.reserve(data.len())?;
        if let Err(e) = handle.send(WorkerCommand::Write {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        }) {
            slot.release(data.len());
            return Err(match e {
                AppError::NotConnected(_) => AppError::Closed(format!("Shell session {}", session_id)),
                other => other,
            });
        }
        Ok(())
    }

    /// Best effort; a rejected resize is logged by the worker and dropped.
    pub fn resize(&self, session_id: &str, cols: u32, rows: u32) -> AppResult<()> {
        let slot = self.slot(session_id)?;
        if !slot.is_open() || cols == 0 || rows == 0 {
            return Ok(());
        }
        slot.set_geometry(cols, rows);
        let Some(handle) = self.registry()?.get(&slot.connection_id) else {
            return Ok(());
        };
        if let Err(e) = handle.send(WorkerCommand::Resize {
            session_id: session_id.to_string(),
            cols,
            rows,
        }) {
            tracing::warn!("Dropped resize for shell session {}: {}", session_id, e);
        }
        Ok(())
    }

    /// Idempotent.
    pub fn close(&self, session_id: &str) -> AppResult<()> {
        let slot = self.slot(session_id)?;
        if !slot.close(ShellExitReason::Closed) {
            return Ok(());
        }
        if let Some(handle) = self.registry()?.get(&slot.connection_id) {
            if let Err(e) = handle.send(WorkerCommand::CloseShell {
                session_id: session_id.to_string(),
            }) {
                tracing::debug!("Close of shell session {} not delivered: {}", session_id, e);
            }
        }
        Ok(())
    }

    pub fn is_open(&self, session_id: &str) -> AppResult<bool> {
        Ok(self.slot(session_id)?.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventFilter, EventTopic};

    #[test]
    fn test_close_emits_single_exit() {
        let hub = EventHub::new();
        let mut exits = hub.subscribe(EventTopic::ShellExit, EventFilter::default());
        let slot = ShellSlot::new("c1", 80, 24, Arc::clone(&hub));

        assert!(slot.close(ShellExitReason::Closed));
        assert!(!slot.close(ShellExitReason::Disconnected));
        assert!(exits.try_recv().is_some());
        assert!(exits.try_recv().is_none());
    }

    #[test]
    fn test_no_data_after_exit() {
        let hub = EventHub::new();
        let mut data = hub.subscribe(EventTopic::ShellData, EventFilter::default());
        let slot = ShellSlot::new("c1", 80, 24, Arc::clone(&hub));

        assert!(slot.emit_data(b"before"));
        slot.close(ShellExitReason::Closed);
        assert!(!slot.emit_data(b"after"));

        match data.try_recv() {
            Some(BusEvent::ShellData { data, .. }) => assert_eq!(data, b"before"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(data.try_recv().is_none());
    }

    #[test]
    fn test_reserve_fails_fast_over_limit() {
        let slot = ShellSlot::new("c1", 80, 24, EventHub::new());
        slot.reserve(MAX_PENDING_BYTES - 10).unwrap();
        let err = slot.reserve(11).unwrap_err();
        assert!(matches!(err, AppError::QueueFull(_)));
        assert_eq!(slot.pending_bytes(), MAX_PENDING_BYTES - 10);

        slot.release(100);
        slot.reserve(11).unwrap();
    }

    #[test]
    fn test_error_is_sanitized() {
        let hub = EventHub::new();
        let mut errors = hub.subscribe(EventTopic::ShellError, EventFilter::default());
        let slot = ShellSlot::new("c1", 80, 24, Arc::clone(&hub));
        slot.emit_error("write failed, password=hunter2");

        match errors.try_recv() {
            Some(BusEvent::ShellError { message, .. }) => assert!(!message.contains("hunter2")),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
