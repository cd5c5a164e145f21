use crate::bus::{BusEvent, EventHub, ShellExitReason};
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::sftp::{OperationOutcome, OperationQueue, OperationSlot};
use crate::shell::ShellSlot;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;

/// Depth of a connection's command channel
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Failed)
    }

    fn can_become(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Reconnecting)
                | (Connected, Failed)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
        )
    }
}

/// Local forward as requested and as actually bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelBinding {
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
    /// Local port in use, `None` while the transport is down
    pub bound_port: Option<u16>,
}

/// Point-in-time view of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub status: ConnectionStatus,
    pub connected_at: Option<i64>,
    pub reconnect_attempt: u32,
    pub shells: usize,
    pub pending_operations: usize,
    pub tunnels: Vec<TunnelBinding>,
}

/// Commands consumed by the connection worker
pub enum WorkerCommand {
    OpenShell {
        slot: Arc<ShellSlot>,
        reply: oneshot::Sender<AppResult<()>>,
    },
    Write {
        session_id: String,
        data: Vec<u8>,
    },
    Resize {
        session_id: String,
        cols: u32,
        rows: u32,
    },
    CloseShell {
        session_id: String,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Why children of a connection are being torn down
#[derive(Debug, Clone)]
pub enum Teardown {
    Lost { reason: String },
    Disconnected,
}

/// Registry record for one connection.
///
/// Shared between the registry, the managers and the worker thread. Only the
/// worker touches the transport; everything here is bookkeeping that any
/// thread may read.
pub struct ConnectionHandle {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    status: RwLock<ConnectionStatus>,
    connected_at: RwLock<Option<i64>>,
    reconnect_attempt: AtomicU32,
    closing: AtomicBool,
    commands: mpsc::Sender<WorkerCommand>,
    shells: DashMap<String, Arc<ShellSlot>>,
    queue: Mutex<OperationQueue>,
    tunnels: RwLock<Vec<TunnelBinding>>,
    hub: Arc<EventHub>,
}

impl ConnectionHandle {
    pub fn new(
        id: String,
        host: String,
        port: u16,
        username: String,
        tunnels: Vec<TunnelBinding>,
        hub: Arc<EventHub>,
    ) -> (Arc<Self>, mpsc::Receiver<WorkerCommand>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let handle = Arc::new(Self {
            id,
            host,
            port,
            username,
            status: RwLock::new(ConnectionStatus::Connecting),
            connected_at: RwLock::new(None),
            reconnect_attempt: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            commands,
            shells: DashMap::new(),
            queue: Mutex::new(OperationQueue::default()),
            tunnels: RwLock::new(tunnels),
            hub,
        });
        (handle, rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn emit_current_status(&self) {
        let status = self.status.read();
        self.hub.publish(BusEvent::ConnectionStatus {
            connection_id: self.id.clone(),
            status: *status,
            reason: None,
        });
    }

    /// Apply a transition and emit it. Refused transitions return false.
    /// Once the handle is closing only the final `Disconnected` is allowed.
    pub fn set_status(&self, next: ConnectionStatus, reason: Option<&str>) -> bool {
        let mut status = self.status.write();
        if !status.can_become(next) {
            return false;
        }
        if self.is_closing() && next != ConnectionStatus::Disconnected {
            return false;
        }
        *status = next;
        match next {
            ConnectionStatus::Connected => {
                *self.connected_at.write() = Some(chrono::Utc::now().timestamp());
                self.reconnect_attempt.store(0, Ordering::SeqCst);
            }
            ConnectionStatus::Reconnecting | ConnectionStatus::Failed | ConnectionStatus::Disconnected => {
                *self.connected_at.write() = None;
            }
            ConnectionStatus::Connecting => {}
        }
        tracing::info!("Connection {} is now {:?}", self.id, next);
        self.hub.publish(BusEvent::ConnectionStatus {
            connection_id: self.id.clone(),
            status: next,
            reason: reason.map(sanitize),
        });
        true
    }

    pub fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::SeqCst);
    }

    /// First caller wins; later callers see false.
    pub fn claim_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn send(&self, command: WorkerCommand) -> AppResult<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                AppError::QueueFull(format!("Connection {} command queue is full", self.id))
            }
            TrySendError::Closed(_) => AppError::NotConnected(self.id.clone()),
        })
    }

    pub fn register_shell(&self, slot: Arc<ShellSlot>) {
        self.shells.insert(slot.id.clone(), slot);
    }

    pub fn forget_shell(&self, session_id: &str) {
        self.shells.remove(session_id);
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.queue.lock().set_accepting(accepting);
    }

    pub fn enqueue(&self, slot: Arc<OperationSlot>) -> bool {
        self.queue.lock().push(slot)
    }

    pub fn next_operation(&self) -> Option<Arc<OperationSlot>> {
        self.queue.lock().next()
    }

    pub fn clear_active(&self, operation_id: &str) {
        self.queue.lock().clear_active(operation_id);
    }

    pub fn set_bound_ports(&self, ports: &[Option<u16>]) {
        let mut tunnels = self.tunnels.write();
        for (binding, port) in tunnels.iter_mut().zip(ports) {
            binding.bound_port = *port;
        }
    }

    pub fn tunnels(&self) -> Vec<TunnelBinding> {
        self.tunnels.read().clone()
    }

    /// Close every shell and settle every operation exactly once.
    ///
    /// A lost link fails the running operation; a requested disconnect
    /// cancels it. Queued operations are always cancelled.
    pub fn teardown(&self, cause: &Teardown) {
        let (active, pending) = self.queue.lock().drain();
        if let Some(active) = active {
            let outcome = match cause {
                Teardown::Lost { reason } => OperationOutcome::Failed {
                    reason: sanitize(reason),
                },
                Teardown::Disconnected => OperationOutcome::Cancelled,
            };
            active.finish(outcome);
        }
        for slot in pending {
            slot.finish(OperationOutcome::Cancelled);
        }

        let shells: Vec<Arc<ShellSlot>> = self
            .shells
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.shells.clear();
        for slot in shells {
            slot.close(match cause {
                Teardown::Lost { reason } => ShellExitReason::ConnectionLost {
                    reason: sanitize(reason),
                },
                Teardown::Disconnected => ShellExitReason::Disconnected,
            });
        }

        let ports = vec![None; self.tunnels.read().len()];
        self.set_bound_ports(&ports);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            status: self.status(),
            connected_at: *self.connected_at.read(),
            reconnect_attempt: self.reconnect_attempt.load(Ordering::SeqCst),
            shells: self.shells.iter().filter(|entry| entry.value().is_open()).count(),
            pending_operations: self.queue.lock().outstanding(),
            tunnels: self.tunnels(),
        }
    }
}
