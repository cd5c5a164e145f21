//! The single owner of a connection's transport.
//!
//! Each connection gets one OS thread running [`Worker::run`]. The thread
//! holds the `RemoteSession` and every channel opened on it, so the remote
//! never sees interleaved requests. Callers talk to it through
//! [`WorkerCommand`]s and observe it through bus events.

use super::connection::{ConnectionHandle, ConnectionStatus, Teardown, WorkerCommand};
use super::tunnel::TunnelRuntime;
use crate::bus::ShellExitReason;
use crate::config::SessionSettings;
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::sftp::{ActiveOperation, OperationOutcome, Step};
use crate::shell::ShellSlot;
use crate::supervisor::Supervisor;
use crate::transport::{ByteChannel, Endpoint, ReadOutcome, RemoteSession, Transport, TunnelSpec};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::oneshot;

const COMMAND_BATCH: usize = 32;
const READ_BUF_BYTES: usize = 32 * 1024;
const READS_PER_TICK: usize = 8;
const WRITE_CHUNK_BYTES: usize = 8 * 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(2);
const WAIT_SLICE: Duration = Duration::from_millis(5);

/// Everything a worker needs, handed over at spawn time
pub struct WorkerContext {
    pub handle: Arc<ConnectionHandle>,
    pub commands: mpsc::Receiver<WorkerCommand>,
    pub transport: Arc<dyn Transport>,
    pub endpoint: Endpoint,
    pub tunnels: Vec<TunnelSpec>,
    pub settings: SessionSettings,
    pub connections: Arc<DashMap<String, Arc<ConnectionHandle>>>,
}

/// Start the worker thread. `ready` resolves once the first connect
/// attempt sequence has succeeded or failed.
pub fn spawn(ctx: WorkerContext, ready: oneshot::Sender<AppResult<()>>) -> AppResult<()> {
    let name = format!("remux-conn-{}", ctx.handle.id);
    let worker = Worker::new(ctx);
    thread::Builder::new()
        .name(name)
        .spawn(move || worker.run(ready))?;
    Ok(())
}

enum Established {
    Up(Box<dyn RemoteSession>),
    Stopped,
    Failed(AppError),
}

enum Tick {
    Busy,
    Idle,
    Stop,
}

struct LiveShell {
    slot: Arc<ShellSlot>,
    channel: Box<dyn ByteChannel>,
    outbox: Vec<u8>,
}

struct Worker {
    handle: Arc<ConnectionHandle>,
    commands: mpsc::Receiver<WorkerCommand>,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    tunnel_specs: Vec<TunnelSpec>,
    settings: SessionSettings,
    connections: Arc<DashMap<String, Arc<ConnectionHandle>>>,
    supervisor: Supervisor,
    remote: Option<Box<dyn RemoteSession>>,
    shells: HashMap<String, LiveShell>,
    operation: Option<ActiveOperation>,
    tunnels: Option<TunnelRuntime>,
    shutdown_ack: Option<oneshot::Sender<()>>,
}

impl Worker {
    fn new(ctx: WorkerContext) -> Self {
        Self {
            supervisor: Supervisor::new(&ctx.settings),
            handle: ctx.handle,
            commands: ctx.commands,
            transport: ctx.transport,
            endpoint: ctx.endpoint,
            tunnel_specs: ctx.tunnels,
            settings: ctx.settings,
            connections: ctx.connections,
            remote: None,
            shells: HashMap::new(),
            operation: None,
            tunnels: None,
            shutdown_ack: None,
        }
    }

    fn run(mut self, ready: oneshot::Sender<AppResult<()>>) {
        match self.establish(true) {
            Established::Up(remote) => {
                self.remote = Some(remote);
                self.on_connected();
                let _ = ready.send(Ok(()));
                self.serve();
            }
            Established::Stopped => {
                let _ = ready.send(Err(AppError::Closed(format!(
                    "Connection {} was disconnected while connecting",
                    self.handle.id
                ))));
            }
            Established::Failed(e) => {
                tracing::error!("Connection {} failed: {}", self.handle.id, sanitize(&e.to_string()));
                self.handle
                    .set_status(ConnectionStatus::Failed, Some(&e.to_string()));
                self.unregister();
                let _ = ready.send(Err(e));
            }
        }
        self.finish();
    }

    /// Connect, retrying network failures with the supervisor's backoff.
    /// With `immediate` the first attempt does not wait.
    fn establish(&mut self, immediate: bool) -> Established {
        let mut wait_first = !immediate;
        let mut last_error = None;
        loop {
            if wait_first {
                match self.supervisor.next_attempt() {
                    Some(delay) => {
                        self.handle.set_reconnect_attempt(self.supervisor.attempt());
                        tracing::info!(
                            "Connection {} retrying in {:?} (attempt {})",
                            self.handle.id,
                            delay,
                            self.supervisor.attempt()
                        );
                        if !self.idle_wait(delay) {
                            return Established::Stopped;
                        }
                    }
                    None => {
                        return Established::Failed(last_error.unwrap_or_else(|| {
                            AppError::Network("Reconnect attempts exhausted".to_string())
                        }))
                    }
                }
            }
            wait_first = true;

            if self.handle.is_closing() {
                return Established::Stopped;
            }
            match self
                .transport
                .connect(&self.endpoint, self.settings.handshake_timeout())
            {
                Ok(mut remote) => {
                    if self.handle.is_closing() {
                        remote.close();
                        return Established::Stopped;
                    }
                    return Established::Up(remote);
                }
                Err(e) if !e.is_connection_fatal() => return Established::Failed(e),
                Err(e) => {
                    tracing::warn!(
                        "Connect attempt failed (connection {}): {}",
                        self.handle.id,
                        sanitize(&e.to_string())
                    );
                    last_error = Some(e);
                }
            }
        }
    }

    /// Sleep while the transport is down, still answering commands.
    /// Returns false if a shutdown arrived.
    fn idle_wait(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(WorkerCommand::OpenShell { reply, .. }) => {
                        let _ = reply.send(Err(AppError::NotConnected(self.handle.id.clone())));
                    }
                    Ok(WorkerCommand::Shutdown { ack }) => {
                        self.shutdown_ack = Some(ack);
                        return false;
                    }
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return false,
                }
            }
            if self.handle.is_closing() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn on_connected(&mut self) {
        self.supervisor.connected();
        if !self.tunnel_specs.is_empty() {
            let tunnels = TunnelRuntime::bind(&self.handle.id, &self.tunnel_specs);
            self.handle.set_bound_ports(&tunnels.bound_ports());
            self.tunnels = Some(tunnels);
        }
        self.handle.set_accepting(true);
        self.handle.set_status(ConnectionStatus::Connected, None);
        tracing::info!("Connection {} established", self.handle.id);
    }

    fn serve(&mut self) {
        loop {
            if self.handle.is_closing() {
                return;
            }
            match self.tick() {
                Ok(Tick::Busy) => {}
                Ok(Tick::Idle) => thread::sleep(IDLE_SLEEP),
                Ok(Tick::Stop) => return,
                Err(e) => {
                    if !self.recover(e) {
                        return;
                    }
                }
            }
        }
    }

    fn tick(&mut self) -> AppResult<Tick> {
        let mut busy = false;

        for _ in 0..COMMAND_BATCH {
            match self.commands.try_recv() {
                Ok(command) => {
                    busy = true;
                    if !self.handle_command(command)? {
                        return Ok(Tick::Stop);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Ok(Tick::Stop),
            }
        }

        busy |= self.pump_shells()?;
        busy |= self.step_operation()?;
        if let (Some(tunnels), Some(remote)) = (self.tunnels.as_mut(), self.remote.as_mut()) {
            busy |= tunnels.pump(remote.as_mut())?;
        }

        if self.supervisor.probe_due(Instant::now()) {
            self.supervisor.probe_started();
            tracing::debug!("Probing idle connection {}", self.handle.id);
            let probe_timeout = self.settings.probe_timeout();
            self.remote_mut()?.probe(probe_timeout)?;
            self.supervisor.probe_acked();
        }

        Ok(if busy { Tick::Busy } else { Tick::Idle })
    }

    fn remote_mut(&mut self) -> AppResult<&mut dyn RemoteSession> {
        match self.remote.as_mut() {
            Some(remote) => Ok(remote.as_mut()),
            None => Err(AppError::Network(format!(
                "Connection {} has no transport",
                self.handle.id
            ))),
        }
    }

    /// Returns false when the worker should stop.
    fn handle_command(&mut self, command: WorkerCommand) -> AppResult<bool> {
        match command {
            WorkerCommand::OpenShell { slot, reply } => {
                if self.handle.is_closing() {
                    let _ = reply.send(Err(AppError::NotConnected(self.handle.id.clone())));
                    return Ok(true);
                }
                let (cols, rows) = slot.geometry();
                let opened = self.remote_mut()?.open_shell(cols, rows);
                match opened {
                    Ok(mut channel) => {
                        self.handle.register_shell(Arc::clone(&slot));
                        if reply.send(Ok(())).is_err() {
                            // caller went away before learning the id
                            channel.close();
                            slot.close(ShellExitReason::Closed);
                            self.handle.forget_shell(&slot.id);
                        } else {
                            self.shells.insert(
                                slot.id.clone(),
                                LiveShell {
                                    slot,
                                    channel,
                                    outbox: Vec::new(),
                                },
                            );
                        }
                    }
                    Err(e) if e.is_connection_fatal() => {
                        let _ = reply.send(Err(AppError::NotConnected(self.handle.id.clone())));
                        return Err(e);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            WorkerCommand::Write { session_id, data } => match self.shells.get_mut(&session_id) {
                Some(shell) => shell.outbox.extend_from_slice(&data),
                None => tracing::debug!("Dropping write for closed shell session {}", session_id),
            },
            WorkerCommand::Resize {
                session_id,
                cols,
                rows,
            } => {
                if let Some(shell) = self.shells.get_mut(&session_id) {
                    match shell.channel.resize(cols, rows) {
                        Ok(()) => {}
                        Err(e) if e.is_connection_fatal() => return Err(e),
                        Err(e) => tracing::warn!(
                            "Resize of shell session {} rejected: {}",
                            session_id,
                            e
                        ),
                    }
                }
            }
            WorkerCommand::CloseShell { session_id } => {
                if let Some(mut shell) = self.shells.remove(&session_id) {
                    shell.channel.close();
                    shell.slot.close(ShellExitReason::Closed);
                }
                self.handle.forget_shell(&session_id);
            }
            WorkerCommand::Shutdown { ack } => {
                self.shutdown_ack = Some(ack);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn pump_shells(&mut self) -> AppResult<bool> {
        let mut busy = false;
        let mut ended: Vec<(String, ShellExitReason, Option<String>)> = Vec::new();
        let mut buf = [0u8; READ_BUF_BYTES];

        for (session_id, shell) in self.shells.iter_mut() {
            for _ in 0..READS_PER_TICK {
                match shell.channel.read(&mut buf) {
                    Ok(ReadOutcome::Data(n)) => {
                        busy = true;
                        self.supervisor.note_activity();
                        shell.slot.emit_data(&buf[..n]);
                    }
                    Ok(ReadOutcome::Idle) => break,
                    Ok(ReadOutcome::Eof { exit_status }) => {
                        ended.push((
                            session_id.clone(),
                            ShellExitReason::Remote { exit_status },
                            None,
                        ));
                        break;
                    }
                    Err(e) if e.is_connection_fatal() => return Err(e),
                    Err(e) => {
                        ended.push((
                            session_id.clone(),
                            ShellExitReason::Remote { exit_status: None },
                            Some(e.to_string()),
                        ));
                        break;
                    }
                }
            }

            if !shell.outbox.is_empty() {
                let take = shell.outbox.len().min(WRITE_CHUNK_BYTES);
                match shell.channel.write(&shell.outbox[..take]) {
                    Ok(0) => {}
                    Ok(n) => {
                        busy = true;
                        shell.outbox.drain(..n);
                        shell.slot.release(n);
                    }
                    Err(e) if e.is_connection_fatal() => return Err(e),
                    Err(e) => ended.push((
                        session_id.clone(),
                        ShellExitReason::Remote { exit_status: None },
                        Some(e.to_string()),
                    )),
                }
            }
        }

        for (session_id, reason, error) in ended {
            if let Some(mut shell) = self.shells.remove(&session_id) {
                if let Some(message) = error {
                    tracing::warn!("Shell session {} failed: {}", session_id, sanitize(&message));
                    shell.slot.emit_error(&message);
                }
                shell.channel.close();
                shell.slot.close(reason);
                self.handle.forget_shell(&session_id);
                busy = true;
            }
        }
        Ok(busy)
    }

    fn step_operation(&mut self) -> AppResult<bool> {
        if self.operation.is_none() {
            if let Some(slot) = self.handle.next_operation() {
                match slot.start() {
                    Some(request) => self.operation = Some(ActiveOperation::new(slot, request)),
                    None => self.handle.clear_active(&slot.id),
                }
            }
        }

        let Some(operation) = self.operation.as_mut() else {
            return Ok(false);
        };
        let slot = Arc::clone(operation.slot());
        if slot.is_terminal() {
            // cancelled while running
            self.operation = None;
            self.handle.clear_active(&slot.id);
            return Ok(true);
        }

        let remote = match self.remote.as_mut() {
            Some(remote) => remote.as_mut(),
            None => return Err(AppError::Network("No transport".to_string())),
        };
        match operation.step(remote) {
            Step::Pending => {}
            Step::Finished(result) => {
                self.operation = None;
                match result {
                    Ok(result) => {
                        self.supervisor.note_activity();
                        slot.finish(OperationOutcome::Done { result });
                    }
                    Err(e) if e.is_connection_fatal() => return Err(e),
                    Err(e) => {
                        tracing::warn!(
                            "Operation {} failed (connection {}): {}",
                            slot.id,
                            self.handle.id,
                            sanitize(&e.to_string())
                        );
                        slot.finish(OperationOutcome::Failed {
                            reason: sanitize(&e.to_string()),
                        });
                    }
                }
                self.handle.clear_active(&slot.id);
            }
        }
        Ok(true)
    }

    /// Tear down after a fatal transport error and try to come back.
    /// Returns false when the worker should stop.
    fn recover(&mut self, err: AppError) -> bool {
        let reason = err.to_string();
        tracing::warn!("Connection {} lost: {}", self.handle.id, sanitize(&reason));

        self.drop_transport();
        self.handle.teardown(&Teardown::Lost {
            reason: reason.clone(),
        });
        if !self
            .handle
            .set_status(ConnectionStatus::Reconnecting, Some(&reason))
        {
            return false;
        }

        self.supervisor.link_lost();
        match self.establish(false) {
            Established::Up(remote) => {
                self.remote = Some(remote);
                self.on_connected();
                true
            }
            Established::Stopped => false,
            Established::Failed(e) => {
                self.supervisor.give_up();
                tracing::error!(
                    "Connection {} gave up reconnecting: {}",
                    self.handle.id,
                    sanitize(&e.to_string())
                );
                self.handle
                    .set_status(ConnectionStatus::Failed, Some(&e.to_string()));
                self.unregister();
                false
            }
        }
    }

    fn drop_transport(&mut self) {
        for (_, mut shell) in self.shells.drain() {
            shell.channel.close();
        }
        self.operation = None;
        if let Some(mut tunnels) = self.tunnels.take() {
            tunnels.close();
        }
        if let Some(mut remote) = self.remote.take() {
            remote.close();
        }
    }

    fn unregister(&self) {
        self.connections
            .remove_if(&self.handle.id, |_, existing| Arc::ptr_eq(existing, &self.handle));
    }

    fn finish(&mut self) {
        self.drop_transport();
        self.handle.teardown(&Teardown::Disconnected);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                WorkerCommand::OpenShell { reply, .. } => {
                    let _ = reply.send(Err(AppError::NotConnected(self.handle.id.clone())));
                }
                WorkerCommand::Shutdown { ack } => {
                    let _ = ack.send(());
                }
                _ => {}
            }
        }
        if let Some(ack) = self.shutdown_ack.take() {
            let _ = ack.send(());
        }
        tracing::debug!("Worker for connection {} stopped", self.handle.id);
    }
}
