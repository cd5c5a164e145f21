//! The command/event bus: the only surface the UI talks to.
//!
//! Requests name a channel from a fixed allow-list; the channel is checked
//! before the payload is even decoded, so a refused request never reaches a
//! component. Events are delivered through [`Subscription`] handles.

pub mod channels;
pub mod events;
pub mod hub;

pub use channels::{Channel, RequestEnvelope, WriteData};
pub use events::{parse_topic, BusEvent, EventFilter, EventTopic, ShellExitReason};
pub use hub::{EventHub, Subscription};

use crate::config::{AppSettings, SessionSettings};
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::session::{ConnectionSpec, SessionRegistry};
use crate::sftp::{FileQueue, FileRequest};
use crate::shell::ShellManager;
use crate::transport::Transport;
use channels::{
    ConnectionRef, GetPayload, OperationRef, PathPayload, PutPayload, RenamePayload, SessionRef,
    ShellOpenPayload, ShellResizePayload, ShellWritePayload,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Held while a request id is being handled
struct InFlight<'a> {
    requests: &'a DashMap<String, ()>,
    id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.requests.remove(&self.id);
    }
}

pub struct Bus {
    registry: Arc<SessionRegistry>,
    shells: ShellManager,
    files: FileQueue,
    in_flight: DashMap<String, ()>,
}

impl Bus {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings) -> Self {
        Self::with_registry(SessionRegistry::new(transport, settings, EventHub::new()))
    }

    pub fn from_settings(transport: Arc<dyn Transport>, settings: &AppSettings) -> Self {
        Self::with_registry(
            SessionRegistry::new(transport, settings.session.clone(), EventHub::new())
                .with_default_port(settings.ssh.default_port),
        )
    }

    fn with_registry(registry: SessionRegistry) -> Self {
        let registry = Arc::new(registry);
        Self {
            shells: ShellManager::new(Arc::downgrade(&registry)),
            files: FileQueue::new(Arc::downgrade(&registry)),
            registry,
            in_flight: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Send a request under a fresh id.
    pub async fn request(&self, channel: &str, payload: Value) -> AppResult<Value> {
        self.dispatch(RequestEnvelope {
            id: Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            payload,
        })
        .await
    }

    pub async fn dispatch(&self, envelope: RequestEnvelope) -> AppResult<Value> {
        let channel: Channel = match envelope.channel.parse() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    "Refused request {} on channel '{}'",
                    envelope.id,
                    sanitize(&envelope.channel)
                );
                return Err(e);
            }
        };

        let _guard = self.claim(&envelope.id)?;
        tracing::debug!("Request {} on {}", envelope.id, channel);
        self.route(channel, envelope.payload).await
    }

    /// Attach to an event stream. Unknown topics are refused.
    pub fn subscribe(&self, topic: &str, filter: EventFilter) -> AppResult<Subscription> {
        let topic = parse_topic(topic)?;
        Ok(self.registry.hub().subscribe(topic, filter))
    }

    fn claim(&self, id: &str) -> AppResult<InFlight<'_>> {
        match self.in_flight.entry(id.to_string()) {
            Entry::Occupied(_) => Err(AppError::Config(format!(
                "Request {} is already in flight",
                id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(InFlight {
                    requests: &self.in_flight,
                    id: id.to_string(),
                })
            }
        }
    }

    async fn route(&self, channel: Channel, payload: Value) -> AppResult<Value> {
        match channel {
            Channel::Connect => {
                let spec: ConnectionSpec = decode(channel, payload)?;
                let connection_id = self.registry.connect(spec).await?;
                Ok(json!({ "connection_id": connection_id }))
            }
            Channel::Disconnect => {
                let target: ConnectionRef = decode(channel, payload)?;
                self.registry.disconnect(&target.connection_id).await?;
                Ok(Value::Null)
            }
            Channel::Status => {
                let target: ConnectionRef = decode(channel, payload)?;
                Ok(serde_json::to_value(
                    self.registry.status(&target.connection_id)?,
                )?)
            }
            Channel::ShellOpen => {
                let open: ShellOpenPayload = decode(channel, payload)?;
                let session_id = self
                    .shells
                    .open(&open.connection_id, open.cols, open.rows)
                    .await?;
                Ok(json!({ "session_id": session_id }))
            }
            Channel::ShellWrite => {
                let write: ShellWritePayload = decode(channel, payload)?;
                self.shells
                    .write(&write.session_id, &write.data.into_bytes())?;
                Ok(Value::Null)
            }
            Channel::ShellResize => {
                let resize: ShellResizePayload = decode(channel, payload)?;
                self.shells
                    .resize(&resize.session_id, resize.cols, resize.rows)?;
                Ok(Value::Null)
            }
            Channel::ShellClose => {
                let target: SessionRef = decode(channel, payload)?;
                self.shells.close(&target.session_id)?;
                Ok(Value::Null)
            }
            Channel::SftpList => {
                let list: PathPayload = decode(channel, payload)?;
                self.submit(&list.connection_id, FileRequest::List { path: list.path })
            }
            Channel::SftpGet => {
                let get: GetPayload = decode(channel, payload)?;
                self.submit(
                    &get.connection_id,
                    FileRequest::Get {
                        remote_path: get.remote_path,
                        local_path: get.local_path,
                    },
                )
            }
            Channel::SftpPut => {
                let put: PutPayload = decode(channel, payload)?;
                let (connection_id, request) = put.into_request()?;
                self.submit(&connection_id, request)
            }
            Channel::SftpDelete => {
                let delete: PathPayload = decode(channel, payload)?;
                self.submit(
                    &delete.connection_id,
                    FileRequest::Delete { path: delete.path },
                )
            }
            Channel::SftpMkdir => {
                let mkdir: PathPayload = decode(channel, payload)?;
                self.submit(&mkdir.connection_id, FileRequest::Mkdir { path: mkdir.path })
            }
            Channel::SftpRmdir => {
                let rmdir: PathPayload = decode(channel, payload)?;
                self.submit(&rmdir.connection_id, FileRequest::Rmdir { path: rmdir.path })
            }
            Channel::SftpRename => {
                let rename: RenamePayload = decode(channel, payload)?;
                self.submit(
                    &rename.connection_id,
                    FileRequest::Rename {
                        from: rename.from,
                        to: rename.to,
                    },
                )
            }
            Channel::SftpCancel => {
                let target: OperationRef = decode(channel, payload)?;
                let cancelled = self.files.cancel(&target.operation_id)?;
                Ok(json!({ "cancelled": cancelled }))
            }
        }
    }

    fn submit(&self, connection_id: &str, request: FileRequest) -> AppResult<Value> {
        let operation_id = self.files.submit(connection_id, request)?;
        Ok(json!({ "operation_id": operation_id }))
    }
}

fn decode<T: DeserializeOwned>(channel: Channel, payload: Value) -> AppResult<T> {
    serde_json::from_value(payload).map_err(|e| {
        AppError::Config(sanitize(&format!("Invalid payload for {}: {}", channel, e)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionStatus;
    use crate::sftp::{OperationOutcome, OperationResult, OperationStatus, RETAINED_FINISHED};
    use crate::shell::RETAINED_CLOSED;
    use crate::transport::MemoryTransport;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const WAIT: Duration = Duration::from_secs(10);

    fn settings() -> SessionSettings {
        SessionSettings {
            keep_alive_interval_ms: 0,
            reconnect_attempts: 2,
            reconnect_delay_ms: 10,
            max_reconnect_delay_ms: 50,
            handshake_timeout_ms: 1_000,
            probe_timeout_ms: 200,
            shutdown_timeout_ms: 2_000,
        }
    }

    fn transport() -> MemoryTransport {
        MemoryTransport::new().with_account("ops", "s3cret")
    }

    fn bus(transport: &MemoryTransport, settings: SessionSettings) -> Bus {
        Bus::new(Arc::new(transport.clone()), settings)
    }

    fn spec(connection_id: &str, password: &str) -> Value {
        json!({
            "connection_id": connection_id,
            "host": "memory",
            "username": "ops",
            "password": password,
        })
    }

    async fn connect(bus: &Bus, connection_id: &str) {
        bus.request("connect", spec(connection_id, "s3cret"))
            .await
            .unwrap();
    }

    async fn open_shell(bus: &Bus, connection_id: &str) -> String {
        let opened = bus
            .request(
                "shell.open",
                json!({"connection_id": connection_id, "cols": 80, "rows": 24}),
            )
            .await
            .unwrap();
        opened["session_id"].as_str().unwrap().to_string()
    }

    async fn submit(bus: &Bus, channel: &str, payload: Value) -> String {
        let submitted = bus.request(channel, payload).await.unwrap();
        submitted["operation_id"].as_str().unwrap().to_string()
    }

    async fn next(subscription: &mut Subscription) -> BusEvent {
        timeout(WAIT, subscription.recv())
            .await
            .expect("timed out waiting for event")
            .expect("hub dropped")
    }

    async fn next_status(subscription: &mut Subscription) -> ConnectionStatus {
        match next(subscription).await {
            BusEvent::ConnectionStatus { status, .. } => status,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    async fn next_done(subscription: &mut Subscription) -> (String, OperationOutcome) {
        match next(subscription).await {
            BusEvent::SftpDone {
                operation_id,
                outcome,
                ..
            } => (operation_id, outcome),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    fn names(outcome: &OperationOutcome) -> Vec<String> {
        match outcome {
            OperationOutcome::Done {
                result: OperationResult::Entries { entries },
            } => entries.iter().map(|entry| entry.filename.clone()).collect(),
            other => panic!("expected entries, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_password_never_connects() {
        let transport = transport();
        let bus = bus(&transport, settings());
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();

        let err = bus.request("connect", spec("c1", "wrong")).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(err.code(), "AUTH_ERROR");

        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Failed);
        assert!(statuses.try_recv().is_none());
        assert!(matches!(
            bus.registry().status("c1"),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(transport.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_connect_reports_snapshot_and_rejects_duplicates() {
        let transport = transport();
        let bus = bus(&transport, settings());
        let connected = bus.request("connect", spec("c1", "s3cret")).await.unwrap();
        assert_eq!(connected["connection_id"], "c1");

        let status = bus
            .request("status", json!({"connection_id": "c1"}))
            .await
            .unwrap();
        assert_eq!(status["status"], "Connected");
        assert_eq!(status["port"], 22);
        assert!(status["connected_at"].is_i64());

        let err = bus.request("connect", spec("c1", "s3cret")).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(transport.handshakes(), 1);

        let err = bus
            .request("connect", json!({"connection_id": "c2", "host": "memory"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_shell_data_is_never_cross_delivered() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let first = open_shell(&bus, "c1").await;
        let second = open_shell(&bus, "c1").await;
        assert_ne!(first, second);

        let mut all = bus
            .subscribe("shell.data", EventFilter::connection("c1"))
            .unwrap();
        let mut only_first = bus
            .subscribe("shell.data", EventFilter::session(first.clone()))
            .unwrap();

        bus.request("shell.write", json!({"session_id": first, "data": "alpha\n"}))
            .await
            .unwrap();
        bus.request(
            "shell.write",
            json!({"session_id": second, "data": b"beta\n".to_vec()}),
        )
        .await
        .unwrap();

        let (mut first_out, mut second_out) = (Vec::new(), Vec::new());
        while first_out.len() < 6 || second_out.len() < 5 {
            match next(&mut all).await {
                BusEvent::ShellData {
                    session_id, data, ..
                } => {
                    if session_id == first {
                        first_out.extend(data);
                    } else if session_id == second {
                        second_out.extend(data);
                    } else {
                        panic!("data for unknown session {}", session_id);
                    }
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(first_out, b"alpha\n");
        assert_eq!(second_out, b"beta\n");

        let mut filtered = Vec::new();
        while filtered.len() < 6 {
            match next(&mut only_first).await {
                BusEvent::ShellData {
                    session_id, data, ..
                } => {
                    assert_eq!(session_id, first);
                    filtered.extend(data);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(filtered, b"alpha\n");
    }

    #[tokio::test]
    async fn test_remote_exit_and_double_close() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let exiting = open_shell(&bus, "c1").await;
        let closing = open_shell(&bus, "c1").await;
        let mut exits = bus
            .subscribe("shell.exit", EventFilter::connection("c1"))
            .unwrap();

        bus.request("shell.write", json!({"session_id": exiting, "data": "exit\n"}))
            .await
            .unwrap();
        match next(&mut exits).await {
            BusEvent::ShellExit {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, exiting);
                assert_eq!(
                    reason,
                    ShellExitReason::Remote {
                        exit_status: Some(0)
                    }
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }

        for _ in 0..2 {
            bus.request("shell.close", json!({"session_id": closing}))
                .await
                .unwrap();
        }
        match next(&mut exits).await {
            BusEvent::ShellExit {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, closing);
                assert_eq!(reason, ShellExitReason::Closed);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        sleep(Duration::from_millis(50)).await;
        assert!(exits.try_recv().is_none());

        let err = bus
            .request("shell.write", json!({"session_id": closing, "data": "ls\n"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));
        // resize on a closed session is still accepted
        bus.request(
            "shell.resize",
            json!({"session_id": closing, "cols": 100, "rows": 40}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_resize_is_swallowed() {
        let transport = transport();
        transport.reject_resize(true);
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let session = open_shell(&bus, "c1").await;
        let mut data = bus
            .subscribe("shell.data", EventFilter::session(session.clone()))
            .unwrap();

        bus.request(
            "shell.resize",
            json!({"session_id": session, "cols": 132, "rows": 50}),
        )
        .await
        .unwrap();
        bus.request("shell.write", json!({"session_id": session, "data": "ok\n"}))
            .await
            .unwrap();

        let mut echoed = Vec::new();
        while echoed.len() < 3 {
            if let BusEvent::ShellData { data, .. } = next(&mut data).await {
                echoed.extend(data);
            }
        }
        assert_eq!(echoed, b"ok\n");
        assert!(bus.shells.is_open(&session).unwrap());
    }

    #[tokio::test]
    async fn test_disconnect_mid_queue() {
        let transport = transport();
        transport.set_latency(Duration::from_millis(150));
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let shell = open_shell(&bus, "c1").await;
        let mut done = bus
            .subscribe("sftp.done", EventFilter::connection("c1"))
            .unwrap();
        let mut exits = bus
            .subscribe("shell.exit", EventFilter::default())
            .unwrap();
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::default())
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(submit(&bus, "sftp.list", json!({"connection_id": "c1", "path": "/"})).await);
        }

        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[0]);
        assert_eq!(names(&outcome), vec!["home"]);

        bus.request("disconnect", json!({"connection_id": "c1"}))
            .await
            .unwrap();

        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[1]);
        assert!(matches!(
            outcome,
            OperationOutcome::Cancelled | OperationOutcome::Failed { .. }
        ));
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[2]);
        assert_eq!(outcome, OperationOutcome::Cancelled);
        sleep(Duration::from_millis(200)).await;
        assert!(done.try_recv().is_none());

        match next(&mut exits).await {
            BusEvent::ShellExit {
                session_id, reason, ..
            } => {
                assert_eq!(session_id, shell);
                assert_eq!(reason, ShellExitReason::Disconnected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(exits.try_recv().is_none());
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Disconnected);

        let err = bus
            .request("status", json!({"connection_id": "c1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = bus
            .request("disconnect", json!({"connection_id": "c1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_fifo_with_cancel() {
        let transport = transport();
        transport.set_latency(Duration::from_millis(100));
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let mut done = bus
            .subscribe("sftp.done", EventFilter::connection("c1"))
            .unwrap();

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            ids.push(
                submit(
                    &bus,
                    "sftp.mkdir",
                    json!({"connection_id": "c1", "path": name}),
                )
                .await,
            );
        }
        let cancelled = bus
            .request("sftp.cancel", json!({"operation_id": ids[1]}))
            .await
            .unwrap();
        assert_eq!(cancelled["cancelled"], true);

        let mut order = Vec::new();
        while order.len() < 3 {
            let (id, outcome) = next_done(&mut done).await;
            if id == ids[1] {
                assert_eq!(outcome, OperationOutcome::Cancelled);
            } else {
                assert!(matches!(outcome, OperationOutcome::Done { .. }));
            }
            order.push(id);
        }
        let position = |id: &String| order.iter().position(|seen| seen == id).unwrap();
        assert!(position(&ids[0]) < position(&ids[2]));

        let again = bus
            .request("sftp.cancel", json!({"operation_id": ids[0]}))
            .await
            .unwrap();
        assert_eq!(again["cancelled"], false);

        let listing = submit(&bus, "sftp.list", json!({"connection_id": "c1", "path": "."})).await;
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, listing);
        assert_eq!(names(&outcome), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_failed_operation_does_not_stop_queue() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let mut done = bus
            .subscribe("sftp.done", EventFilter::connection("c1"))
            .unwrap();

        let failing = submit(
            &bus,
            "sftp.rmdir",
            json!({"connection_id": "c1", "path": "/nope"}),
        )
        .await;
        let following = submit(
            &bus,
            "sftp.mkdir",
            json!({"connection_id": "c1", "path": "/home/ops/next"}),
        )
        .await;

        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, failing);
        assert!(matches!(outcome, OperationOutcome::Failed { .. }));
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, following);
        assert!(matches!(outcome, OperationOutcome::Done { .. }));

        let status = bus
            .request("status", json!({"connection_id": "c1"}))
            .await
            .unwrap();
        assert_eq!(status["status"], "Connected");

        let err = bus
            .request("sftp.list", json!({"connection_id": "c1", "path": ""}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let mut progress = bus
            .subscribe("sftp.progress", EventFilter::connection("c1"))
            .unwrap();
        let mut done = bus
            .subscribe("sftp.done", EventFilter::connection("c1"))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("upload.bin");
        let download = dir.path().join("download.bin");
        let contents: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&upload, &contents).unwrap();

        let put = submit(
            &bus,
            "sftp.put",
            json!({
                "connection_id": "c1",
                "remote_path": "/home/ops/data.bin",
                "local_path": &upload,
            }),
        )
        .await;
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, put);
        assert_eq!(
            outcome,
            OperationOutcome::Done {
                result: OperationResult::Written {
                    bytes: contents.len() as u64
                }
            }
        );
        assert_eq!(transport.file_contents("/home/ops/data.bin").unwrap(), contents);

        let get = submit(
            &bus,
            "sftp.get",
            json!({
                "connection_id": "c1",
                "remote_path": "data.bin",
                "local_path": &download,
            }),
        )
        .await;
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, get);
        assert!(matches!(
            outcome,
            OperationOutcome::Done {
                result: OperationResult::Saved { .. }
            }
        ));
        assert_eq!(std::fs::read(&download).unwrap(), contents);

        let mut complete = std::collections::HashMap::new();
        while let Some(event) = progress.try_recv() {
            if let BusEvent::SftpProgress {
                operation_id,
                transferred,
                total,
                ..
            } = event
            {
                assert!(transferred <= total);
                if transferred == total {
                    *complete.entry(operation_id).or_insert(0) += 1;
                }
            }
        }
        assert_eq!(complete.get(&put), Some(&1));
        assert_eq!(complete.get(&get), Some(&1));
    }

    #[tokio::test]
    async fn test_keepalive_detects_loss_and_reconnects() {
        let transport = transport();
        let bus = bus(
            &transport,
            SessionSettings {
                keep_alive_interval_ms: 50,
                reconnect_attempts: 10,
                reconnect_delay_ms: 20,
                max_reconnect_delay_ms: 100,
                ..settings()
            },
        );
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();
        connect(&bus, "c1").await;
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connected);

        transport.cut_link();
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Reconnecting);
        transport.restore_link();
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connected);
        assert_eq!(transport.handshakes(), 2);

        let snapshot = bus.registry().status("c1").unwrap();
        assert_eq!(snapshot.status, ConnectionStatus::Connected);
        assert_eq!(snapshot.reconnect_attempt, 0);
        // sessions are not resumed, new ones can be opened
        assert_eq!(snapshot.shells, 0);
        open_shell(&bus, "c1").await;
    }

    #[tokio::test]
    async fn test_exhausted_reconnect_fails_connection() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let shell = open_shell(&bus, "c1").await;
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();
        let mut exits = bus
            .subscribe("shell.exit", EventFilter::session(shell.clone()))
            .unwrap();

        transport.cut_link();

        match next(&mut exits).await {
            BusEvent::ShellExit { reason, .. } => {
                assert!(matches!(reason, ShellExitReason::ConnectionLost { .. }))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Reconnecting);
        match next(&mut statuses).await {
            BusEvent::ConnectionStatus { status, reason, .. } => {
                assert_eq!(status, ConnectionStatus::Failed);
                assert!(reason.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        sleep(Duration::from_millis(50)).await;
        assert!(exits.try_recv().is_none());
        let err = bus
            .request("shell.open", json!({"connection_id": "c1", "cols": 80, "rows": 24}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = bus
            .request("shell.write", json!({"session_id": shell, "data": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Closed(_)));
    }

    #[tokio::test]
    async fn test_unlisted_channel_has_no_side_effects() {
        let transport = transport();
        let bus = bus(&transport, settings());
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::default())
            .unwrap();

        for channel in ["exec", "Connect", "shell.exec", "sftp.chmod", "connect/"] {
            let err = bus
                .request(channel, spec("c1", "s3cret"))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::ChannelNotAllowed(_)));
            assert_eq!(err.code(), "CHANNEL_NOT_ALLOWED");
        }

        assert!(statuses.try_recv().is_none());
        assert!(bus.registry().list().is_empty());
        assert_eq!(transport.handshakes(), 0);
        assert!(matches!(
            bus.subscribe("shell.stdin", EventFilter::default()),
            Err(AppError::ChannelNotAllowed(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let transport = transport();
        let bus = bus(&transport, settings());

        let requests = [
            ("disconnect", json!({"connection_id": "ghost"})),
            ("status", json!({"connection_id": "ghost"})),
            ("shell.open", json!({"connection_id": "ghost", "cols": 80, "rows": 24})),
            ("shell.write", json!({"session_id": "ghost", "data": "x"})),
            ("shell.resize", json!({"session_id": "ghost", "cols": 80, "rows": 24})),
            ("shell.close", json!({"session_id": "ghost"})),
            ("sftp.list", json!({"connection_id": "ghost", "path": "/"})),
            ("sftp.cancel", json!({"operation_id": "ghost"})),
        ];
        for (channel, payload) in requests {
            let err = bus.request(channel, payload).await.unwrap_err();
            assert!(
                matches!(err, AppError::NotFound(_)),
                "{} returned {:?}",
                channel,
                err
            );
        }

        let err = bus
            .request("shell.open", json!({"connection_id": 7}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let transport = transport();
        let bus = bus(&transport, settings());
        bus.in_flight.insert("r1".to_string(), ());

        let envelope = RequestEnvelope {
            id: "r1".to_string(),
            channel: "status".to_string(),
            payload: json!({"connection_id": "c1"}),
        };
        let err = bus.dispatch(envelope.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        bus.in_flight.remove("r1");
        for _ in 0..2 {
            let err = bus.dispatch(envelope.clone()).await.unwrap_err();
            assert!(matches!(err, AppError::NotFound(_)));
        }
        assert!(bus.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_tunnel_forwards_local_socket() {
        let transport = transport();
        let bus = bus(&transport, settings());
        let mut spec = spec("c1", "s3cret");
        spec["tunnels"] = json!([
            {"source_port": 0, "destination_host": "db.internal", "destination_port": 5432}
        ]);
        bus.request("connect", spec).await.unwrap();

        let snapshot = bus.registry().status("c1").unwrap();
        let port = snapshot.tunnels[0].bound_port.expect("tunnel not bound");

        let echoed = tokio::task::spawn_blocking(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        })
        .await
        .unwrap();
        assert_eq!(&echoed, b"ping");

        bus.request("disconnect", json!({"connection_id": "c1"}))
            .await
            .unwrap();
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
    }

    #[tokio::test]
    async fn test_link_loss_mid_queue_fails_running_and_cancels_queued() {
        let transport = transport();
        transport.set_latency(Duration::from_millis(150));
        let bus = bus(
            &transport,
            SessionSettings {
                reconnect_attempts: 10,
                reconnect_delay_ms: 20,
                max_reconnect_delay_ms: 100,
                ..settings()
            },
        );
        connect(&bus, "c1").await;
        let mut done = bus
            .subscribe("sftp.done", EventFilter::connection("c1"))
            .unwrap();
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(submit(&bus, "sftp.list", json!({"connection_id": "c1", "path": "/"})).await);
        }

        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[0]);
        assert_eq!(names(&outcome), vec!["home"]);

        transport.cut_link();

        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[1]);
        match outcome {
            OperationOutcome::Failed { reason } => assert!(!reason.is_empty()),
            other => panic!("expected failure, got {:?}", other),
        }
        let (id, outcome) = next_done(&mut done).await;
        assert_eq!(id, ids[2]);
        assert_eq!(outcome, OperationOutcome::Cancelled);
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Reconnecting);

        sleep(Duration::from_millis(200)).await;
        assert!(done.try_recv().is_none());
        for id in &ids[1..] {
            let again = bus
                .request("sftp.cancel", json!({"operation_id": id}))
                .await
                .unwrap();
            assert_eq!(again["cancelled"], false);
        }

        transport.restore_link();
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_initial_connect_retries_refused_handshakes() {
        let transport = transport();
        transport.fail_next_connects(2);
        let bus = bus(&transport, settings());
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();

        connect(&bus, "c1").await;
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connected);
        sleep(Duration::from_millis(50)).await;
        assert!(statuses.try_recv().is_none());
        assert_eq!(transport.handshakes(), 1);
        assert_eq!(bus.registry().status("c1").unwrap().reconnect_attempt, 0);
    }

    #[tokio::test]
    async fn test_initial_connect_gives_up_after_budget() {
        let transport = transport();
        transport.fail_next_connects(3);
        let bus = bus(&transport, settings());
        let mut statuses = bus
            .subscribe("connection.status", EventFilter::connection("c1"))
            .unwrap();

        let err = bus.request("connect", spec("c1", "s3cret")).await.unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
        assert_eq!(err.code(), "NETWORK_ERROR");

        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut statuses).await, ConnectionStatus::Failed);
        assert!(statuses.try_recv().is_none());
        assert!(matches!(
            bus.registry().status("c1"),
            Err(AppError::NotFound(_))
        ));
        assert_eq!(transport.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_finished_operations_are_not_kept_forever() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;
        let mut done = bus
            .subscribe("sftp.done", EventFilter::default())
            .unwrap();

        let total = RETAINED_FINISHED + 44;
        let mut ids = Vec::new();
        for _ in 0..total {
            ids.push(submit(&bus, "sftp.list", json!({"connection_id": "c1", "path": "/"})).await);
        }
        for _ in 0..total {
            next_done(&mut done).await;
        }

        let latest = submit(&bus, "sftp.list", json!({"connection_id": "c1", "path": "/"})).await;
        assert_eq!(bus.files.tracked(), RETAINED_FINISHED + 1);
        let err = bus
            .request("sftp.cancel", json!({"operation_id": ids[0]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(
            bus.files.status(&ids[total - 1]).unwrap(),
            OperationStatus::Done
        );
        let (id, _) = next_done(&mut done).await;
        assert_eq!(id, latest);

        bus.request("disconnect", json!({"connection_id": "c1"}))
            .await
            .unwrap();
        connect(&bus, "c2").await;
        submit(&bus, "sftp.list", json!({"connection_id": "c2", "path": "/"})).await;
        assert_eq!(bus.files.tracked(), 1);
    }

    #[tokio::test]
    async fn test_closed_shells_are_not_kept_forever() {
        let transport = transport();
        let bus = bus(&transport, settings());
        connect(&bus, "c1").await;

        let mut closed = Vec::new();
        for _ in 0..RETAINED_CLOSED + 6 {
            let session = open_shell(&bus, "c1").await;
            bus.request("shell.close", json!({"session_id": session}))
                .await
                .unwrap();
            closed.push(session);
        }
        let live = open_shell(&bus, "c1").await;
        assert_eq!(bus.shells.tracked(), RETAINED_CLOSED + 1);

        let err = bus
            .request("shell.close", json!({"session_id": closed[0]}))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        // a recent one still closes quietly
        bus.request("shell.close", json!({"session_id": closed[closed.len() - 1]}))
            .await
            .unwrap();
        assert!(bus.shells.is_open(&live).unwrap());

        bus.request("disconnect", json!({"connection_id": "c1"}))
            .await
            .unwrap();
        connect(&bus, "c2").await;
        open_shell(&bus, "c2").await;
        assert_eq!(bus.shells.tracked(), 1);
    }

    #[tokio::test]
    async fn test_tunnel_reply_survives_local_half_close() {
        let transport = transport();
        let bus = bus(&transport, settings());
        let mut spec = spec("c1", "s3cret");
        spec["tunnels"] = json!([
            {"source_port": 0, "destination_host": "cache.internal", "destination_port": 6379}
        ]);
        bus.request("connect", spec).await.unwrap();
        let port = bus.registry().status("c1").unwrap().tunnels[0]
            .bound_port
            .expect("tunnel not bound");

        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.write_all(b"ping").unwrap();
            stream.shutdown(Shutdown::Write).unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).unwrap();
            reply
        })
        .await
        .unwrap();
        assert_eq!(reply, "ping");
    }
}
