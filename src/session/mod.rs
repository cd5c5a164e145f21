//! Session registry: the single source of truth for which connections exist
//! and what state they are in.

pub mod connection;
pub mod tunnel;
pub mod worker;

pub use connection::{
    ConnectionHandle, ConnectionSnapshot, ConnectionStatus, Teardown, TunnelBinding, WorkerCommand,
};

use crate::bus::EventHub;
use crate::config::{ConnectionOptions, SessionSettings};
use crate::error::{AppError, AppResult};
use crate::transport::{Credential, Endpoint, JumpHost, Transport, TunnelSpec};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use worker::WorkerContext;

/// Connect request as supplied by the caller
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub connection_id: String,
    pub host: String,
    /// Falls back to the configured default port
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub jump_host: Option<String>,
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    #[serde(default)]
    pub options: Option<ConnectionOptions>,
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = |secret: &Option<String>| secret.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("ConnectionSpec")
            .field("connection_id", &self.connection_id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("private_key", &redacted(&self.private_key))
            .field("passphrase", &redacted(&self.passphrase))
            .field("jump_host", &self.jump_host)
            .field("tunnels", &self.tunnels)
            .field("options", &self.options)
            .finish()
    }
}

impl ConnectionSpec {
    pub fn new(connection_id: &str, host: &str, username: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            host: host.to_string(),
            port: None,
            username: username.to_string(),
            password: None,
            private_key: None,
            passphrase: None,
            jump_host: None,
            tunnels: Vec::new(),
            options: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_private_key(mut self, key: &str, passphrase: Option<&str>) -> Self {
        self.private_key = Some(key.to_string());
        self.passphrase = passphrase.map(str::to_string);
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_tunnel(mut self, tunnel: TunnelSpec) -> Self {
        self.tunnels.push(tunnel);
        self
    }

    /// Check the request and turn it into a transport endpoint.
    pub fn endpoint(&self, default_port: u16) -> AppResult<Endpoint> {
        let required = |value: &str, name: &str| {
            if value.trim().is_empty() {
                Err(AppError::Config(format!("{} is required", name)))
            } else {
                Ok(())
            }
        };
        required(&self.connection_id, "connection_id")?;
        required(&self.host, "host")?;
        required(&self.username, "username")?;
        let port = self.port.unwrap_or(default_port);
        if port == 0 {
            return Err(AppError::Config("port must not be 0".to_string()));
        }

        let credential = match (&self.password, &self.private_key) {
            (Some(password), None) => {
                if self.passphrase.is_some() {
                    return Err(AppError::Config(
                        "passphrase is only valid with a private key".to_string(),
                    ));
                }
                Credential::Password(password.clone())
            }
            (None, Some(key)) => Credential::PrivateKey {
                key: key.clone(),
                passphrase: self.passphrase.clone(),
            },
            _ => {
                return Err(AppError::Config(
                    "exactly one of password or private_key is required".to_string(),
                ))
            }
        };

        for tunnel in &self.tunnels {
            if tunnel.destination_host.trim().is_empty() || tunnel.destination_port == 0 {
                return Err(AppError::Config(format!(
                    "Invalid tunnel destination {}:{}",
                    tunnel.destination_host, tunnel.destination_port
                )));
            }
        }

        let jump_host = self
            .jump_host
            .as_deref()
            .filter(|jump| !jump.trim().is_empty())
            .map(str::parse::<JumpHost>)
            .transpose()?;

        Ok(Endpoint {
            host: self.host.clone(),
            port,
            username: self.username.clone(),
            credential,
            jump_host,
        })
    }
}

/// Owns every live connection record
pub struct SessionRegistry {
    connections: Arc<DashMap<String, Arc<ConnectionHandle>>>,
    transport: Arc<dyn Transport>,
    settings: RwLock<SessionSettings>,
    default_port: u16,
    hub: Arc<EventHub>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, settings: SessionSettings, hub: Arc<EventHub>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            transport,
            settings: RwLock::new(settings),
            default_port: 22,
            hub,
        }
    }

    /// Port used when a connect request does not name one.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn hub(&self) -> Arc<EventHub> {
        Arc::clone(&self.hub)
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings.read().clone()
    }

    /// Applies to connections opened afterwards.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self.settings.write() = settings;
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Open a connection and wait until it is up or has failed.
    pub async fn connect(&self, spec: ConnectionSpec) -> AppResult<String> {
        let endpoint = spec.endpoint(self.default_port)?;
        let settings = match &spec.options {
            Some(options) => self.settings().with_overrides(options),
            None => self.settings(),
        };
        let bindings = spec
            .tunnels
            .iter()
            .map(|tunnel| TunnelBinding {
                source_port: tunnel.source_port,
                destination_host: tunnel.destination_host.clone(),
                destination_port: tunnel.destination_port,
                bound_port: None,
            })
            .collect();

        let (handle, commands) = ConnectionHandle::new(
            spec.connection_id.clone(),
            endpoint.host.clone(),
            endpoint.port,
            endpoint.username.clone(),
            bindings,
            self.hub(),
        );
        match self.connections.entry(spec.connection_id.clone()) {
            Entry::Occupied(_) => {
                return Err(AppError::Config(format!(
                    "Connection {} already exists",
                    spec.connection_id
                )))
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&handle));
            }
        }
        handle.emit_current_status();
        tracing::info!(
            "Connecting to {}@{}:{} (connection {})",
            endpoint.username,
            endpoint.host,
            endpoint.port,
            spec.connection_id
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let spawned = worker::spawn(
            WorkerContext {
                handle: Arc::clone(&handle),
                commands,
                transport: Arc::clone(&self.transport),
                endpoint,
                tunnels: spec.tunnels.clone(),
                settings,
                connections: Arc::clone(&self.connections),
            },
            ready_tx,
        );
        if let Err(e) = spawned {
            handle.set_status(ConnectionStatus::Failed, Some(&e.to_string()));
            self.remove(&handle);
            return Err(e);
        }

        match ready_rx.await {
            Ok(Ok(())) => Ok(spec.connection_id),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.remove(&handle);
                Err(AppError::Closed(format!(
                    "Worker for connection {} exited",
                    spec.connection_id
                )))
            }
        }
    }

    /// Close everything on the connection and forget it.
    pub async fn disconnect(&self, connection_id: &str) -> AppResult<()> {
        let handle = self
            .get(connection_id)
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;
        if !handle.claim_closing() {
            return Err(AppError::NotFound(format!("Connection {}", connection_id)));
        }
        tracing::info!("Disconnecting connection {}", connection_id);

        handle.teardown(&Teardown::Disconnected);
        let (ack, stopped) = oneshot::channel();
        if handle.send(WorkerCommand::Shutdown { ack }).is_ok() {
            let timeout = self.settings().shutdown_timeout();
            if tokio::time::timeout(timeout, stopped).await.is_err() {
                tracing::warn!(
                    "Worker for connection {} did not stop within {:?}",
                    connection_id,
                    timeout
                );
            }
        }

        self.remove(&handle);
        handle.set_status(ConnectionStatus::Disconnected, None);
        Ok(())
    }

    pub fn status(&self, connection_id: &str) -> AppResult<ConnectionSnapshot> {
        self.get(connection_id)
            .map(|handle| handle.snapshot())
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))
    }

    fn remove(&self, handle: &Arc<ConnectionHandle>) {
        self.connections
            .remove_if(&handle.id, |_, existing| Arc::ptr_eq(existing, handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_requires_single_credential() {
        let base = ConnectionSpec::new("c1", "example.com", "ops");
        assert!(matches!(base.endpoint(22), Err(AppError::Config(_))));

        let both = base
            .clone()
            .with_password("pw")
            .with_private_key("key", None);
        assert!(matches!(both.endpoint(22), Err(AppError::Config(_))));

        let mut stray_passphrase = base.clone().with_password("pw");
        stray_passphrase.passphrase = Some("x".to_string());
        assert!(stray_passphrase.endpoint(22).is_err());

        let endpoint = base.with_private_key("key", Some("pp")).endpoint(22).unwrap();
        assert!(matches!(
            endpoint.credential,
            Credential::PrivateKey {
                passphrase: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_spec_required_fields() {
        assert!(ConnectionSpec::new("", "h", "u").with_password("p").endpoint(22).is_err());
        assert!(ConnectionSpec::new("c", " ", "u").with_password("p").endpoint(22).is_err());
        assert!(ConnectionSpec::new("c", "h", "").with_password("p").endpoint(22).is_err());

        let zero_port = ConnectionSpec::new("c", "h", "u").with_password("p");
        assert!(zero_port.endpoint(0).is_err());
        assert!(zero_port.clone().with_port(0).endpoint(22).is_err());
        assert_eq!(zero_port.with_port(2200).endpoint(0).unwrap().port, 2200);

        let bad_tunnel = ConnectionSpec::new("c", "h", "u")
            .with_password("p")
            .with_tunnel(TunnelSpec {
                source_port: 8080,
                destination_host: String::new(),
                destination_port: 80,
            });
        assert!(bad_tunnel.endpoint(22).is_err());
    }

    #[test]
    fn test_spec_from_json_defaults() {
        let spec: ConnectionSpec = serde_json::from_value(serde_json::json!({
            "connection_id": "c1",
            "host": "example.com",
            "username": "ops",
            "password": "pw",
            "jump_host": "admin@bastion:2222",
            "options": { "reconnectAttempts": 1 }
        }))
        .unwrap();
        assert_eq!(spec.port, None);
        let endpoint = spec.endpoint(2222).unwrap();
        assert_eq!(endpoint.port, 2222);
        let jump = endpoint.jump_host.unwrap();
        assert_eq!(jump.host, "bastion");
        assert_eq!(jump.port, 2222);
        assert_eq!(spec.options.unwrap().reconnect_attempts, Some(1));
    }

    #[test]
    fn test_spec_debug_hides_secrets() {
        let spec = ConnectionSpec::new("c1", "h", "u").with_password("hunter2");
        assert!(!format!("{:?}", spec).contains("hunter2"));
    }
}
