//! Transport adapter seam.
//!
//! A [`Transport`] performs the handshake and authentication for one remote
//! endpoint and hands back a [`RemoteSession`]. Every call on a session is
//! blocking and is made from the owning connection's worker thread only, so
//! implementations never see interleaved requests.

pub mod memory;
pub mod splice;
pub mod ssh;

pub use memory::MemoryTransport;
pub use splice::Splice;
pub use ssh::SshTransport;

use crate::error::{AppError, AppResult};
use crate::sftp::DirectoryEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Duration;

/// Credential presented to the remote. Supplied fresh on every connect.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password([REDACTED])"),
            Credential::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"[REDACTED]")
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

/// Local port forward: `127.0.0.1:source_port` -> `destination_host:destination_port`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub source_port: u16,
    pub destination_host: String,
    pub destination_port: u16,
}

/// Intermediate hop, parsed from `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHost {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
}

impl FromStr for JumpHost {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::Config(format!("Invalid jump host: {}", s));
        let (username, rest) = match s.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (rest, 22),
        };
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(JumpHost {
            host: host.to_string(),
            port,
            username,
        })
    }
}

/// Everything a transport needs to reach and authenticate one remote
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub jump_host: Option<JumpHost>,
}

/// Known hosts policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnownHostsPolicy {
    /// Reject hosts that are not already in known_hosts
    Strict,
    /// Record unknown hosts on first use, reject changed keys
    #[default]
    AcceptNew,
    /// Skip verification entirely
    Accept,
}

/// Result of a non-blocking channel read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Idle,
    Eof { exit_status: Option<i32> },
}

pub trait Transport: Send + Sync {
    /// Open and authenticate a session; gives up after `timeout`.
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> AppResult<Box<dyn RemoteSession>>;
}

pub trait RemoteSession: Send {
    fn open_shell(&mut self, cols: u32, rows: u32) -> AppResult<Box<dyn ByteChannel>>;

    /// `direct-tcpip` style channel used by port forwards.
    fn open_tunnel(&mut self, host: &str, port: u16) -> AppResult<Box<dyn ByteChannel>>;

    /// Round trip that proves the peer is still there.
    fn probe(&mut self, timeout: Duration) -> AppResult<()>;

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<DirectoryEntry>>;

    /// Reader over a remote file plus its size as reported by the remote.
    fn open_reader(&mut self, path: &str) -> AppResult<(Box<dyn Read + Send>, u64)>;

    /// Writer that creates or truncates a remote file.
    fn open_writer(&mut self, path: &str) -> AppResult<Box<dyn Write + Send>>;

    fn remove_file(&mut self, path: &str) -> AppResult<()>;

    fn make_dir(&mut self, path: &str) -> AppResult<()>;

    fn remove_dir(&mut self, path: &str) -> AppResult<()>;

    fn rename(&mut self, from: &str, to: &str) -> AppResult<()>;

    fn close(&mut self);
}

/// Bidirectional byte channel. Reads and writes never block: a write that
/// cannot make progress returns `Ok(0)`.
pub trait ByteChannel: Send {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<ReadOutcome>;

    fn write(&mut self, data: &[u8]) -> AppResult<usize>;

    /// Half-close: no more writes, reads keep working.
    fn send_eof(&mut self) -> AppResult<()>;

    fn resize(&mut self, cols: u32, rows: u32) -> AppResult<()>;

    fn close(&mut self);
}
