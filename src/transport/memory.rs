//! In-process remote used by tests and offline runs.
//!
//! Shells and tunnels echo what is written to them; a shell whose input line
//! is `exit` closes with status 0. File operations work on a tree shared by
//! every session of the same [`MemoryTransport`]. The link can be cut to
//! simulate a dead peer: sessions opened before the cut never recover.

use super::{ByteChannel, Credential, Endpoint, ReadOutcome, RemoteSession, Transport};
use crate::error::{AppError, AppResult};
use crate::sftp::{sort_entries, DirectoryEntry, FileAttributes};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: u64 },
    File { contents: Vec<u8>, modified: u64 },
}

struct MemoryRemote {
    accounts: Mutex<HashMap<String, String>>,
    tree: Mutex<BTreeMap<String, Node>>,
    link_up: AtomicBool,
    generation: AtomicU64,
    failing_connects: AtomicU32,
    handshakes: AtomicU32,
    latency_ms: AtomicU64,
    reject_resize: AtomicBool,
}

impl MemoryRemote {
    fn check_alive(&self, generation: u64) -> AppResult<()> {
        if !self.link_up.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
            return Err(AppError::Network("Connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn delay(&self) {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }
}

/// Transport backed by an in-memory remote
#[derive(Clone)]
pub struct MemoryTransport {
    remote: Arc<MemoryRemote>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir { modified: now() });
        tree.insert("/home".to_string(), Node::Dir { modified: now() });
        Self {
            remote: Arc::new(MemoryRemote {
                accounts: Mutex::new(HashMap::new()),
                tree: Mutex::new(tree),
                link_up: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                failing_connects: AtomicU32::new(0),
                handshakes: AtomicU32::new(0),
                latency_ms: AtomicU64::new(0),
                reject_resize: AtomicBool::new(false),
            }),
        }
    }

    /// Register an account. `secret` is matched against either the password
    /// or the private key text. Creates `/home/<username>`.
    pub fn with_account(self, username: &str, secret: &str) -> Self {
        self.remote
            .accounts
            .lock()
            .insert(username.to_string(), secret.to_string());
        self.remote
            .tree
            .lock()
            .insert(format!("/home/{}", username), Node::Dir { modified: now() });
        self
    }

    /// Drop the link: live sessions fail and new connects are refused.
    pub fn cut_link(&self) {
        self.remote.link_up.store(false, Ordering::SeqCst);
        self.remote.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn restore_link(&self) {
        self.remote.link_up.store(true, Ordering::SeqCst);
    }

    /// Refuse the next `count` handshakes with a network error.
    pub fn fail_next_connects(&self, count: u32) {
        self.remote.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Added to every file operation and probe.
    pub fn set_latency(&self, latency: Duration) {
        self.remote
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn reject_resize(&self, reject: bool) {
        self.remote.reject_resize.store(reject, Ordering::SeqCst);
    }

    /// Number of successful handshakes so far
    pub fn handshakes(&self) -> u32 {
        self.remote.handshakes.load(Ordering::SeqCst)
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.remote.tree.lock().get(path) {
            Some(Node::File { contents, .. }) => Some(contents.clone()),
            _ => None,
        }
    }

    pub fn insert_file(&self, path: &str, contents: &[u8]) {
        self.remote.tree.lock().insert(
            path.to_string(),
            Node::File {
                contents: contents.to_vec(),
                modified: now(),
            },
        );
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> AppResult<Box<dyn RemoteSession>> {
        let remote = &self.remote;
        if !remote.link_up.load(Ordering::SeqCst) {
            thread::sleep(timeout.min(Duration::from_millis(10)));
            return Err(AppError::Network(format!(
                "Connection to {}:{} timed out",
                endpoint.host, endpoint.port
            )));
        }
        let failing = remote.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            remote.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(AppError::Network(format!(
                "Connection to {}:{} refused",
                endpoint.host, endpoint.port
            )));
        }

        let accepted = match (remote.accounts.lock().get(&endpoint.username), &endpoint.credential) {
            (Some(secret), Credential::Password(password)) => secret == password,
            (Some(secret), Credential::PrivateKey { key, .. }) => secret == key,
            (None, _) => false,
        };
        if !accepted {
            return Err(AppError::Auth("Password authentication failed".to_string()));
        }

        remote.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            remote: Arc::clone(remote),
            generation: remote.generation.load(Ordering::SeqCst),
            home: format!("/home/{}", endpoint.username),
        }))
    }
}

struct MemorySession {
    remote: Arc<MemoryRemote>,
    generation: u64,
    home: String,
}

impl MemorySession {
    fn resolve(&self, path: &str) -> String {
        let joined = if path.starts_with('/') {
            path.to_string()
        } else if path == "." || path == "~" {
            self.home.clone()
        } else {
            format!("{}/{}", self.home, path.trim_start_matches("./"))
        };
        let trimmed = joined.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn ready(&self) -> AppResult<()> {
        self.remote.delay();
        self.remote.check_alive(self.generation)
    }

    fn channel(&self, exit_on_command: bool) -> Box<dyn ByteChannel> {
        Box::new(EchoChannel {
            remote: Arc::clone(&self.remote),
            generation: self.generation,
            outbox: VecDeque::new(),
            line: Vec::new(),
            exit_on_command,
            exited: false,
            eof_received: false,
            closed: false,
        })
    }
}

fn parent_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => "/".to_string(),
    }
}

fn no_such(path: &str) -> AppError {
    AppError::Ssh(format!("No such file: {}", path))
}

impl RemoteSession for MemorySession {
    fn open_shell(&mut self, _cols: u32, _rows: u32) -> AppResult<Box<dyn ByteChannel>> {
        self.remote.check_alive(self.generation)?;
        Ok(self.channel(true))
    }

    fn open_tunnel(&mut self, _host: &str, _port: u16) -> AppResult<Box<dyn ByteChannel>> {
        self.remote.check_alive(self.generation)?;
        Ok(self.channel(false))
    }

    fn probe(&mut self, timeout: Duration) -> AppResult<()> {
        if self.remote.check_alive(self.generation).is_err() {
            thread::sleep(timeout.min(Duration::from_millis(10)));
            return Err(AppError::Network("Keepalive probe timed out".to_string()));
        }
        Ok(())
    }

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<DirectoryEntry>> {
        self.ready()?;
        let dir = self.resolve(path);
        let tree = self.remote.tree.lock();
        match tree.get(&dir) {
            Some(Node::Dir { .. }) => {}
            _ => return Err(AppError::Ssh(format!("Failed to list directory: {}", dir))),
        }
        let mut entries: Vec<DirectoryEntry> = tree
            .iter()
            .filter(|(candidate, _)| candidate.as_str() != dir && parent_of(candidate) == dir)
            .map(|(candidate, node)| DirectoryEntry::new(candidate, attributes(node)))
            .collect();
        sort_entries(&mut entries);
        Ok(entries)
    }

    fn open_reader(&mut self, path: &str) -> AppResult<(Box<dyn Read + Send>, u64)> {
        self.ready()?;
        let path = self.resolve(path);
        match self.remote.tree.lock().get(&path) {
            Some(Node::File { contents, .. }) => {
                let len = contents.len() as u64;
                Ok((Box::new(Cursor::new(contents.clone())), len))
            }
            _ => Err(no_such(&path)),
        }
    }

    fn open_writer(&mut self, path: &str) -> AppResult<Box<dyn Write + Send>> {
        self.ready()?;
        let path = self.resolve(path);
        let mut tree = self.remote.tree.lock();
        match tree.get(&parent_of(&path)) {
            Some(Node::Dir { .. }) => {}
            _ => return Err(no_such(&parent_of(&path))),
        }
        if let Some(Node::Dir { .. }) = tree.get(&path) {
            return Err(AppError::Ssh(format!("Is a directory: {}", path)));
        }
        tree.insert(
            path.clone(),
            Node::File {
                contents: Vec::new(),
                modified: now(),
            },
        );
        Ok(Box::new(MemoryWriter {
            remote: Arc::clone(&self.remote),
            generation: self.generation,
            path,
            buf: Vec::new(),
        }))
    }

    fn remove_file(&mut self, path: &str) -> AppResult<()> {
        self.ready()?;
        let path = self.resolve(path);
        let mut tree = self.remote.tree.lock();
        match tree.get(&path) {
            Some(Node::File { .. }) => {
                tree.remove(&path);
                Ok(())
            }
            _ => Err(no_such(&path)),
        }
    }

    fn make_dir(&mut self, path: &str) -> AppResult<()> {
        self.ready()?;
        let path = self.resolve(path);
        let mut tree = self.remote.tree.lock();
        if tree.contains_key(&path) {
            return Err(AppError::Ssh(format!("File exists: {}", path)));
        }
        match tree.get(&parent_of(&path)) {
            Some(Node::Dir { .. }) => {
                tree.insert(path, Node::Dir { modified: now() });
                Ok(())
            }
            _ => Err(no_such(&parent_of(&path))),
        }
    }

    fn remove_dir(&mut self, path: &str) -> AppResult<()> {
        self.ready()?;
        let path = self.resolve(path);
        let mut tree = self.remote.tree.lock();
        match tree.get(&path) {
            Some(Node::Dir { .. }) => {}
            _ => return Err(no_such(&path)),
        }
        if tree.keys().any(|candidate| candidate != &path && parent_of(candidate) == path) {
            return Err(AppError::Ssh(format!("Directory not empty: {}", path)));
        }
        tree.remove(&path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        self.ready()?;
        let from = self.resolve(from);
        let to = self.resolve(to);
        let mut tree = self.remote.tree.lock();
        if tree.contains_key(&to) {
            return Err(AppError::Ssh(format!("File exists: {}", to)));
        }
        let node = tree.remove(&from).ok_or_else(|| no_such(&from))?;
        let prefix = format!("{}/", from);
        let children: Vec<String> = tree
            .keys()
            .filter(|candidate| candidate.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            if let Some(moved) = tree.remove(&child) {
                tree.insert(format!("{}/{}", to, &child[prefix.len()..]), moved);
            }
        }
        tree.insert(to, node);
        Ok(())
    }

    fn close(&mut self) {}
}

fn attributes(node: &Node) -> FileAttributes {
    match node {
        Node::Dir { modified } => FileAttributes {
            size: Some(4096),
            modified: Some(*modified),
            accessed: Some(*modified),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o040755),
        },
        Node::File { contents, modified } => FileAttributes {
            size: Some(contents.len() as u64),
            modified: Some(*modified),
            accessed: Some(*modified),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100644),
        },
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

struct MemoryWriter {
    remote: Arc<MemoryRemote>,
    generation: u64,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.remote
            .check_alive(self.generation)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e.to_string()))?;
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.remote
            .check_alive(self.generation)
            .map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, e.to_string()))?;
        self.remote.tree.lock().insert(
            self.path.clone(),
            Node::File {
                contents: self.buf.clone(),
                modified: now(),
            },
        );
        Ok(())
    }
}

struct EchoChannel {
    remote: Arc<MemoryRemote>,
    generation: u64,
    outbox: VecDeque<u8>,
    line: Vec<u8>,
    exit_on_command: bool,
    exited: bool,
    eof_received: bool,
    closed: bool,
}

impl ByteChannel for EchoChannel {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<ReadOutcome> {
        self.remote.check_alive(self.generation)?;
        if !self.outbox.is_empty() {
            let n = buf.len().min(self.outbox.len());
            for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
                *slot = byte;
            }
            return Ok(ReadOutcome::Data(n));
        }
        if self.exited || self.closed || self.eof_received {
            return Ok(ReadOutcome::Eof {
                exit_status: self.exited.then_some(0),
            });
        }
        Ok(ReadOutcome::Idle)
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        self.remote.check_alive(self.generation)?;
        if self.exited || self.closed || self.eof_received {
            return Err(AppError::Closed("Channel closed".to_string()));
        }
        self.outbox.extend(data.iter().copied());
        if self.exit_on_command {
            for &byte in data {
                if byte == b'\n' || byte == b'\r' {
                    if self.line.as_slice() == b"exit" {
                        self.exited = true;
                    }
                    self.line.clear();
                } else {
                    self.line.push(byte);
                }
            }
        }
        Ok(data.len())
    }

    fn send_eof(&mut self) -> AppResult<()> {
        self.remote.check_alive(self.generation)?;
        self.eof_received = true;
        Ok(())
    }

    fn resize(&mut self, cols: u32, rows: u32) -> AppResult<()> {
        self.remote.check_alive(self.generation)?;
        if self.remote.reject_resize.load(Ordering::SeqCst) {
            return Err(AppError::Ssh(format!("PTY resize to {}x{} rejected", cols, rows)));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(password: &str) -> Endpoint {
        Endpoint {
            host: "memory".to_string(),
            port: 22,
            username: "ops".to_string(),
            credential: Credential::Password(password.to_string()),
            jump_host: None,
        }
    }

    fn connect(transport: &MemoryTransport) -> Box<dyn RemoteSession> {
        transport
            .connect(&endpoint("pw"), Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn test_wrong_password_is_auth_error() {
        let transport = MemoryTransport::new().with_account("ops", "pw");
        let err = transport
            .connect(&endpoint("nope"), Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, AppError::Auth(_)));
        assert_eq!(transport.handshakes(), 0);
    }

    #[test]
    fn test_file_tree_operations() {
        let transport = MemoryTransport::new().with_account("ops", "pw");
        let mut session = connect(&transport);

        session.make_dir("projects").unwrap();
        let mut writer = session.open_writer("projects/notes.txt").unwrap();
        writer.write_all(b"hello").unwrap();
        writer.flush().unwrap();
        assert_eq!(
            transport.file_contents("/home/ops/projects/notes.txt").unwrap(),
            b"hello"
        );

        let entries = session.list_dir(".").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_directory);

        session
            .rename("/home/ops/projects", "/home/ops/archive")
            .unwrap();
        assert!(transport.file_contents("/home/ops/archive/notes.txt").is_some());
        assert!(session.remove_dir("/home/ops/archive").is_err());
        session.remove_file("/home/ops/archive/notes.txt").unwrap();
        session.remove_dir("/home/ops/archive").unwrap();
        assert!(session.list_dir("/home/ops").unwrap().is_empty());
    }

    #[test]
    fn test_shell_echo_and_exit() {
        let transport = MemoryTransport::new().with_account("ops", "pw");
        let mut session = connect(&transport);
        let mut shell = session.open_shell(80, 24).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(shell.read(&mut buf).unwrap(), ReadOutcome::Idle);
        shell.write(b"exit\n").unwrap();
        assert_eq!(shell.read(&mut buf).unwrap(), ReadOutcome::Data(5));
        assert_eq!(&buf[..5], b"exit\n");
        assert_eq!(
            shell.read(&mut buf).unwrap(),
            ReadOutcome::Eof {
                exit_status: Some(0)
            }
        );
    }

    #[test]
    fn test_cut_link_kills_existing_sessions() {
        let transport = MemoryTransport::new().with_account("ops", "pw");
        let mut session = connect(&transport);
        transport.cut_link();
        assert!(session.probe(Duration::from_millis(5)).is_err());
        transport.restore_link();
        assert!(session.list_dir("/").unwrap_err().is_connection_fatal());
        let mut fresh = connect(&transport);
        assert!(fresh.probe(Duration::from_millis(5)).is_ok());
    }
}
