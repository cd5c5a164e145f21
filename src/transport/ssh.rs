//! ssh2 backed transport.

use super::{
    ByteChannel, Credential, Endpoint, JumpHost, KnownHostsPolicy, ReadOutcome, RemoteSession,
    Splice, Transport,
};
use crate::error::{AppError, AppResult};
use crate::sftp::{sort_entries, DirectoryEntry, FileAttributes};
use sha2::{Digest, Sha256};
use ssh2::{
    Channel, CheckResult, ErrorCode, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session,
    Sftp,
};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// libssh2 codes that mean the socket is gone
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Opens real SSH sessions, verifying host keys against a known_hosts file.
pub struct SshTransport {
    known_hosts_path: PathBuf,
    policy: KnownHostsPolicy,
}

impl SshTransport {
    pub fn new(known_hosts_path: PathBuf, policy: KnownHostsPolicy) -> Self {
        Self {
            known_hosts_path,
            policy,
        }
    }

    fn open_session(
        &self,
        stream: TcpStream,
        host: &str,
        port: u16,
        username: &str,
        credential: &Credential,
        timeout: Duration,
    ) -> AppResult<Session> {
        let mut session = Session::new()
            .map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(stream);
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| AppError::Network(format!("SSH handshake failed: {}", e)))?;

        self.verify_host_key(&session, host, port)?;
        authenticate(&session, username, credential)?;
        Ok(session)
    }

    /// Verify the host key against known_hosts
    fn verify_host_key(&self, session: &Session, host: &str, port: u16) -> AppResult<()> {
        if self.policy == KnownHostsPolicy::Accept {
            return Ok(());
        }

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| AppError::Ssh("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
        if self.known_hosts_path.exists() {
            let _ = known_hosts.read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH);
        }

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {}:{}", host, port);
                Ok(())
            }
            CheckResult::NotFound if self.policy == KnownHostsPolicy::AcceptNew => {
                tracing::info!("Recording new host key for {}:{} ({})", host, port, fingerprint);
                let entry = if port == 22 {
                    host.to_string()
                } else {
                    format!("[{}]:{}", host, port)
                };
                let comment = format!("added by remux on {}", chrono::Utc::now());
                let saved = known_hosts
                    .add(&entry, key, &comment, key_format(key_type))
                    .and_then(|_| {
                        if let Some(parent) = self.known_hosts_path.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        known_hosts.write_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                    });
                if let Err(e) = saved {
                    tracing::warn!("Failed to persist host key for {}:{}: {}", host, port, e);
                }
                Ok(())
            }
            CheckResult::NotFound => Err(AppError::Auth(format!(
                "Unknown host key for {}:{} ({})",
                host, port, fingerprint
            ))),
            CheckResult::Mismatch => {
                tracing::error!("HOST KEY MISMATCH for {}:{}! Possible MITM attack!", host, port);
                Err(AppError::Auth(format!(
                    "Host key for {}:{} has changed; connection rejected",
                    host, port
                )))
            }
            CheckResult::Failure => Err(AppError::Ssh("Failed to check known hosts".to_string())),
        }
    }
}

impl Transport for SshTransport {
    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> AppResult<Box<dyn RemoteSession>> {
        tracing::info!(
            "Connecting to {}@{}:{}",
            endpoint.username,
            endpoint.host,
            endpoint.port
        );

        let (stream, bridge) = match &endpoint.jump_host {
            Some(jump) => {
                let bridge = self.open_jump_bridge(jump, endpoint, timeout)?;
                let stream = TcpStream::connect_timeout(&bridge.local_addr, timeout)
                    .map_err(|e| AppError::Network(format!("Jump bridge connect failed: {}", e)))?;
                (stream, Some(bridge))
            }
            None => (connect_tcp(&endpoint.host, endpoint.port, timeout)?, None),
        };
        stream.set_nodelay(true)?;

        let session = self.open_session(
            stream,
            &endpoint.host,
            endpoint.port,
            &endpoint.username,
            &endpoint.credential,
            timeout,
        )?;
        tracing::info!("SSH authentication successful for {}:{}", endpoint.host, endpoint.port);

        Ok(Box::new(SshRemote {
            session,
            sftp: None,
            default_timeout: timeout,
            _bridge: bridge,
        }))
    }
}

impl SshTransport {
    fn open_jump_bridge(
        &self,
        jump: &JumpHost,
        target: &Endpoint,
        timeout: Duration,
    ) -> AppResult<JumpBridge> {
        let username = jump.username.as_deref().unwrap_or(&target.username);
        let stream = connect_tcp(&jump.host, jump.port, timeout)?;
        let session = self.open_session(
            stream,
            &jump.host,
            jump.port,
            username,
            &target.credential,
            timeout,
        )?;
        let channel = session
            .channel_direct_tcpip(&target.host, target.port, None)
            .map_err(|e| map_ssh_error("Failed to open jump channel", e))?;

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        thread::Builder::new()
            .name(format!("remux-jump-{}", jump.host))
            .spawn(move || {
                let local = match listener.accept() {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!("Jump bridge accept failed: {}", e);
                        return;
                    }
                };
                let remote = SshChannel {
                    channel,
                    session: session.clone(),
                };
                let mut splice = match Splice::new(local, Box::new(remote)) {
                    Ok(splice) => splice,
                    Err(e) => {
                        tracing::warn!("Jump bridge setup failed: {}", e);
                        return;
                    }
                };
                while !thread_stop.load(Ordering::SeqCst) && !splice.is_finished() {
                    match splice.pump() {
                        Ok(true) => {}
                        Ok(false) => thread::sleep(Duration::from_millis(2)),
                        Err(e) => {
                            tracing::debug!("Jump bridge closed: {}", e);
                            break;
                        }
                    }
                }
                splice.close();
                let _ = session.disconnect(None, "bridge closed", None);
            })?;

        Ok(JumpBridge { local_addr, stop })
    }
}

/// Loopback relay through a jump host; stops when dropped.
struct JumpBridge {
    local_addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
}

impl Drop for JumpBridge {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> AppResult<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| AppError::Network(format!("Failed to resolve {}: {}", host, e)))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(AppError::Network(match last_error {
        Some(e) => format!("TCP connect to {}:{} failed: {}", host, port, e),
        None => format!("No addresses found for {}", host),
    }))
}

fn authenticate(session: &Session, username: &str, credential: &Credential) -> AppResult<()> {
    match credential {
        Credential::Password(password) => {
            session
                .userauth_password(username, password)
                .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
        }
        Credential::PrivateKey { key, passphrase } => {
            // libssh2 wants a file; keep it only for the duration of the call
            let key_file_path =
                std::env::temp_dir().join(format!("remux_key_{}", uuid::Uuid::new_v4()));
            std::fs::write(&key_file_path, key)
                .map_err(|e| AppError::Auth(format!("Failed to write temp key file: {}", e)))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                let _ = std::fs::set_permissions(&key_file_path, perms);
            }

            let auth_result =
                session.userauth_pubkey_file(username, None, &key_file_path, passphrase.as_deref());
            let _ = std::fs::remove_file(&key_file_path);

            auth_result.map_err(|e| {
                let msg = e.to_string().to_lowercase();
                if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                    AppError::Auth("Invalid passphrase or key format".to_string())
                } else {
                    AppError::Auth("Private key not accepted by server".to_string())
                }
            })?;
        }
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

fn key_format(key_type: HostKeyType) -> KnownHostKeyFormat {
    match key_type {
        HostKeyType::Rsa => KnownHostKeyFormat::SshRsa,
        HostKeyType::Dss => KnownHostKeyFormat::SshDss,
        HostKeyType::Ecdsa256 => KnownHostKeyFormat::Ecdsa256,
        HostKeyType::Ecdsa384 => KnownHostKeyFormat::Ecdsa384,
        HostKeyType::Ecdsa521 => KnownHostKeyFormat::Ecdsa521,
        HostKeyType::Ed25519 => KnownHostKeyFormat::Ed25519,
        _ => KnownHostKeyFormat::Unknown,
    }
}

/// Compute SHA256 fingerprint of a key
fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

fn is_network_code(code: &ErrorCode) -> bool {
    matches!(
        code,
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_RECV
        )
    )
}

fn map_ssh_error(context: &str, err: ssh2::Error) -> AppError {
    if is_network_code(&err.code()) {
        AppError::Network(format!("{}: {}", context, err))
    } else {
        AppError::Ssh(format!("{}: {}", context, err))
    }
}

fn map_io_error(context: &str, err: io::Error) -> AppError {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::TimedOut => AppError::Network(format!("{}: {}", context, err)),
        _ => AppError::Ssh(format!("{}: {}", context, err)),
    }
}

struct SshRemote {
    session: Session,
    sftp: Option<Sftp>,
    default_timeout: Duration,
    _bridge: Option<JumpBridge>,
}

impl SshRemote {
    fn sftp(&mut self) -> AppResult<&Sftp> {
        self.session.set_blocking(true);
        if self.sftp.is_none() {
            let sftp = self
                .session
                .sftp()
                .map_err(|e| map_ssh_error("Failed to open SFTP", e))?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| AppError::Ssh("SFTP subsystem unavailable".to_string()))
    }
}

impl RemoteSession for SshRemote {
    fn open_shell(&mut self, cols: u32, rows: u32) -> AppResult<Box<dyn ByteChannel>> {
        self.session.set_blocking(true);
        let mut channel = self
            .session
            .channel_session()
            .map_err(|e| map_ssh_error("Failed to open channel", e))?;
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(|e| map_ssh_error("Failed to merge stderr", e))?;
        channel
            .request_pty("xterm-256color", None, Some((cols, rows, 0, 0)))
            .map_err(|e| map_ssh_error("Failed to request PTY", e))?;
        channel
            .shell()
            .map_err(|e| map_ssh_error("Failed to start shell", e))?;
        Ok(Box::new(SshChannel {
            channel,
            session: self.session.clone(),
        }))
    }

    fn open_tunnel(&mut self, host: &str, port: u16) -> AppResult<Box<dyn ByteChannel>> {
        self.session.set_blocking(true);
        let channel = self
            .session
            .channel_direct_tcpip(host, port, None)
            .map_err(|e| map_ssh_error("Failed to open forwarding channel", e))?;
        Ok(Box::new(SshChannel {
            channel,
            session: self.session.clone(),
        }))
    }

    fn probe(&mut self, timeout: Duration) -> AppResult<()> {
        self.session.set_blocking(true);
        self.session
            .set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        let result = self
            .session
            .keepalive_send()
            .map_err(|e| AppError::Network(format!("Keepalive send failed: {}", e)))
            .and_then(|_| {
                // keepalive@openssh has no reply we can wait on; force a round trip
                self.sftp()?
                    .realpath(Path::new("."))
                    .map(|_| ())
                    .map_err(|e| AppError::Network(format!("Keepalive probe failed: {}", e)))
            });
        self.session
            .set_timeout(self.default_timeout.as_millis().min(u32::MAX as u128) as u32);
        result
    }

    fn list_dir(&mut self, path: &str) -> AppResult<Vec<DirectoryEntry>> {
        let path = if path.is_empty() { "." } else { path };
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to list directory", e))?;

        let mut result: Vec<DirectoryEntry> = entries
            .into_iter()
            .filter(|(file_path, _)| {
                !matches!(
                    file_path.file_name().and_then(|n| n.to_str()),
                    Some(".") | Some("..")
                )
            })
            .map(|(file_path, stat)| {
                DirectoryEntry::new(
                    &file_path.to_string_lossy(),
                    FileAttributes {
                        size: stat.size,
                        modified: stat.mtime,
                        accessed: stat.atime,
                        uid: stat.uid,
                        gid: stat.gid,
                        permissions: stat.perm,
                    },
                )
            })
            .collect();
        sort_entries(&mut result);
        Ok(result)
    }

    fn open_reader(&mut self, path: &str) -> AppResult<(Box<dyn Read + Send>, u64)> {
        let sftp = self.sftp()?;
        let size = sftp
            .stat(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to stat", e))?
            .size
            .unwrap_or(0);
        let file = sftp
            .open(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to open file", e))?;
        Ok((Box::new(file), size))
    }

    fn open_writer(&mut self, path: &str) -> AppResult<Box<dyn Write + Send>> {
        let file = self
            .sftp()?
            .create(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to create file", e))?;
        Ok(Box::new(file))
    }

    fn remove_file(&mut self, path: &str) -> AppResult<()> {
        self.sftp()?
            .unlink(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to delete file", e))
    }

    fn make_dir(&mut self, path: &str) -> AppResult<()> {
        self.sftp()?
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| map_ssh_error("Failed to create directory", e))
    }

    fn remove_dir(&mut self, path: &str) -> AppResult<()> {
        self.sftp()?
            .rmdir(Path::new(path))
            .map_err(|e| map_ssh_error("Failed to delete directory", e))
    }

    fn rename(&mut self, from: &str, to: &str) -> AppResult<()> {
        self.sftp()?
            .rename(Path::new(from), Path::new(to), None)
            .map_err(|e| map_ssh_error("Failed to rename", e))
    }

    fn close(&mut self) {
        self.sftp = None;
        self.session.set_blocking(true);
        let _ = self.session.disconnect(None, "Connection closed", None);
    }
}

/// Channel on a shared session. The session is switched to non-blocking
/// only for the duration of a read or write.
struct SshChannel {
    channel: Channel,
    session: Session,
}

impl ByteChannel for SshChannel {
    fn read(&mut self, buf: &mut [u8]) -> AppResult<ReadOutcome> {
        self.session.set_blocking(false);
        let result = self.channel.stream(0).read(buf);
        self.session.set_blocking(true);

        match result {
            Ok(0) => {
                if self.channel.eof() {
                    Ok(ReadOutcome::Eof {
                        exit_status: self.channel.exit_status().ok(),
                    })
                } else {
                    Ok(ReadOutcome::Idle)
                }
            }
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                if self.channel.eof() {
                    Ok(ReadOutcome::Eof {
                        exit_status: self.channel.exit_status().ok(),
                    })
                } else {
                    Ok(ReadOutcome::Idle)
                }
            }
            Err(e) => Err(map_io_error("Channel read failed", e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> AppResult<usize> {
        self.session.set_blocking(false);
        let result = self.channel.write(data);
        self.session.set_blocking(true);

        match result {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                Ok(0)
            }
            Err(e) => Err(map_io_error("Channel write failed", e)),
        }
    }

    fn send_eof(&mut self) -> AppResult<()> {
        self.session.set_blocking(true);
        self.channel
            .send_eof()
            .map_err(|e| map_ssh_error("Failed to send EOF", e))
    }

    fn resize(&mut self, cols: u32, rows: u32) -> AppResult<()> {
        self.session.set_blocking(true);
        self.channel
            .request_pty_size(cols, rows, None, None)
            .map_err(|e| map_ssh_error("Failed to resize PTY", e))
    }

    fn close(&mut self) {
        self.session.set_blocking(true);
        let _ = self.channel.send_eof();
        let _ = self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = compute_sha256_fingerprint(b"test key data");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }

    #[test]
    fn test_socket_codes_are_network_errors() {
        assert!(is_network_code(&ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT)));
        assert!(is_network_code(&ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)));
        assert!(!is_network_code(&ErrorCode::Session(-18)));
        assert!(!is_network_code(&ErrorCode::SFTP(2)));
    }

    #[test]
    fn test_io_error_mapping() {
        let reset = io::Error::new(ErrorKind::ConnectionReset, "reset");
        assert!(map_io_error("read", reset).is_connection_fatal());
        let other = io::Error::new(ErrorKind::Other, "bad packet");
        assert!(!map_io_error("read", other).is_connection_fatal());
    }

    #[test]
    fn test_unresolvable_host_is_network_error() {
        let err = connect_tcp("host.invalid", 22, Duration::from_millis(200)).unwrap_err();
        assert!(err.is_connection_fatal());
    }
}
