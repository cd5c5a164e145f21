//! Pumps bytes between a local TCP socket and a remote [`ByteChannel`].

use super::{ByteChannel, ReadOutcome};
use crate::error::AppResult;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

const SPLICE_BUF_BYTES: usize = 16 * 1024;

pub struct Splice {
    stream: TcpStream,
    channel: Box<dyn ByteChannel>,
    to_remote: Vec<u8>,
    to_local: Vec<u8>,
    local_eof: bool,
    eof_sent: bool,
    remote_eof: bool,
    broken: bool,
}

impl Splice {
    pub fn new(stream: TcpStream, channel: Box<dyn ByteChannel>) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            channel,
            to_remote: Vec::new(),
            to_local: Vec::new(),
            local_eof: false,
            eof_sent: false,
            remote_eof: false,
            broken: false,
        })
    }

    /// One non-blocking pass in both directions. Returns whether any bytes
    /// moved. Errors are only returned for the remote side; a failing local
    /// socket just finishes the splice.
    pub fn pump(&mut self) -> AppResult<bool> {
        let mut progressed = false;
        let mut buf = [0u8; SPLICE_BUF_BYTES];

        if !self.local_eof && self.to_remote.len() < SPLICE_BUF_BYTES {
            match self.stream.read(&mut buf) {
                Ok(0) => self.local_eof = true,
                Ok(n) => {
                    self.to_remote.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Local tunnel socket read failed: {}", e);
                    self.broken = true;
                }
            }
        }

        if !self.to_remote.is_empty() {
            let n = self.channel.write(&self.to_remote)?;
            if n > 0 {
                self.to_remote.drain(..n);
                progressed = true;
            }
        }

        // Half-close: the remote still gets to answer after local EOF.
        if self.local_eof && !self.eof_sent && self.to_remote.is_empty() {
            self.channel.send_eof()?;
            self.eof_sent = true;
            progressed = true;
        }

        if !self.remote_eof && self.to_local.len() < SPLICE_BUF_BYTES {
            match self.channel.read(&mut buf)? {
                ReadOutcome::Data(n) => {
                    self.to_local.extend_from_slice(&buf[..n]);
                    progressed = true;
                }
                ReadOutcome::Idle => {}
                ReadOutcome::Eof { .. } => self.remote_eof = true,
            }
        }

        if !self.to_local.is_empty() && !self.broken {
            match self.stream.write(&self.to_local) {
                Ok(n) => {
                    self.to_local.drain(..n);
                    progressed |= n > 0;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Local tunnel socket write failed: {}", e);
                    self.broken = true;
                }
            }
        }

        Ok(progressed)
    }

    /// Done once the remote has closed and everything it sent was handed
    /// to the local socket, or once either side broke.
    pub fn is_finished(&self) -> bool {
        self.broken || (self.remote_eof && self.to_local.is_empty())
    }

    pub fn close(&mut self) {
        self.broken = true;
        self.channel.close();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;
    use std::net::{Shutdown, TcpListener};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Seen {
        received: Vec<u8>,
        eof: bool,
    }

    /// Answers with "pong" a few polls after the local side half-closes.
    struct DelayedReply {
        seen: Arc<Mutex<Seen>>,
        polls_after_eof: u32,
        replied: bool,
    }

    impl ByteChannel for DelayedReply {
        fn read(&mut self, buf: &mut [u8]) -> AppResult<ReadOutcome> {
            if !self.seen.lock().eof {
                return Ok(ReadOutcome::Idle);
            }
            if self.replied {
                return Ok(ReadOutcome::Eof { exit_status: None });
            }
            self.polls_after_eof += 1;
            if self.polls_after_eof < 4 {
                return Ok(ReadOutcome::Idle);
            }
            buf[..4].copy_from_slice(b"pong");
            self.replied = true;
            Ok(ReadOutcome::Data(4))
        }

        fn write(&mut self, data: &[u8]) -> AppResult<usize> {
            let mut seen = self.seen.lock();
            if seen.eof {
                return Err(AppError::Closed("write after eof".to_string()));
            }
            seen.received.extend_from_slice(data);
            Ok(data.len())
        }

        fn send_eof(&mut self) -> AppResult<()> {
            self.seen.lock().eof = true;
            Ok(())
        }

        fn resize(&mut self, _cols: u32, _rows: u32) -> AppResult<()> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn test_reply_after_local_half_close_is_delivered() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let (server, _) = listener.accept().unwrap();

        let seen = Arc::new(Mutex::new(Seen::default()));
        let channel = DelayedReply {
            seen: Arc::clone(&seen),
            polls_after_eof: 0,
            replied: false,
        };
        let mut splice = Splice::new(server, Box::new(channel)).unwrap();

        client.write_all(b"ping").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut pumps = 0;
        while !splice.is_finished() && pumps < 500 {
            splice.pump().unwrap();
            pumps += 1;
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(splice.is_finished());
        splice.close();

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "pong");
        let seen = seen.lock();
        assert_eq!(seen.received, b"ping");
        assert!(seen.eof);
    }
}
