//! Runs one file operation against a remote session, a chunk at a time.

use super::{FileRequest, OperationResult, OperationSlot, PutSource};
use crate::error::{AppError, AppResult};
use crate::transport::RemoteSession;
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Bytes moved per step
pub const TRANSFER_CHUNK_BYTES: usize = 32 * 1024;
/// Minimum distance between two progress events
pub const PROGRESS_INTERVAL_BYTES: u64 = 256 * 1024;

pub enum Step {
    Pending,
    Finished(AppResult<OperationResult>),
}

enum Sink {
    Memory(Vec<u8>),
    LocalFile { file: File, path: PathBuf },
    Remote(Box<dyn Write + Send>),
}

struct Transfer {
    reader: Box<dyn Read + Send>,
    sink: Sink,
    total: u64,
    transferred: u64,
    last_reported: u64,
    completed: bool,
}

impl Transfer {
    fn advance(&mut self, slot: &OperationSlot) -> Option<AppResult<OperationResult>> {
        let mut buf = vec![0u8; TRANSFER_CHUNK_BYTES];
        let n = match self.reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => return None,
            Err(e) => return Some(Err(self.read_error(e))),
        };

        if n == 0 {
            return Some(self.complete(slot));
        }

        if let Err(e) = self.write_chunk(&buf[..n]) {
            return Some(Err(e));
        }
        self.transferred += n as u64;

        if self.transferred < self.total
            && self.transferred - self.last_reported >= PROGRESS_INTERVAL_BYTES
        {
            self.last_reported = self.transferred;
            slot.report_progress(self.transferred, self.total);
        }
        None
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        match &mut self.sink {
            Sink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::LocalFile { file, .. } => Ok(file.write_all(chunk)?),
            Sink::Remote(writer) => writer
                .write_all(chunk)
                .map_err(|e| remote_io_error("Failed to write file", e)),
        }
    }

    fn read_error(&self, err: io::Error) -> AppError {
        match self.sink {
            // reading local data for a put
            Sink::Remote(_) if !is_connection_error(&err) => AppError::Io(err),
            _ => remote_io_error("Failed to read file", err),
        }
    }

    fn complete(&mut self, slot: &OperationSlot) -> AppResult<OperationResult> {
        let bytes = self.transferred;
        let result = match &mut self.sink {
            Sink::Memory(buf) => OperationResult::Bytes {
                contents: std::mem::take(buf),
            },
            Sink::LocalFile { file, path } => {
                file.flush()?;
                file.sync_all()?;
                OperationResult::Saved {
                    local_path: path.clone(),
                    bytes,
                }
            }
            Sink::Remote(writer) => {
                writer
                    .flush()
                    .map_err(|e| remote_io_error("Failed to write file", e))?;
                OperationResult::Written { bytes }
            }
        };
        self.completed = true;
        // the remote's size may have been stale; report what actually moved
        self.total = bytes;
        slot.report_progress(bytes, bytes);
        Ok(result)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Sink::LocalFile { path, .. } = &self.sink {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::debug!("Failed to remove partial download {:?}: {}", path, e);
            }
        }
    }
}

enum Work {
    Ready(FileRequest),
    Transfer(Transfer),
    Spent,
}

/// The operation a connection worker is currently executing
pub struct ActiveOperation {
    slot: Arc<OperationSlot>,
    work: Work,
}

impl ActiveOperation {
    pub fn new(slot: Arc<OperationSlot>, request: FileRequest) -> Self {
        Self {
            slot,
            work: Work::Ready(request),
        }
    }

    pub fn slot(&self) -> &Arc<OperationSlot> {
        &self.slot
    }

    /// Advance by one round trip or one chunk.
    pub fn step(&mut self, remote: &mut dyn RemoteSession) -> Step {
        match std::mem::replace(&mut self.work, Work::Spent) {
            Work::Ready(request) => match start(request, remote) {
                Ok(Started::Finished(result)) => Step::Finished(Ok(result)),
                Ok(Started::Transfer(transfer)) => {
                    self.work = Work::Transfer(transfer);
                    Step::Pending
                }
                Err(e) => Step::Finished(Err(e)),
            },
            Work::Transfer(mut transfer) => match transfer.advance(&self.slot) {
                None => {
                    self.work = Work::Transfer(transfer);
                    Step::Pending
                }
                Some(result) => Step::Finished(result),
            },
            Work::Spent => Step::Finished(Err(AppError::Closed(format!(
                "Operation {} already finished",
                self.slot.id
            )))),
        }
    }
}

enum Started {
    Finished(OperationResult),
    Transfer(Transfer),
}

fn start(request: FileRequest, remote: &mut dyn RemoteSession) -> AppResult<Started> {
    let finished = |result: OperationResult| -> AppResult<Started> { Ok(Started::Finished(result)) };
    match request {
        FileRequest::List { path } => finished(OperationResult::Entries {
            entries: remote.list_dir(&path)?,
        }),
        FileRequest::Delete { path } => {
            remote.remove_file(&path)?;
            finished(OperationResult::Unit)
        }
        FileRequest::Mkdir { path } => {
            remote.make_dir(&path)?;
            finished(OperationResult::Unit)
        }
        FileRequest::Rmdir { path } => {
            remote.remove_dir(&path)?;
            finished(OperationResult::Unit)
        }
        FileRequest::Rename { from, to } => {
            remote.rename(&from, &to)?;
            finished(OperationResult::Unit)
        }
        FileRequest::Get {
            remote_path,
            local_path,
        } => {
            let (reader, total) = remote.open_reader(&remote_path)?;
            let sink = match local_path {
                Some(path) => Sink::LocalFile {
                    file: File::create(&path)?,
                    path,
                },
                None => Sink::Memory(Vec::with_capacity(total.min(64 * 1024 * 1024) as usize)),
            };
            Ok(Started::Transfer(transfer(reader, sink, total)))
        }
        FileRequest::Put {
            remote_path,
            source,
        } => {
            let (reader, total): (Box<dyn Read + Send>, u64) = match source {
                PutSource::Bytes { contents } => {
                    let len = contents.len() as u64;
                    (Box::new(Cursor::new(contents)), len)
                }
                PutSource::File { local_path } => {
                    let file = File::open(&local_path)?;
                    let len = file.metadata()?.len();
                    (Box::new(file), len)
                }
            };
            let writer = remote.open_writer(&remote_path)?;
            Ok(Started::Transfer(transfer(reader, Sink::Remote(writer), total)))
        }
    }
}

fn transfer(reader: Box<dyn Read + Send>, sink: Sink, total: u64) -> Transfer {
    Transfer {
        reader,
        sink,
        total,
        transferred: 0,
        last_reported: 0,
        completed: false,
    }
}

fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
    )
}

fn remote_io_error(context: &str, err: io::Error) -> AppError {
    if is_connection_error(&err) {
        AppError::Network(format!("{}: {}", context, err))
    } else {
        AppError::Ssh(format!("{}: {}", context, err))
    }
}
