//! Request channels the bus accepts and the payloads they carry.

use crate::error::{AppError, AppResult};
use crate::sftp::{FileRequest, PutSource};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Allow-listed request channels. Anything else is refused at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Connect,
    Disconnect,
    Status,
    ShellOpen,
    ShellWrite,
    ShellResize,
    ShellClose,
    SftpList,
    SftpGet,
    SftpPut,
    SftpDelete,
    SftpMkdir,
    SftpRmdir,
    SftpRename,
    SftpCancel,
}

impl Channel {
    pub const ALL: [Channel; 15] = [
        Channel::Connect,
        Channel::Disconnect,
        Channel::Status,
        Channel::ShellOpen,
        Channel::ShellWrite,
        Channel::ShellResize,
        Channel::ShellClose,
        Channel::SftpList,
        Channel::SftpGet,
        Channel::SftpPut,
        Channel::SftpDelete,
        Channel::SftpMkdir,
        Channel::SftpRmdir,
        Channel::SftpRename,
        Channel::SftpCancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Connect => "connect",
            Channel::Disconnect => "disconnect",
            Channel::Status => "status",
            Channel::ShellOpen => "shell.open",
            Channel::ShellWrite => "shell.write",
            Channel::ShellResize => "shell.resize",
            Channel::ShellClose => "shell.close",
            Channel::SftpList => "sftp.list",
            Channel::SftpGet => "sftp.get",
            Channel::SftpPut => "sftp.put",
            Channel::SftpDelete => "sftp.delete",
            Channel::SftpMkdir => "sftp.mkdir",
            Channel::SftpRmdir => "sftp.rmdir",
            Channel::SftpRename => "sftp.rename",
            Channel::SftpCancel => "sftp.cancel",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| AppError::ChannelNotAllowed(s.to_string()))
    }
}

/// One request as it arrives from the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub channel: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    pub operation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOpenPayload {
    pub connection_id: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellResizePayload {
    pub session_id: String,
    pub cols: u32,
    pub rows: u32,
}

/// Shell input, either text or raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteData {
    Text(String),
    Bytes(Vec<u8>),
}

impl WriteData {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            WriteData::Text(text) => text.into_bytes(),
            WriteData::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellWritePayload {
    pub session_id: String,
    pub data: WriteData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPayload {
    pub connection_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPayload {
    pub connection_id: String,
    pub remote_path: String,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

/// Upload from inline `contents` or from `local_path`, never both
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutPayload {
    pub connection_id: String,
    pub remote_path: String,
    #[serde(default)]
    pub contents: Option<WriteData>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
}

impl PutPayload {
    pub fn into_request(self) -> AppResult<(String, FileRequest)> {
        let source = match (self.contents, self.local_path) {
            (Some(contents), None) => PutSource::Bytes {
                contents: contents.into_bytes(),
            },
            (None, Some(local_path)) => PutSource::File { local_path },
            _ => {
                return Err(AppError::Validation(
                    "Exactly one of contents or local_path is required".to_string(),
                ))
            }
        };
        Ok((
            self.connection_id,
            FileRequest::Put {
                remote_path: self.remote_path,
                source,
            },
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenamePayload {
    pub connection_id: String,
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_allow_list() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        for refused in ["exec", "shell.exec", "SHELL.OPEN", "", "connect "] {
            assert!(matches!(
                refused.parse::<Channel>(),
                Err(AppError::ChannelNotAllowed(_))
            ));
        }
    }

    #[test]
    fn test_write_data_accepts_text_and_bytes() {
        let text: ShellWritePayload =
            serde_json::from_value(serde_json::json!({"session_id": "s", "data": "ls\n"})).unwrap();
        assert_eq!(text.data.into_bytes(), b"ls\n");

        let bytes: ShellWritePayload =
            serde_json::from_value(serde_json::json!({"session_id": "s", "data": [3, 4]})).unwrap();
        assert_eq!(bytes.data.into_bytes(), vec![3, 4]);
    }

    #[test]
    fn test_put_needs_one_source() {
        let payload = |contents: Option<WriteData>, local: Option<&str>| PutPayload {
            connection_id: "c1".to_string(),
            remote_path: "/tmp/x".to_string(),
            contents,
            local_path: local.map(PathBuf::from),
        };
        assert!(payload(None, None).into_request().is_err());
        assert!(payload(Some(WriteData::Text("a".into())), Some("/tmp/a"))
            .into_request()
            .is_err());

        let (_, request) = payload(None, Some("/tmp/a")).into_request().unwrap();
        assert!(matches!(
            request,
            FileRequest::Put {
                source: PutSource::File { .. },
                ..
            }
        ));
    }
}
