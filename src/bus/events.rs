use crate::error::{AppError, AppResult};
use crate::session::ConnectionStatus;
use crate::sftp::OperationOutcome;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event streams a subscriber may attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    ConnectionStatus,
    ShellData,
    ShellExit,
    ShellError,
    SftpProgress,
    SftpDone,
}

impl EventTopic {
    pub const ALL: [EventTopic; 6] = [
        EventTopic::ConnectionStatus,
        EventTopic::ShellData,
        EventTopic::ShellExit,
        EventTopic::ShellError,
        EventTopic::SftpProgress,
        EventTopic::SftpDone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::ConnectionStatus => "connection.status",
            EventTopic::ShellData => "shell.data",
            EventTopic::ShellExit => "shell.exit",
            EventTopic::ShellError => "shell.error",
            EventTopic::SftpProgress => "sftp.progress",
            EventTopic::SftpDone => "sftp.done",
        }
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventTopic {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventTopic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| AppError::ChannelNotAllowed(s.to_string()))
    }
}

/// Why a shell session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShellExitReason {
    /// Closed by the caller
    Closed,
    /// The remote process exited or closed the channel
    Remote { exit_status: Option<i32> },
    /// The owning connection dropped
    ConnectionLost { reason: String },
    /// The owning connection was disconnected on request
    Disconnected,
}

/// Event delivered to subscribers, tagged with the ids it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    ConnectionStatus {
        connection_id: String,
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ShellData {
        connection_id: String,
        session_id: String,
        data: Vec<u8>,
    },
    ShellExit {
        connection_id: String,
        session_id: String,
        reason: ShellExitReason,
    },
    ShellError {
        connection_id: String,
        session_id: String,
        message: String,
    },
    SftpProgress {
        connection_id: String,
        operation_id: String,
        transferred: u64,
        total: u64,
    },
    SftpDone {
        connection_id: String,
        operation_id: String,
        outcome: OperationOutcome,
    },
}

impl BusEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            BusEvent::ConnectionStatus { .. } => EventTopic::ConnectionStatus,
            BusEvent::ShellData { .. } => EventTopic::ShellData,
            BusEvent::ShellExit { .. } => EventTopic::ShellExit,
            BusEvent::ShellError { .. } => EventTopic::ShellError,
            BusEvent::SftpProgress { .. } => EventTopic::SftpProgress,
            BusEvent::SftpDone { .. } => EventTopic::SftpDone,
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            BusEvent::ConnectionStatus { connection_id, .. }
            | BusEvent::ShellData { connection_id, .. }
            | BusEvent::ShellExit { connection_id, .. }
            | BusEvent::ShellError { connection_id, .. }
            | BusEvent::SftpProgress { connection_id, .. }
            | BusEvent::SftpDone { connection_id, .. } => connection_id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            BusEvent::ShellData { session_id, .. }
            | BusEvent::ShellExit { session_id, .. }
            | BusEvent::ShellError { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    pub fn operation_id(&self) -> Option<&str> {
        match self {
            BusEvent::SftpProgress { operation_id, .. } | BusEvent::SftpDone { operation_id, .. } => {
                Some(operation_id)
            }
            _ => None,
        }
    }
}

/// Narrows a subscription; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub operation_id: Option<String>,
}

impl EventFilter {
    pub fn connection(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            ..Default::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn operation(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: Some(operation_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        fn accepts(wanted: &Option<String>, actual: Option<&str>) -> bool {
            match wanted {
                None => true,
                Some(wanted) => actual == Some(wanted.as_str()),
            }
        }

        accepts(&self.connection_id, Some(event.connection_id()))
            && accepts(&self.session_id, event.session_id())
            && accepts(&self.operation_id, event.operation_id())
    }
}

/// Parse a topic name, rejecting anything off the list
pub fn parse_topic(name: &str) -> AppResult<EventTopic> {
    name.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(connection: &str, session: &str) -> BusEvent {
        BusEvent::ShellData {
            connection_id: connection.to_string(),
            session_id: session.to_string(),
            data: b"hi".to_vec(),
        }
    }

    #[test]
    fn test_topic_names() {
        for topic in EventTopic::ALL {
            assert_eq!(parse_topic(topic.as_str()).unwrap(), topic);
        }
        let err = parse_topic("shell.exec").unwrap_err();
        assert!(matches!(err, AppError::ChannelNotAllowed(_)));
    }

    #[test]
    fn test_filter_by_session() {
        let filter = EventFilter::session("s1");
        assert!(filter.matches(&data("c1", "s1")));
        assert!(!filter.matches(&data("c1", "s2")));

        let status = BusEvent::ConnectionStatus {
            connection_id: "c1".to_string(),
            status: ConnectionStatus::Connected,
            reason: None,
        };
        assert!(!filter.matches(&status));
        assert!(EventFilter::connection("c1").matches(&status));
        assert!(EventFilter::default().matches(&status));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let value = serde_json::to_value(data("c1", "s1")).unwrap();
        assert_eq!(value["type"], "shell_data");
        assert_eq!(value["session_id"], "s1");

        let exit = BusEvent::ShellExit {
            connection_id: "c1".to_string(),
            session_id: "s1".to_string(),
            reason: ShellExitReason::Remote {
                exit_status: Some(0),
            },
        };
        let value = serde_json::to_value(exit).unwrap();
        assert_eq!(value["reason"]["kind"], "remote");
        assert_eq!(value["reason"]["exit_status"], 0);
    }
}
