use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection not connected: {0}")]
    NotConnected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Session closed: {0}")]
    Closed(String),

    #[error("Channel not allowed: {0}")]
    ChannelNotAllowed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Queue full: {0}")]
    QueueFull(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Errors that mean the transport itself is gone, not just one request.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, AppError::Network(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::Network(_) => "NETWORK_ERROR",
            AppError::NotConnected(_) => "NOT_CONNECTED",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Closed(_) => "CLOSED",
            AppError::ChannelNotAllowed(_) => "CHANNEL_NOT_ALLOWED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::QueueFull(_) => "QUEUE_FULL",
            AppError::Ssh(_) => "SSH_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Serializable error for the UI side of the bus
#[derive(Debug, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (message, details) = match err {
            AppError::Auth(msg) => ("Authentication failed".to_string(), Some(msg.clone())),
            AppError::NotFound(id) => (format!("{} not found", id), None),
            AppError::NotConnected(id) => (format!("Connection {} is not connected", id), None),
            AppError::ChannelNotAllowed(channel) => {
                (format!("Channel '{}' is not allowed", channel), None)
            }
            AppError::Io(e) => (e.to_string(), None),
            AppError::Config(msg)
            | AppError::Network(msg)
            | AppError::Closed(msg)
            | AppError::Validation(msg)
            | AppError::QueueFull(msg)
            | AppError::Ssh(msg)
            | AppError::Serialization(msg) => (msg.clone(), None),
        };

        SerializableError {
            code: err.code().to_string(),
            message,
            details,
        }
    }
}

// Implement Serialize for AppError so it can cross the bus and Tauri IPC
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Config(format!("{:#}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let err = AppError::ChannelNotAllowed("fs.readFile".to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "CHANNEL_NOT_ALLOWED");
        assert!(value["message"].as_str().unwrap().contains("fs.readFile"));
        assert!(value.get("details").is_none());
    }

    #[test]
    fn test_auth_details_kept_out_of_message() {
        let err = AppError::Auth("Password authentication failed".to_string());
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["message"], "Authentication failed");
        assert_eq!(value["details"], "Password authentication failed");
    }

    #[test]
    fn test_only_network_errors_are_fatal() {
        assert!(AppError::Network("reset".into()).is_connection_fatal());
        assert!(!AppError::Ssh("no such file".into()).is_connection_fatal());
        assert!(!AppError::Validation("empty path".into()).is_connection_fatal());
    }
}
