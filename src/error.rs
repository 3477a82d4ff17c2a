use thiserror::Error;

use crate::model::{DeviceKey, DeviceStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("account {0} has no email address")]
    NoAddress(String),
}

/// Why a command was answered with `resultCode = 1`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("missing required fields: {}", .0.join(","))]
    MissingFields(Vec<&'static str>),
    #[error("unknown command {0}")]
    UnknownCommand(i32),
    #[error("commandType {0} is not a request")]
    NotARequest(i32),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("account {0} not found")]
    AccountNotFound(String),
    #[error("invalid credentials")]
    BadCredentials,
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("device is not idle ({0:?})")]
    NotIdle(DeviceStatus),
    #[error("device {0} not found")]
    DeviceNotFound(DeviceKey),
    #[error("device {0} is not requesting help")]
    NotRequestingHelp(DeviceKey),
    #[error("binary frames are not supported")]
    Unsupported,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Hub(#[from] HubError),
}
