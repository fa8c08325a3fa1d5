//! Error types for sessions, drivers and message dispatch.
//!
//! Each layer has its own enum. Session handlers return [`SessionError`];
//! the router turns any of them into an `error` envelope addressed to the
//! session that failed, so nothing here ever escapes to the host.

use thiserror::Error;

/// Errors raised while establishing or using an SSH transport.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The transport could not be established within the configured timeout.
    #[error("connect timeout after {0}s")]
    Timeout(u64),

    /// No usable private key could be loaded from the given path.
    ///
    /// This is distinct from the remote end rejecting the key: the key never
    /// made it onto the wire.
    #[error("no loadable key at {path}: {reason}")]
    KeyMaterial { path: String, reason: String },

    /// The SSH channel was closed while it was still needed.
    #[error("channel closed")]
    ChannelClosed,

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),
}

/// Errors produced by a [`DeviceDriver`](crate::driver::DeviceDriver).
#[derive(Error, Debug)]
pub enum DriverError {
    /// Opening the device connection failed.
    #[error("connection failed: {0}")]
    Connect(#[from] ConnectError),

    /// A method was called before `open` or after `close`.
    #[error("driver is not open")]
    NotOpen,

    /// A command ran but did not produce usable output.
    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    /// Output could not be parsed into the contract shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// The CLI session returned output belonging to another command.
    ///
    /// Seen on slow platforms when prompts interleave; usually clears on retry.
    #[error("session confusion: {0}")]
    SessionConfusion(String),

    /// The driver does not implement this part of the contract.
    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),

    /// The platform is known but no driver has been registered for it.
    #[error("no driver registered for platform {0}")]
    NoDriver(String),

    /// The platform identifier is not one of the supported platforms.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

impl DriverError {
    /// Returns true for the transient class of errors worth a quiet retry.
    pub fn is_session_confusion(&self) -> bool {
        matches!(self, DriverError::SessionConfusion(_))
    }
}

/// Errors returned by a session while handling one inbound action.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The payload did not match the shape the action expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("unknown action {action} for session {session_id}")]
    UnknownAction { session_id: String, action: String },

    #[error("session is not connected")]
    NotConnected,

    #[error("store error: {0}")]
    Store(#[from] std::io::Error),

    /// A background task panicked or was cancelled.
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Errors detected by the router before a session is involved.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The inbound text is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unknown session id: {0}")]
    UnknownSession(String),
}
