//! Sessions: long-lived, independently owned units of interaction.
//!
//! Every session is addressed by a fixed id, tracks whether it is active and
//! emits outbound envelopes through its own [`Emitter`](crate::envelope::Emitter).
//!
//! # Main Components
//!
//! - [`InteractiveSession`] - remote shell over an SSH channel (`"terminal"`)
//! - [`TelemetrySession`] - device driver plus background collector (`"telemetry"`)
//! - [`UiStateSession`] - persisted theme preference (`"ui_state"`)

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SessionError;

mod security;
pub mod shell;
pub mod telemetry;
pub mod ui_state;

pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use shell::{InteractiveSession, ShellConnectRequest};
pub use telemetry::{TelemetryConnectRequest, TelemetrySession};
pub use ui_state::{KeyValueStore, UiStateSession};

pub const TERMINAL_SESSION_ID: &str = "terminal";
pub const TELEMETRY_SESSION_ID: &str = "telemetry";
pub const UI_STATE_SESSION_ID: &str = "ui_state";

/// Common surface of all sessions, as seen by the router.
#[async_trait]
pub trait Session: Send + Sync {
    fn session_id(&self) -> &str;

    fn is_active(&self) -> bool;

    /// Handles one inbound action.
    ///
    /// An error return is reported by the caller as exactly one `error`
    /// envelope; handlers do not emit their own error for it.
    async fn handle(&self, action: &str, payload: Value) -> Result<(), SessionError>;

    /// Releases everything the session holds. Safe to call repeatedly.
    async fn shutdown(&self);
}

/// Decodes an action payload into its request type.
pub(crate) fn parse_payload<T: DeserializeOwned>(payload: Value) -> Result<T, SessionError> {
    Ok(serde_json::from_value(payload)?)
}

pub(crate) fn unknown_action(session_id: &str, action: &str) -> SessionError {
    SessionError::UnknownAction {
        session_id: session_id.to_string(),
        action: action.to_string(),
    }
}
