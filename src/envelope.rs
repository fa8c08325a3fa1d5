//! The `{session_id, action, payload}` envelope exchanged with the presentation
//! layer, and the outbound emission path every session writes through.
//!
//! Outbound payloads are always passed through [`sanitize`] before they leave
//! the core, so the presentation side only ever sees plain JSON and never a
//! field whose name starts with the private `_` marker.

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::DispatchError;

/// Session id used for errors that cannot be attributed to a real session.
pub const SYSTEM_SESSION_ID: &str = "system";

/// Key prefix marking implementation-private fields.
pub const PRIVATE_KEY_PREFIX: char = '_';

/// A single wire message, used in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    pub session_id: String,
    pub action: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            session_id: session_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Serializes the envelope as a single JSON line.
    pub fn to_json(&self) -> String {
        // An envelope only holds strings and a `Value`, which always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parses inbound text into an envelope.
///
/// A missing `payload` becomes `{}`; a `payload` of `null` is treated the same.
pub fn parse_inbound(raw: &str) -> Result<Envelope, DispatchError> {
    let mut envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| DispatchError::Malformed(e.to_string()))?;
    if envelope.payload.is_null() {
        envelope.payload = empty_object();
    }
    Ok(envelope)
}

/// Recursively strips private keys from a JSON value.
///
/// Objects lose every key starting with [`PRIVATE_KEY_PREFIX`]; arrays and
/// primitives are kept as they are.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with(PRIVATE_KEY_PREFIX))
                .map(|(key, value)| (key, sanitize(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        other => other,
    }
}

/// Serializes any payload and sanitizes the result.
///
/// Values serde cannot represent as JSON (for example maps keyed by
/// non-strings) are dropped to `null`.
pub fn sanitize_payload<T: Serialize + ?Sized>(payload: &T) -> Value {
    match serde_json::to_value(payload) {
        Ok(value) => sanitize(value),
        Err(e) => {
            warn!("Dropping payload that is not representable as JSON: {}", e);
            Value::Null
        }
    }
}

/// Receiving end of all outbound envelopes.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Creates the outbound channel shared by all sessions of one router.
pub fn outbound_channel() -> (mpsc::UnboundedSender<Envelope>, OutboundReceiver) {
    mpsc::unbounded_channel()
}

/// Outbound handle bound to one session id.
///
/// Sending never blocks, so it is safe from worker loops and from synchronous
/// host code alike.
#[derive(Debug, Clone)]
pub struct Emitter {
    session_id: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Emitter {
    pub fn new(session_id: impl Into<String>, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns an emitter for another session id over the same channel.
    pub fn for_session(&self, session_id: impl Into<String>) -> Self {
        Self::new(session_id, self.tx.clone())
    }

    /// Sanitizes `payload` and emits it under `action`.
    pub fn send<T: Serialize + ?Sized>(&self, action: &str, payload: &T) {
        let envelope = Envelope::new(self.session_id.clone(), action, sanitize_payload(payload));
        if self.tx.send(envelope).is_err() {
            debug!(
                "{} outbound channel closed, dropping '{}'",
                self.session_id, action
            );
        }
    }

    /// Emits an `error` envelope carrying a human-readable message.
    pub fn error(&self, message: impl AsRef<str>) {
        self.send("error", &serde_json::json!({ "message": message.as_ref() }));
    }

    /// Emits the `{"status": "success"}` payload used by lifecycle actions.
    pub fn status(&self, action: &str) {
        self.send(action, &serde_json::json!({ "status": "success" }));
    }
}

/// JSON schema of the wire envelope.
pub fn envelope_schema() -> schemars::Schema {
    schemars::schema_for!(Envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_drops_private_keys_at_every_depth() {
        let input = json!({
            "hostname": "sw1",
            "_driver": "internal",
            "ports": [
                {"name": "Gi0/1", "_raw": "x", "speed": 1000},
                [1, 2, {"_hidden": true, "ok": null}]
            ],
            "nested": {"deeper": {"_secret": 1, "value": 2.5, "flag": false}}
        });

        let out = sanitize(input);

        assert_eq!(
            out,
            json!({
                "hostname": "sw1",
                "ports": [
                    {"name": "Gi0/1", "speed": 1000},
                    [1, 2, {"ok": null}]
                ],
                "nested": {"deeper": {"value": 2.5, "flag": false}}
            })
        );
        assert!(serde_json::to_string(&out).is_ok());
    }

    #[test]
    fn sanitize_payload_drops_non_string_map_keys() {
        let mut weird = std::collections::HashMap::new();
        weird.insert((1, 2), "pair-keyed");
        assert_eq!(sanitize_payload(&weird), Value::Null);
    }

    #[test]
    fn parse_inbound_defaults_payload() {
        let envelope =
            parse_inbound(r#"{"session_id":"terminal","action":"disconnect"}"#).expect("parse");
        assert_eq!(envelope.payload, json!({}));

        let envelope =
            parse_inbound(r#"{"session_id":"terminal","action":"disconnect","payload":null}"#)
                .expect("parse");
        assert_eq!(envelope.payload, json!({}));
    }

    #[test]
    fn parse_inbound_rejects_missing_action() {
        let err = parse_inbound(r#"{"session_id":"terminal"}"#).unwrap_err();
        assert!(matches!(err, DispatchError::Malformed(_)));
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn emitter_sanitizes_outbound_payloads() {
        let (tx, mut rx) = outbound_channel();
        let emitter = Emitter::new("telemetry", tx);

        emitter.send("telemetry_update", &json!({"_cache": 1, "device_info": {}}));
        emitter.error("boom");

        let first = rx.try_recv().expect("first envelope");
        assert_eq!(first.session_id, "telemetry");
        assert_eq!(first.payload, json!({"device_info": {}}));

        let second = rx.try_recv().expect("second envelope");
        assert_eq!(second.action, "error");
        assert_eq!(second.payload, json!({"message": "boom"}));
    }

    #[test]
    fn emitter_survives_closed_channel() {
        let (tx, rx) = outbound_channel();
        drop(rx);
        Emitter::new("ui_state", tx).status("connected");
    }
}
