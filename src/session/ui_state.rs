//! Theme preference session backed by a small JSON key/value file.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{Session, parse_payload, unknown_action};
use crate::envelope::Emitter;
use crate::error::SessionError;
use crate::router::ViewHost;

const THEME_KEY: &str = "theme";

/// A JSON object stored in one file.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    path: PathBuf,
}

impl KeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole store. A missing file is an empty store.
    pub fn load(&self) -> io::Result<Map<String, Value>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e),
        };
        match serde_json::from_str(&raw)? {
            Value::Object(map) => Ok(map),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "store is not a JSON object",
            )),
        }
    }

    pub fn get_string(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self
            .load()?
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Sets one key, keeping the others. An unreadable store is replaced.
    pub fn set(&self, key: &str, value: Value) -> io::Result<()> {
        let mut map = self.load().unwrap_or_else(|e| {
            debug!("{}: starting fresh store: {}", self.path.display(), e);
            Map::new()
        });
        map.insert(key.to_string(), value);
        std::fs::write(&self.path, serde_json::to_vec_pretty(&Value::Object(map))?)
    }
}

#[derive(Debug, Deserialize)]
struct SetThemeRequest {
    theme: String,
}

/// Current theme, persisted across runs.
pub struct UiStateSession {
    emitter: Emitter,
    store: KeyValueStore,
    theme: Mutex<String>,
    view: Option<Arc<dyn ViewHost>>,
}

impl UiStateSession {
    /// Loads the stored theme (or `default_theme`) and announces it.
    pub fn new(
        emitter: Emitter,
        store: KeyValueStore,
        default_theme: &str,
        view: Option<Arc<dyn ViewHost>>,
    ) -> Self {
        let theme = match store.get_string(THEME_KEY) {
            Ok(Some(theme)) => theme,
            Ok(None) => default_theme.to_string(),
            Err(e) => {
                error!(
                    "{}: could not read {}: {}",
                    emitter.session_id(),
                    store.path().display(),
                    e
                );
                default_theme.to_string()
            }
        };
        let session = Self {
            emitter,
            store,
            theme: Mutex::new(theme),
            view,
        };
        session.announce();
        session
    }

    pub fn theme(&self) -> String {
        match self.theme.lock() {
            Ok(theme) => theme.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Switches the theme, persists it and emits `theme_changed`.
    ///
    /// Persistence failures are logged; the switch still happens.
    pub fn set_theme(&self, theme: &str) {
        match self.theme.lock() {
            Ok(mut current) => *current = theme.to_string(),
            Err(poisoned) => *poisoned.into_inner() = theme.to_string(),
        }
        if let Err(e) = self.store.set(THEME_KEY, json!(theme)) {
            error!("{}: error saving theme: {}", self.emitter.session_id(), e);
        }
        if let Some(view) = &self.view {
            view.update_theme(theme);
        }
        info!("{}: theme set to {}", self.emitter.session_id(), theme);
        self.announce();
    }

    /// `set_theme` with its wire payload.
    pub(crate) fn apply_set_theme(&self, payload: Value) -> Result<(), SessionError> {
        let request: SetThemeRequest = parse_payload(payload)?;
        self.set_theme(&request.theme);
        Ok(())
    }

    fn announce(&self) {
        self.emitter
            .send("theme_changed", &json!({ "theme": self.theme() }));
    }
}

#[async_trait]
impl Session for UiStateSession {
    fn session_id(&self) -> &str {
        self.emitter.session_id()
    }

    fn is_active(&self) -> bool {
        true
    }

    async fn handle(&self, action: &str, payload: Value) -> Result<(), SessionError> {
        match action {
            "set_theme" => self.apply_set_theme(payload),
            "get_theme" => {
                self.announce();
                Ok(())
            }
            other => Err(unknown_action(self.session_id(), other)),
        }
    }

    async fn shutdown(&self) {}
}
