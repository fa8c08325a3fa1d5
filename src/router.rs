//! Message router: the single inbound entry point.
//!
//! The router owns the three sessions, built once at construction, and turns
//! each inbound envelope into a call on one of them. It is a switchboard only
//! and keeps no device state.
//!
//! How a call is executed depends on the host, decided once per router:
//!
//! - [`Strategy::Scheduled`]: a tokio runtime is available. Every session
//!   gets a FIFO queue drained by one task, so a session sees its actions in
//!   dispatch order while different sessions run concurrently.
//!   `handle_inbound` only enqueues and returns.
//! - [`Strategy::Inline`]: no runtime. Zoom and theme changes run directly;
//!   every other action is driven to completion on a throwaway
//!   current-thread runtime, one per call. An inline router that is called
//!   from inside a runtime anyway cannot block, so it hands the call to the
//!   background runtime and returns.
//!
//! In both cases session handlers execute on the background runtime, so
//! connections they open outlive whichever scheduler issued the call.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;

use crate::config::CoreConfig;
use crate::driver::DriverRegistry;
use crate::envelope::{self, Emitter, Envelope, OutboundReceiver, SYSTEM_SESSION_ID};
use crate::error::{DispatchError, SessionError};
use crate::session::{
    InteractiveSession, KeyValueStore, Session, TELEMETRY_SESSION_ID, TERMINAL_SESSION_ID,
    TelemetrySession, UI_STATE_SESSION_ID, UiStateSession,
};
use crate::worker::{background, run_in_background};

pub const ZOOM_STEP: f64 = 0.1;
pub const MIN_ZOOM: f64 = 0.25;
pub const MAX_ZOOM: f64 = 5.0;

/// The presentation surface the router can adjust directly.
pub trait ViewHost: Send + Sync {
    fn zoom_factor(&self) -> f64;

    fn set_zoom_factor(&self, factor: f64);

    fn update_theme(&self, _theme: &str) {}
}

/// How inbound calls are executed.
#[derive(Debug, Clone)]
pub enum Strategy {
    Scheduled(Handle),
    Inline,
}

impl Strategy {
    /// `Scheduled` on the current tokio runtime, else `Inline`.
    pub fn detect() -> Self {
        match Handle::try_current() {
            Ok(handle) => Strategy::Scheduled(handle),
            Err(_) => Strategy::Inline,
        }
    }
}

struct Job {
    action: String,
    payload: Value,
}

type SessionMap = HashMap<String, (Arc<dyn Session>, Emitter)>;

enum Dispatch {
    Scheduled {
        queues: HashMap<String, mpsc::UnboundedSender<Job>>,
    },
    Inline,
}

pub struct Router {
    sessions: SessionMap,
    ui_state: Arc<UiStateSession>,
    view: Option<Arc<dyn ViewHost>>,
    system: Emitter,
    dispatch: Dispatch,
}

impl Router {
    /// Builds a router for the current host, without a view.
    pub fn new(config: CoreConfig, registry: DriverRegistry) -> (Self, OutboundReceiver) {
        Self::with_strategy(Strategy::detect(), config, registry, None)
    }

    pub fn with_strategy(
        strategy: Strategy,
        config: CoreConfig,
        registry: DriverRegistry,
        view: Option<Arc<dyn ViewHost>>,
    ) -> (Self, OutboundReceiver) {
        let (tx, rx) = envelope::outbound_channel();
        let system = Emitter::new(SYSTEM_SESSION_ID, tx);

        let terminal = Arc::new(InteractiveSession::new(
            system.for_session(TERMINAL_SESSION_ID),
            config.clone(),
        ));
        let telemetry = Arc::new(TelemetrySession::new(
            system.for_session(TELEMETRY_SESSION_ID),
            registry,
            config.clone(),
        ));
        let ui_state = Arc::new(UiStateSession::new(
            system.for_session(UI_STATE_SESSION_ID),
            KeyValueStore::new(&config.theme_store),
            &config.default_theme,
            view.clone(),
        ));

        let mut sessions = SessionMap::new();
        for session in [
            terminal as Arc<dyn Session>,
            telemetry as Arc<dyn Session>,
            ui_state.clone() as Arc<dyn Session>,
        ] {
            let emitter = system.for_session(session.session_id());
            sessions.insert(session.session_id().to_string(), (session, emitter));
        }

        let dispatch = match strategy {
            Strategy::Scheduled(handle) => {
                let queues = sessions
                    .iter()
                    .map(|(id, (session, emitter))| {
                        (id.clone(), spawn_queue(&handle, session.clone(), emitter.clone()))
                    })
                    .collect();
                Dispatch::Scheduled { queues }
            }
            Strategy::Inline => Dispatch::Inline,
        };
        info!(
            "router ready with sessions {:?} ({})",
            sessions.keys().collect::<Vec<_>>(),
            if matches!(dispatch, Dispatch::Inline) {
                "inline"
            } else {
                "scheduled"
            }
        );

        (
            Self {
                sessions,
                ui_state,
                view,
                system,
                dispatch,
            },
            rx,
        )
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.get(session_id).map(|(s, _)| s.clone())
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.dispatch, Dispatch::Inline)
    }

    /// Entry point for one inbound message.
    ///
    /// Never fails: malformed input is logged and dropped, everything else
    /// that goes wrong becomes an `error` envelope.
    pub fn handle_inbound(&self, raw: &str) {
        let envelope = match envelope::parse_inbound(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping inbound message: {}", e);
                return;
            }
        };
        if let Err(e) = self.dispatch(envelope) {
            error!("{}", e);
            self.system.error(e.to_string());
        }
    }

    /// Routes a parsed envelope to its session.
    pub fn dispatch(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let Envelope {
            session_id,
            action,
            payload,
        } = envelope;
        let Some((session, emitter)) = self.sessions.get(&session_id) else {
            return Err(DispatchError::UnknownSession(session_id));
        };
        debug!("{}: dispatching {}", session_id, action);

        if action == "zoom_in" || action == "zoom_out" {
            self.zoom(action == "zoom_in");
            return Ok(());
        }

        match &self.dispatch {
            Dispatch::Scheduled { queues } => {
                let queued = queues
                    .get(&session_id)
                    .map(|queue| queue.send(Job { action, payload }));
                if !matches!(queued, Some(Ok(()))) {
                    emitter.error("session queue is closed");
                }
            }
            Dispatch::Inline => {
                let result = if action == "set_theme" && session_id == UI_STATE_SESSION_ID {
                    self.ui_state.apply_set_theme(payload)
                } else if Handle::try_current().is_ok() {
                    run_detached(session.clone(), emitter.clone(), action.clone(), payload);
                    Ok(())
                } else {
                    run_blocking(session.clone(), &action, payload)
                };
                if let Err(e) = result {
                    report(emitter, &action, e);
                }
            }
        }
        Ok(())
    }

    fn zoom(&self, zoom_in: bool) {
        let Some(view) = &self.view else {
            debug!("zoom requested without a view");
            return;
        };
        let step = if zoom_in { ZOOM_STEP } else { -ZOOM_STEP };
        let factor = (view.zoom_factor() + step).clamp(MIN_ZOOM, MAX_ZOOM);
        view.set_zoom_factor(factor);
    }

    /// Disconnects every session.
    pub async fn shutdown(&self) {
        for (id, (session, _)) in &self.sessions {
            debug!("{}: shutting down", id);
            let session = session.clone();
            if let Err(e) = run_in_background(async move { session.shutdown().await }).await {
                warn!("{}: shutdown failed: {}", id, e);
            }
        }
    }

    /// [`shutdown`](Self::shutdown) for hosts without a runtime.
    ///
    /// Inside a runtime it cannot wait, so the sessions are shut down in the
    /// background instead.
    pub fn shutdown_blocking(&self) {
        if Handle::try_current().is_ok() {
            warn!("shutdown_blocking called inside a runtime, not waiting");
            for (session, _) in self.sessions.values() {
                let session = session.clone();
                background().spawn(async move { session.shutdown().await });
            }
            return;
        }
        match Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt.block_on(self.shutdown()),
            Err(e) => error!("cannot build runtime for shutdown: {}", e),
        }
    }
}

fn spawn_queue(
    handle: &Handle,
    session: Arc<dyn Session>,
    emitter: Emitter,
) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
    handle.spawn(async move {
        while let Some(Job { action, payload }) = rx.recv().await {
            let target = session.clone();
            let name = action.clone();
            let result = run_in_background(async move { target.handle(&name, payload).await })
                .await
                .and_then(|r| r);
            if let Err(e) = result {
                report(&emitter, &action, e);
            }
        }
        debug!("{}: queue closed", emitter.session_id());
    });
    tx
}

/// Runs one handler on the background runtime without waiting for it.
fn run_detached(session: Arc<dyn Session>, emitter: Emitter, action: String, payload: Value) {
    background().spawn(async move {
        if let Err(e) = session.handle(&action, payload).await {
            report(&emitter, &action, e);
        }
    });
}

/// Runs one handler to completion on a single-use runtime.
fn run_blocking(
    session: Arc<dyn Session>,
    action: &str,
    payload: Value,
) -> Result<(), SessionError> {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SessionError::Runtime(e.to_string()))?;
    let action = action.to_string();
    rt.block_on(run_in_background(async move {
        session.handle(&action, payload).await
    }))?
}

fn report(emitter: &Emitter, action: &str, err: SessionError) {
    error!("{}: {} failed: {}", emitter.session_id(), action, err);
    emitter.error(err.to_string());
}
