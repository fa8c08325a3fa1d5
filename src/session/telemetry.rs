//! Telemetry session: one device driver and at most one collector.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::Value;

use super::{Session, parse_payload, unknown_action};
use crate::config::CoreConfig;
use crate::driver::{self, DeviceTarget, DriverRegistry, Platform, SharedDriver};
use crate::envelope::Emitter;
use crate::error::SessionError;
use crate::telemetry::collector::CollectorSink;
use crate::telemetry::{
    Collector, CollectorEvent, CollectorSettings, TelemetryUpdate, collect_device_info,
    collect_environment,
};

fn default_driver_type() -> String {
    Platform::Linux.as_str().to_string()
}

fn default_port() -> u16 {
    22
}

/// Payload of the telemetry `connect` action.
#[derive(Clone, Deserialize)]
pub struct TelemetryConnectRequest {
    pub host: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_driver_type")]
    pub driver_type: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds between cycles; the configured default when absent.
    #[serde(default)]
    pub refresh_rate: Option<u64>,
}

impl fmt::Debug for TelemetryConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryConnectRequest")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("driver_type", &self.driver_type)
            .field("port", &self.port)
            .field("refresh_rate", &self.refresh_rate)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Connection {
    device_type: Option<String>,
    driver: Option<SharedDriver>,
    collector: Option<Collector>,
    settings: CollectorSettings,
}

/// Owns a device driver and the collector polling it.
pub struct TelemetrySession {
    emitter: Emitter,
    registry: DriverRegistry,
    config: CoreConfig,
    active: Arc<AtomicBool>,
    snapshot: Arc<Mutex<Option<TelemetryUpdate>>>,
    conn: tokio::sync::Mutex<Connection>,
}

impl TelemetrySession {
    pub fn new(emitter: Emitter, registry: DriverRegistry, config: CoreConfig) -> Self {
        let settings = CollectorSettings::from_config(&config);
        Self {
            emitter,
            registry,
            config,
            active: Arc::new(AtomicBool::new(false)),
            snapshot: Arc::new(Mutex::new(None)),
            conn: tokio::sync::Mutex::new(Connection {
                settings,
                ..Default::default()
            }),
        }
    }

    /// True while a collector is alive.
    pub async fn is_monitoring(&self) -> bool {
        self.conn
            .lock()
            .await
            .collector
            .as_ref()
            .is_some_and(Collector::is_running)
    }

    /// Opens a driver for `request` and starts monitoring.
    ///
    /// On failure the driver is closed and released and the session stays
    /// inactive.
    pub async fn connect(&self, request: TelemetryConnectRequest) -> Result<(), SessionError> {
        let mut conn = self.conn.lock().await;
        if conn.driver.is_some() {
            info!("{}: replacing existing connection", self.id());
            self.teardown(&mut conn).await;
        }

        let target = DeviceTarget {
            host: request.host.clone(),
            port: request.port,
            username: request.username.clone(),
            password: request.password.clone(),
        };
        let (platform, driver) = self.registry.create(&request.driver_type, target.clone())?;
        let driver = driver::share(driver);
        info!("{}: opening {} driver for {}", self.id(), platform, target.addr());

        let opened = driver.lock().await.open().await;
        if let Err(e) = opened {
            error!("{}: failed to open {}: {}", self.id(), target.addr(), e);
            if let Err(close_err) = driver.lock().await.close().await {
                debug!("{}: close after failed open: {}", self.id(), close_err);
            }
            return Err(e.into());
        }

        conn.driver = Some(driver);
        conn.device_type = Some(platform.to_string());
        conn.settings = CollectorSettings::from_config(&self.config);
        if let Some(secs) = request.refresh_rate {
            conn.settings.refresh_rate = Duration::from_secs(secs.max(1));
        }

        self.active.store(true, Ordering::Release);
        self.emitter.status("connected");
        self.start_monitoring(&mut conn).await;
        Ok(())
    }

    /// Starts the collector unless one is already running.
    pub async fn collect_all_telemetry(&self) -> Result<(), SessionError> {
        let mut conn = self.conn.lock().await;
        if conn.driver.is_none() {
            return Err(SessionError::NotConnected);
        }
        self.start_monitoring(&mut conn).await;
        Ok(())
    }

    async fn start_monitoring(&self, conn: &mut Connection) {
        if conn.collector.as_ref().is_some_and(Collector::is_running) {
            debug!("{}: collector already running", self.id());
            return;
        }
        if let Some(stale) = conn.collector.take() {
            stale.stop(self.config.worker_join_timeout()).await;
        }

        let started = match conn.driver.clone() {
            Some(driver) => Collector::start(
                self.id().to_string(),
                driver,
                conn.settings.clone(),
                self.sink(),
            ),
            None => Err(SessionError::NotConnected),
        };
        match started {
            Ok(collector) => conn.collector = Some(collector),
            Err(e) => {
                error!("{}: could not start telemetry collection: {}", self.id(), e);
                self.emitter
                    .error(format!("Failed to start telemetry collection: {}", e));
                self.send_minimal_telemetry(conn).await;
            }
        }
    }

    async fn send_minimal_telemetry(&self, conn: &Connection) {
        let mut hostname = None;
        if let Some(driver) = &conn.driver {
            match driver.lock().await.send_command("hostname").await {
                Ok(name) => hostname = Some(name),
                Err(e) => debug!("{}: hostname for minimal telemetry: {}", self.id(), e),
            }
        }
        let os_version = conn.device_type.as_deref().unwrap_or("unknown");
        let update = TelemetryUpdate::minimal(hostname.as_deref(), os_version);
        self.emitter.send("telemetry_update", &update);
        self.store_snapshot(update);
    }

    fn sink(&self) -> CollectorSink {
        let emitter = self.emitter.clone();
        let active = self.active.clone();
        let snapshot = self.snapshot.clone();
        Arc::new(move |event| {
            if !active.load(Ordering::Acquire) {
                debug!("{}: dropping collector event after disconnect", emitter.session_id());
                return;
            }
            match event {
                CollectorEvent::Update(update) => {
                    emitter.send("telemetry_update", &update);
                    if let Ok(mut slot) = snapshot.lock() {
                        *slot = Some(update);
                    }
                }
                CollectorEvent::Error(message) => emitter.error(message),
            }
        })
    }

    fn store_snapshot(&self, update: TelemetryUpdate) {
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = Some(update);
        }
    }

    /// Applies `change` to the last snapshot (or an empty one) and emits it.
    fn emit_merged(&self, change: impl FnOnce(&mut TelemetryUpdate)) {
        let mut update = self
            .snapshot
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_default();
        change(&mut update);
        self.emitter.send("telemetry_update", &update);
        self.store_snapshot(update);
    }

    fn connected_driver(&self, conn: &Connection) -> Result<SharedDriver, SessionError> {
        conn.driver.clone().ok_or(SessionError::NotConnected)
    }

    pub async fn refresh_device_info(&self) -> Result<(), SessionError> {
        let driver = self.connected_driver(&*self.conn.lock().await)?;
        let info = collect_device_info(&mut **driver.lock().await).await?;
        self.emit_merged(|update| update.device_info = info);
        Ok(())
    }

    pub async fn refresh_environment(&self) -> Result<(), SessionError> {
        let driver = self.connected_driver(&*self.conn.lock().await)?;
        let environment = collect_environment(&mut **driver.lock().await).await?;
        self.emit_merged(|update| update.environment = environment);
        Ok(())
    }

    /// Stops the collector, closes the driver and goes inactive.
    ///
    /// Does nothing (and emits nothing) if there is nothing to tear down.
    pub async fn disconnect(&self) {
        let mut conn = self.conn.lock().await;
        if conn.driver.is_none() && conn.collector.is_none() && !self.is_active() {
            debug!("{}: disconnect while idle", self.id());
            return;
        }
        self.teardown(&mut conn).await;
        self.emitter.status("disconnected");
    }

    async fn teardown(&self, conn: &mut Connection) {
        self.active.store(false, Ordering::Release);

        if let Some(collector) = conn.collector.take()
            && !collector.stop(self.config.worker_join_timeout()).await
        {
            warn!("{}: collector aborted during teardown", self.id());
        }

        if let Some(driver) = conn.driver.take() {
            let close = async { driver.lock().await.close().await };
            match tokio::time::timeout(self.config.worker_join_timeout(), close).await {
                Ok(Ok(())) => debug!("{}: driver closed", self.id()),
                Ok(Err(e)) => warn!("{}: driver close failed: {}", self.id(), e),
                Err(_) => warn!("{}: driver close timed out", self.id()),
            }
        }
        conn.device_type = None;
        if let Ok(mut slot) = self.snapshot.lock() {
            *slot = None;
        }
    }

    fn id(&self) -> &str {
        self.emitter.session_id()
    }
}

#[async_trait]
impl Session for TelemetrySession {
    fn session_id(&self) -> &str {
        self.id()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    async fn handle(&self, action: &str, payload: Value) -> Result<(), SessionError> {
        match action {
            "connect" => self.connect(parse_payload(payload)?).await,
            "disconnect" => {
                self.disconnect().await;
                Ok(())
            }
            "get_device_info" => self.refresh_device_info().await,
            "get_environment" => self.refresh_environment().await,
            "start_monitoring" => self.collect_all_telemetry().await,
            other => Err(unknown_action(self.id(), other)),
        }
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }
}
