//! Background telemetry polling.
//!
//! A [`Collector`] polls one driver every `refresh_rate`. Device facts gate
//! the cycle: they are retried under the facts [`RetryPolicy`] and, if every
//! attempt fails, the cycle reports an error and emits nothing else. The four
//! remaining categories are collected independently; a failing one becomes
//! its empty default in the update.
//!
//! The driver lock is taken per call, never across a backoff or the
//! inter-cycle sleep, so one-shot refreshes from the owning session can run
//! between cycles.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{
    DeviceInfo, RetryPolicy, TelemetryUpdate, collect_device_info, collect_environment,
    collect_interfaces, collect_neighbors, collect_routes,
};
use crate::config::CoreConfig;
use crate::driver::SharedDriver;
use crate::error::{DriverError, SessionError};
use crate::worker::{StopSignal, Worker, WorkerState};

/// Destination asked for in every routing query.
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// What a collector reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    Update(TelemetryUpdate),
    Error(String),
}

/// Receives collector events. Called from the background runtime.
pub type CollectorSink = Arc<dyn Fn(CollectorEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub refresh_rate: Duration,
    pub facts_retry: RetryPolicy,
    pub route_destination: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

impl CollectorSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            refresh_rate: config.refresh_rate(),
            facts_retry: RetryPolicy::new(config.facts_max_attempts, config.facts_base_delay()),
            route_destination: DEFAULT_ROUTE.to_string(),
        }
    }
}

/// A running polling loop. Never restarted once stopped.
pub struct Collector {
    worker: Worker,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("name", &self.worker.name())
            .field("state", &self.worker.state())
            .finish()
    }
}

impl Collector {
    /// Starts polling `driver`.
    ///
    /// Fails without spawning anything if the settings cannot drive a loop.
    pub fn start(
        label: impl Into<String>,
        driver: SharedDriver,
        settings: CollectorSettings,
        sink: CollectorSink,
    ) -> Result<Self, SessionError> {
        if settings.refresh_rate.is_zero() {
            return Err(SessionError::Runtime(
                "collector refresh rate must be positive".to_string(),
            ));
        }
        let label = label.into();
        let name = format!("{}-collector", label);
        let worker = Worker::spawn(name, move |stop| run(label, driver, settings, sink, stop));
        Ok(Self { worker })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    pub fn request_stop(&self) {
        self.worker.request_stop();
    }

    /// Stops the loop, waiting at most `timeout`.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.worker.stop(timeout).await
    }
}

async fn run(
    label: String,
    driver: SharedDriver,
    settings: CollectorSettings,
    sink: CollectorSink,
    mut stop: StopSignal,
) {
    info!(
        "{}: telemetry collection every {:?}",
        label, settings.refresh_rate
    );
    let mut cycle: u64 = 0;
    loop {
        cycle += 1;
        debug!("{}: cycle {}", label, cycle);
        match collect_cycle(&label, &driver, &settings, &mut stop).await {
            Cycle::Complete(update) => sink(CollectorEvent::Update(*update)),
            Cycle::Failed(message) => sink(CollectorEvent::Error(message)),
            Cycle::Stopped => break,
        }
        if !stop.sleep(settings.refresh_rate).await {
            break;
        }
    }
    info!("{}: telemetry collection stopped after {} cycles", label, cycle);
}

enum Cycle {
    Complete(Box<TelemetryUpdate>),
    Failed(String),
    Stopped,
}

async fn collect_cycle(
    label: &str,
    driver: &SharedDriver,
    settings: &CollectorSettings,
    stop: &mut StopSignal,
) -> Cycle {
    let device_info = match collect_facts(label, driver, &settings.facts_retry, stop).await {
        Ok(Some(info)) => info,
        Ok(None) => return Cycle::Stopped,
        Err(e) => {
            return Cycle::Failed(format!(
                "device facts unavailable after {} attempts: {}",
                settings.facts_retry.max_attempts, e
            ));
        }
    };
    if stop.is_requested() {
        return Cycle::Stopped;
    }

    let mut guard = driver.lock().await;
    let interfaces = isolated(label, "interfaces", collect_interfaces(&mut **guard).await);
    let neighbors = isolated(label, "neighbors", collect_neighbors(&mut **guard).await);
    let routing_table = isolated(
        label,
        "routing_table",
        collect_routes(&mut **guard, &settings.route_destination).await,
    );
    let environment = isolated(label, "environment", collect_environment(&mut **guard).await);
    drop(guard);

    Cycle::Complete(Box::new(TelemetryUpdate {
        device_info,
        interfaces,
        neighbors,
        routing_table,
        environment,
    }))
}

/// Facts under the retry policy. `Ok(None)` means a stop arrived mid-backoff.
async fn collect_facts(
    label: &str,
    driver: &SharedDriver,
    policy: &RetryPolicy,
    stop: &mut StopSignal,
) -> Result<Option<DeviceInfo>, DriverError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = {
            let mut guard = driver.lock().await;
            collect_device_info(&mut **guard).await
        };
        let err = match result {
            Ok(info) => return Ok(Some(info)),
            Err(e) => e,
        };
        let Some(delay) = policy.next_delay(label, attempt, &err) else {
            return Err(err);
        };
        if !stop.sleep(delay).await {
            return Ok(None);
        }
    }
}

fn isolated<T: Default>(label: &str, category: &str, result: Result<T, DriverError>) -> T {
    result.unwrap_or_else(|e| {
        warn!("{}: {} collection failed: {}", label, category, e);
        T::default()
    })
}
