#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rtermtel::config::CoreConfig;
use rtermtel::driver::{
    DeviceDriver, DriverRegistry, EnvironmentReport, Facts, InterfaceMap, NeighborMap, Platform,
    RouteMap,
};
use rtermtel::envelope::{Envelope, OutboundReceiver};
use rtermtel::error::DriverError;

pub const FACTS: &str = include_str!("../fixtures/facts_sw1.json");
pub const INTERFACES: &str = include_str!("../fixtures/interfaces_sw1.json");
pub const NEIGHBORS: &str = include_str!("../fixtures/neighbors_sw1.json");
pub const ROUTES: &str = include_str!("../fixtures/routes_sw1.json");
pub const ENVIRONMENT: &str = include_str!("../fixtures/environment_sw1.json");

/// Call counters shared by every clone of a stub.
#[derive(Debug, Default)]
pub struct Calls {
    pub open: AtomicUsize,
    pub close: AtomicUsize,
    pub facts: AtomicUsize,
    pub commands: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// In-memory driver answering from the `sw1` fixtures.
#[derive(Clone)]
pub struct StubDriver {
    pub facts: Option<Facts>,
    pub fail_open: bool,
    pub fail_environment: bool,
    pub empty_environment: bool,
    /// Reply to `send_command("hostname")`; `None` means unsupported.
    pub hostname_reply: Option<String>,
    pub calls: Arc<Calls>,
}

impl StubDriver {
    pub fn sw1() -> Self {
        Self {
            facts: Some(serde_json::from_str(FACTS).expect("facts fixture")),
            fail_open: false,
            fail_environment: false,
            empty_environment: false,
            hostname_reply: None,
            calls: Arc::new(Calls::default()),
        }
    }

    pub fn without_facts() -> Self {
        Self {
            facts: None,
            ..Self::sw1()
        }
    }

    /// A registry serving clones of this stub for `platform`.
    pub fn registry(&self, platform: Platform) -> DriverRegistry {
        let mut registry = DriverRegistry::with_builtin();
        let stub = self.clone();
        registry.register(platform, move |_target, _tuning| Box::new(stub.clone()));
        registry
    }
}

#[async_trait]
impl DeviceDriver for StubDriver {
    async fn open(&mut self) -> Result<(), DriverError> {
        self.calls.open.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(DriverError::Command {
                command: "open".to_string(),
                message: "authentication failed".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.calls.close.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_facts(&mut self) -> Result<Facts, DriverError> {
        self.calls.facts.fetch_add(1, Ordering::SeqCst);
        self.facts
            .clone()
            .ok_or_else(|| DriverError::SessionConfusion("pattern not detected".to_string()))
    }

    async fn get_interfaces(&mut self) -> Result<InterfaceMap, DriverError> {
        serde_json::from_str(INTERFACES).map_err(|e| DriverError::Parse(e.to_string()))
    }

    async fn get_lldp_neighbors_detail(&mut self) -> Result<NeighborMap, DriverError> {
        serde_json::from_str(NEIGHBORS).map_err(|e| DriverError::Parse(e.to_string()))
    }

    async fn get_route_to(&mut self, _destination: &str) -> Result<RouteMap, DriverError> {
        serde_json::from_str(ROUTES).map_err(|e| DriverError::Parse(e.to_string()))
    }

    async fn get_environment(&mut self) -> Result<EnvironmentReport, DriverError> {
        if self.fail_environment {
            return Err(DriverError::Command {
                command: "show environment".to_string(),
                message: "% Invalid input".to_string(),
            });
        }
        if self.empty_environment {
            return Ok(EnvironmentReport::default());
        }
        serde_json::from_str(ENVIRONMENT).map_err(|e| DriverError::Parse(e.to_string()))
    }

    async fn send_command(&mut self, command: &str) -> Result<String, DriverError> {
        self.calls.commands.fetch_add(1, Ordering::SeqCst);
        match (command, &self.hostname_reply) {
            ("hostname", Some(reply)) => Ok(format!("{}\n", reply)),
            ("top -bn1 | grep 'Cpu(s)'", Some(_)) => {
                Ok("%Cpu(s):  7.5 us,  1.0 sy,  0.0 ni, 91.5 id".to_string())
            }
            ("free -m", Some(_)) => Ok("              total        used        free\n\
                                        Mem:           1024         256         768\n"
                .to_string()),
            _ => Err(DriverError::Unsupported("send_command")),
        }
    }
}

/// Settings that keep tests fast: one cycle per hour, millisecond backoff.
pub fn fast_config(theme_store: &std::path::Path) -> CoreConfig {
    CoreConfig {
        refresh_rate_secs: 3600,
        facts_base_delay_ms: 1,
        worker_join_timeout_ms: 1000,
        theme_store: theme_store.to_path_buf(),
        ..CoreConfig::default()
    }
}

/// Waits for the next envelope with `action`, skipping others.
pub async fn next_action(rx: &mut OutboundReceiver, action: &str) -> Envelope {
    let wait = async {
        loop {
            match rx.recv().await {
                Some(envelope) if envelope.action == action => return envelope,
                Some(_) => continue,
                None => panic!("outbound channel closed while waiting for {action}"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {action} envelope within 5s"))
}

/// Blocking variant of [`next_action`] for tests without a runtime.
pub fn next_action_blocking(rx: &mut OutboundReceiver, action: &str) -> Envelope {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match rx.try_recv() {
            Ok(envelope) if envelope.action == action => return envelope,
            Ok(_) => continue,
            Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("no {action} envelope within 5s: {e:?}"),
        }
    }
}

/// Everything already queued.
pub fn drain(rx: &mut OutboundReceiver) -> Vec<Envelope> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}
