//! Device driver contract.
//!
//! A driver turns device-specific command execution into a uniform set of
//! facts, interfaces, neighbors, routes and environment readings. The
//! telemetry session owns exactly one driver at a time; the collector borrows
//! it through [`SharedDriver`].
//!
//! Drivers are selected by [`Platform`], a closed set resolved once when a
//! telemetry session connects. [`DriverRegistry`] maps each platform to a
//! constructor; only the Linux driver ships with the crate, vendor drivers are
//! registered by the embedding application.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DriverError;

pub mod linux;

pub use linux::LinuxDriver;

/// Basic identity of a device, as reported by `get_facts`.
///
/// Every field is optional because platforms differ in what they report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Facts {
    pub hostname: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub os_version: Option<String>,
    /// Seconds since boot.
    #[serde(alias = "uptime_seconds")]
    pub uptime: Option<f64>,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct InterfaceDetail {
    pub is_up: bool,
    pub is_enabled: bool,
    pub description: String,
    /// Mbit/s, 0 when unknown.
    pub speed: f64,
    pub mtu: u32,
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LldpNeighbor {
    pub remote_system_name: Option<String>,
    pub remote_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RouteEntry {
    pub destination: Option<String>,
    pub prefix_length: Option<u8>,
    pub next_hop: String,
    pub outgoing_interface: String,
    pub protocol: String,
    /// Anything else the platform reports (age, preference, ...).
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Raw environment readings in the shape network drivers report them.
///
/// Each category maps an identifier (CPU id, sensor location, PSU id) to a
/// loosely typed record; normalization tolerates missing or odd fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EnvironmentReport {
    pub cpu: Map<String, Value>,
    pub memory: Map<String, Value>,
    pub temperature: Map<String, Value>,
    pub power: Map<String, Value>,
    pub fans: Map<String, Value>,
}

impl EnvironmentReport {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
            && self.memory.is_empty()
            && self.temperature.is_empty()
            && self.power.is_empty()
            && self.fans.is_empty()
    }
}

/// Interface name -> details.
pub type InterfaceMap = BTreeMap<String, InterfaceDetail>;
/// Local port -> neighbors seen on it.
pub type NeighborMap = BTreeMap<String, Vec<LldpNeighbor>>;
/// Routing table name -> entries.
pub type RouteMap = BTreeMap<String, Vec<RouteEntry>>;

/// The contract every device driver satisfies.
#[async_trait]
pub trait DeviceDriver: Send {
    /// Opens the connection to the device.
    async fn open(&mut self) -> Result<(), DriverError>;

    /// Closes the connection. Calling it twice is harmless.
    async fn close(&mut self) -> Result<(), DriverError>;

    async fn get_facts(&mut self) -> Result<Facts, DriverError>;

    async fn get_interfaces(&mut self) -> Result<InterfaceMap, DriverError>;

    async fn get_lldp_neighbors_detail(&mut self) -> Result<NeighborMap, DriverError>;

    async fn get_route_to(&mut self, destination: &str) -> Result<RouteMap, DriverError>;

    async fn get_environment(&mut self) -> Result<EnvironmentReport, DriverError>;

    /// Runs a raw CLI command. Drivers without a generic command path keep
    /// the default.
    async fn send_command(&mut self, _command: &str) -> Result<String, DriverError> {
        Err(DriverError::Unsupported("send_command"))
    }
}

/// A driver shared between a telemetry session and its collector.
pub type SharedDriver = Arc<tokio::sync::Mutex<Box<dyn DeviceDriver>>>;

pub fn share(driver: Box<dyn DeviceDriver>) -> SharedDriver {
    Arc::new(tokio::sync::Mutex::new(driver))
}

/// Supported device platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    Eos,
    NxosSsh,
    Junos,
    Linux,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Ios,
        Platform::Eos,
        Platform::NxosSsh,
        Platform::Junos,
        Platform::Linux,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Eos => "eos",
            Platform::NxosSsh => "nxos_ssh",
            Platform::Junos => "junos",
            Platform::Linux => "linux",
        }
    }

    /// Timeout and pacing for this platform.
    ///
    /// Slow or chatty CLIs get longer read timeouts and a larger delay
    /// multiplier; Linux hosts get the longest overall timeout because
    /// environment collection runs many small commands.
    pub fn tuning(&self) -> DriverTuning {
        let base = DriverTuning::default();
        match self {
            Platform::Eos => DriverTuning {
                read_timeout: Duration::from_secs(120),
                ..base
            },
            Platform::NxosSsh => DriverTuning {
                delay_factor: 3,
                read_timeout: Duration::from_secs(120),
                ..base
            },
            Platform::Ios => DriverTuning {
                delay_factor: 3,
                command_timeout: Some(Duration::from_secs(90)),
                ..base
            },
            Platform::Junos => base,
            Platform::Linux => DriverTuning {
                timeout: Duration::from_secs(180),
                delay_factor: 3,
                read_timeout: Duration::from_secs(150),
                ..base
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DriverError::UnsupportedPlatform(s.to_string()))
    }
}

/// Connection pacing handed to a driver at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverTuning {
    pub port: u16,
    /// Overall session timeout.
    pub timeout: Duration,
    pub keepalive: Duration,
    /// Multiplier applied to every inter-command delay.
    pub delay_factor: u32,
    pub read_timeout: Duration,
    pub conn_timeout: Duration,
    pub command_timeout: Option<Duration>,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: Duration::from_secs(120),
            keepalive: Duration::from_secs(30),
            delay_factor: 2,
            read_timeout: Duration::from_secs(90),
            conn_timeout: Duration::from_secs(60),
            command_timeout: None,
        }
    }
}

/// Where and as whom a driver connects.
#[derive(Clone)]
pub struct DeviceTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl DeviceTarget {
    pub fn addr(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Builds a driver for one platform.
pub type DriverConstructor =
    Arc<dyn Fn(DeviceTarget, DriverTuning) -> Box<dyn DeviceDriver> + Send + Sync>;

/// Platform -> driver constructor table.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<Platform, DriverConstructor>,
}

impl DriverRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the drivers shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Platform::Linux, |target, tuning| {
            Box::new(LinuxDriver::new(target, tuning))
        });
        registry
    }

    /// Registers (or replaces) the constructor for `platform`.
    pub fn register<F>(&mut self, platform: Platform, constructor: F)
    where
        F: Fn(DeviceTarget, DriverTuning) -> Box<dyn DeviceDriver> + Send + Sync + 'static,
    {
        self.constructors.insert(platform, Arc::new(constructor));
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.constructors.contains_key(&platform)
    }

    /// Resolves `driver_type` and builds an unopened driver for `target`.
    pub fn create(
        &self,
        driver_type: &str,
        target: DeviceTarget,
    ) -> Result<(Platform, Box<dyn DeviceDriver>), DriverError> {
        let platform: Platform = driver_type.parse()?;
        let constructor = self
            .constructors
            .get(&platform)
            .ok_or_else(|| DriverError::NoDriver(platform.to_string()))?;
        let mut tuning = platform.tuning();
        tuning.port = target.port;
        Ok((platform, constructor(target, tuning)))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut platforms: Vec<_> = self.constructors.keys().map(Platform::as_str).collect();
        platforms.sort_unstable();
        f.debug_struct("DriverRegistry")
            .field("platforms", &platforms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeviceTarget {
        DeviceTarget {
            host: "10.0.0.1".to_string(),
            port: 2222,
            username: "admin".to_string(),
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn platform_round_trips_through_identifier() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn unknown_identifier_is_an_unsupported_platform() {
        let err = "vyos".parse::<Platform>().unwrap_err();
        assert!(matches!(err, DriverError::UnsupportedPlatform(ref name) if name == "vyos"));
    }

    #[test]
    fn slow_platforms_get_longer_timeouts() {
        assert_eq!(Platform::Linux.tuning().timeout, Duration::from_secs(180));
        assert_eq!(Platform::NxosSsh.tuning().delay_factor, 3);
        assert_eq!(
            Platform::Ios.tuning().command_timeout,
            Some(Duration::from_secs(90))
        );
        assert_eq!(Platform::Junos.tuning(), DriverTuning::default());
    }

    #[test]
    fn registry_reports_missing_vendor_driver() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.contains(Platform::Linux));

        let err = match registry.create("eos", target()) {
            Ok(_) => panic!("eos has no built-in driver"),
            Err(err) => err,
        };
        assert!(matches!(err, DriverError::NoDriver(ref p) if p == "eos"));

        let err = match registry.create("bogus", target()) {
            Ok(_) => panic!("bogus platform should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, DriverError::UnsupportedPlatform(_)));
    }

    #[test]
    fn registry_builds_linux_driver() {
        let (platform, _driver) = DriverRegistry::with_builtin()
            .create("linux", target())
            .expect("linux driver");
        assert_eq!(platform, Platform::Linux);
    }

    #[test]
    fn target_debug_hides_password() {
        let rendered = format!("{:?}", target());
        assert!(!rendered.contains("secret"));
        assert_eq!(target().addr(), "admin@10.0.0.1:2222");
    }

    #[test]
    fn facts_accept_uptime_seconds_alias() {
        let facts: Facts = serde_json::from_str(
            r#"{"hostname": "sw1", "uptime_seconds": 42.0, "interface_list": []}"#,
        )
        .expect("facts");
        assert_eq!(facts.uptime, Some(42.0));
        assert_eq!(facts.model, None);
    }

    #[test]
    fn route_entry_keeps_extra_attributes() {
        let entry: RouteEntry = serde_json::from_str(
            r#"{"next_hop": "10.0.0.254", "protocol": "static", "preference": 1}"#,
        )
        .expect("route");
        assert_eq!(entry.attributes.get("preference"), Some(&Value::from(1)));
    }
}
