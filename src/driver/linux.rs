//! Driver for plain Linux hosts reached over SSH.
//!
//! Every contract method runs one or a few shell commands through a
//! non-interactive exec channel and parses the text. The parsers are pure
//! functions so they can be tested against captured output.

use std::collections::BTreeMap;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

use super::{
    DeviceDriver, DeviceTarget, DriverTuning, EnvironmentReport, Facts, InterfaceDetail,
    InterfaceMap, LldpNeighbor, NeighborMap, RouteEntry, RouteMap,
};
use crate::error::{ConnectError, DriverError};
use crate::session::ConnectionSecurityOptions;

static OS_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^VERSION="([^"]*)""#).expect("valid os-release regex"));

static LINK_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+:\s+([^:@\s]+)(?:@\S+)?:\s+<([^>]*)>(.*)$").expect("valid link regex")
});

static LINK_MTU: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bmtu (\d+)").expect("valid mtu regex"));

static LINK_ETHER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+link/\S+\s+([0-9a-fA-F:]{17})").expect("valid link/ether regex")
});

static ETHTOOL_SPEED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Speed: (\d+)Mb/s").expect("valid speed regex"));

static MEMINFO_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(\w+):\s+(\d+)").expect("valid meminfo regex"));

const TEMP_COMMAND: &str = "for f in /sys/class/hwmon/hwmon*/temp*_input; do \
    [ -r \"$f\" ] && printf '%s|%s|%s\\n' \"$f\" \"$(cat ${f%_input}_label 2>/dev/null)\" \"$(cat $f 2>/dev/null)\"; \
    done";

const FAN_COMMAND: &str = "for f in /sys/class/hwmon/hwmon*/fan*_input; do \
    [ -r \"$f\" ] && printf '%s|%s|%s\\n' \"$f\" \"$(cat ${f%_input}_label 2>/dev/null)\" \"$(cat $f 2>/dev/null)\"; \
    done";

const POWER_COMMAND: &str = "for f in /sys/class/power_supply/*/uevent; do \
    [ -r \"$f\" ] && echo \"== $f\" && cat \"$f\"; done";

/// Linux host driver.
pub struct LinuxDriver {
    target: DeviceTarget,
    tuning: DriverTuning,
    security: ConnectionSecurityOptions,
    client: Option<Client>,
}

impl LinuxDriver {
    pub fn new(target: DeviceTarget, tuning: DriverTuning) -> Self {
        Self {
            target,
            tuning,
            security: ConnectionSecurityOptions::default(),
            client: None,
        }
    }

    /// Overrides the algorithm policy used by `open`.
    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }

    async fn run(&self, command: &str) -> Result<String, DriverError> {
        let client = self.client.as_ref().ok_or(DriverError::NotOpen)?;
        let result = tokio::time::timeout(self.tuning.read_timeout, client.execute(command))
            .await
            .map_err(|_| DriverError::Command {
                command: command.to_string(),
                message: format!("no output within {:?}", self.tuning.read_timeout),
            })?
            .map_err(ConnectError::from)?;
        debug!(
            "{} '{}' exited with {}",
            self.target.addr(),
            command,
            result.exit_status
        );
        Ok(result.stdout)
    }

    /// Like `run`, but failures become empty output.
    async fn run_lenient(&self, command: &str) -> String {
        match self.run(command).await {
            Ok(out) => out,
            Err(e) => {
                debug!("{} '{}' ignored: {}", self.target.addr(), command, e);
                String::new()
            }
        }
    }

    async fn is_vmware_guest(&self) -> bool {
        let product = self
            .run_lenient("cat /sys/class/dmi/id/product_name 2>/dev/null")
            .await;
        if product.contains("VMware") {
            return true;
        }
        self.run_lenient("cat /proc/scsi/scsi 2>/dev/null")
            .await
            .contains("VMware")
    }

    async fn cpu_count(&self) -> usize {
        for command in [
            "nproc 2>/dev/null",
            "grep -c processor /proc/cpuinfo 2>/dev/null",
        ] {
            if let Ok(n) = self.run_lenient(command).await.trim().parse::<usize>()
                && n > 0
            {
                return n;
            }
        }
        1
    }
}

#[async_trait]
impl DeviceDriver for LinuxDriver {
    async fn open(&mut self) -> Result<(), DriverError> {
        if self.client.is_some() {
            return Ok(());
        }
        let auth = AuthMethod::with_password(self.target.password.as_deref().unwrap_or_default());
        let config = self.security.client_config(Some(self.tuning.keepalive));
        let connect = Client::connect_with_config(
            (self.target.host.clone(), self.target.port),
            &self.target.username,
            auth,
            self.security.server_check.clone(),
            config,
        );
        let client = tokio::time::timeout(self.tuning.conn_timeout, connect)
            .await
            .map_err(|_| ConnectError::Timeout(self.tuning.conn_timeout.as_secs()))?
            .map_err(ConnectError::from)?;
        debug!("{} connected", self.target.addr());
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if let Some(client) = self.client.take() {
            client.disconnect().await.map_err(ConnectError::from)?;
            debug!("{} disconnected", self.target.addr());
        }
        Ok(())
    }

    async fn get_facts(&mut self) -> Result<Facts, DriverError> {
        let hostname = self.run("hostname").await?.trim().to_string();
        let kernel_name = self.run("uname -s").await?.trim().to_string();
        let kernel_release = self.run("uname -r").await?.trim().to_string();
        let machine = self.run("uname -m").await?.trim().to_string();
        let os_name = self.run_lenient("uname -o").await.trim().to_string();

        let os_release = self.run_lenient("cat /etc/os-release").await;
        let os_version = parse_os_version(&os_release)
            .unwrap_or_else(|| format!("{} {}", os_name, kernel_release));

        let uptime_raw = self.run("cat /proc/uptime").await?;
        let uptime = parse_uptime(&uptime_raw)
            .ok_or_else(|| DriverError::Parse(format!("bad /proc/uptime: {:?}", uptime_raw)))?;

        Ok(Facts {
            hostname: Some(hostname),
            model: Some(format!("{} {}", kernel_name, machine)),
            serial_number: Some(kernel_release),
            os_version: Some(os_version),
            uptime: Some(uptime.trunc()),
            vendor: Some("Linux".to_string()),
        })
    }

    async fn get_interfaces(&mut self) -> Result<InterfaceMap, DriverError> {
        let links = self.run("ip link show").await?;
        let mut interfaces = parse_ip_link(&links);
        for (name, detail) in interfaces.iter_mut() {
            let ethtool = self.run_lenient(&format!("ethtool {} 2>/dev/null", name)).await;
            if let Some(speed) = parse_ethtool_speed(&ethtool) {
                detail.speed = speed;
            }
        }
        Ok(interfaces)
    }

    async fn get_lldp_neighbors_detail(&mut self) -> Result<NeighborMap, DriverError> {
        // lldpd is optional on hosts; no daemon simply means no neighbors.
        match self.run("lldpctl -f keyvalue").await {
            Ok(out) => Ok(parse_lldpctl_keyvalue(&out)),
            Err(e @ DriverError::NotOpen) => Err(e),
            Err(e) => {
                warn!("{} lldpctl unavailable: {}", self.target.addr(), e);
                Ok(NeighborMap::new())
            }
        }
    }

    async fn get_route_to(&mut self, _destination: &str) -> Result<RouteMap, DriverError> {
        let table = self.run("ip route show").await?;
        let mut routes = RouteMap::new();
        routes.insert("0.0.0.0/0".to_string(), parse_default_routes(&table));
        Ok(routes)
    }

    async fn get_environment(&mut self) -> Result<EnvironmentReport, DriverError> {
        if self.client.is_none() {
            return Err(DriverError::NotOpen);
        }
        let mut report = EnvironmentReport::default();

        let cpus = self.cpu_count().await;
        let usage = parse_proc_stat_usage(&self.run_lenient("grep 'cpu ' /proc/stat").await)
            .unwrap_or(0.0);
        for i in 0..cpus {
            report
                .cpu
                .insert(format!("CPU{}", i), json!({ "%usage": usage }));
        }

        if let Some(mem) = parse_meminfo(&self.run_lenient("cat /proc/meminfo").await) {
            report
                .memory
                .insert("available_ram".to_string(), json!(mem.total_bytes));
            report
                .memory
                .insert("used_ram".to_string(), json!(mem.used_bytes));
        }

        if self.is_vmware_guest().await {
            debug!("{} is a VMware guest, skipping sensors", self.target.addr());
            return Ok(report);
        }

        for (label, milli) in parse_hwmon_lines(&self.run_lenient(TEMP_COMMAND).await) {
            let celsius = (milli as f64 / 100.0).round() / 10.0;
            report.temperature.insert(
                label,
                json!({ "temperature": celsius, "is_alert": false, "is_critical": false }),
            );
        }
        for (label, rpm) in parse_hwmon_lines(&self.run_lenient(FAN_COMMAND).await) {
            report
                .fans
                .insert(label, json!({ "status": rpm > 0, "rpm": rpm }));
        }
        report.power = parse_power_supplies(&self.run_lenient(POWER_COMMAND).await);

        Ok(report)
    }

    async fn send_command(&mut self, command: &str) -> Result<String, DriverError> {
        self.run(command).await
    }
}

/// `VERSION="..."` from `/etc/os-release`.
pub fn parse_os_version(os_release: &str) -> Option<String> {
    OS_VERSION
        .captures(os_release)
        .map(|c| c[1].to_string())
        .filter(|v| !v.is_empty())
}

/// First field of `/proc/uptime`, in seconds.
pub fn parse_uptime(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Parses `ip link show`.
///
/// Stacked interfaces (`eth0.100@eth0`) are keyed by their own name.
pub fn parse_ip_link(output: &str) -> InterfaceMap {
    let mut interfaces = InterfaceMap::new();
    let mut current: Option<String> = None;

    for line in output.lines() {
        if let Some(caps) = LINK_HEADER.captures(line) {
            let name = caps[1].to_string();
            let flags: Vec<&str> = caps[2].split(',').collect();
            let rest = &caps[3];
            let detail = InterfaceDetail {
                is_enabled: flags.contains(&"UP"),
                is_up: flags.contains(&"LOWER_UP") || rest.contains("state UP"),
                mtu: LINK_MTU
                    .captures(rest)
                    .and_then(|c| c[1].parse().ok())
                    .unwrap_or(0),
                ..Default::default()
            };
            interfaces.insert(name.clone(), detail);
            current = Some(name);
        } else if let Some(caps) = LINK_ETHER.captures(line)
            && let Some(detail) = current.as_ref().and_then(|n| interfaces.get_mut(n))
        {
            detail.mac_address = caps[1].to_lowercase();
        }
    }
    interfaces
}

/// Link speed in Mbit/s from `ethtool <iface>`.
pub fn parse_ethtool_speed(output: &str) -> Option<f64> {
    ETHTOOL_SPEED
        .captures(output)
        .and_then(|c| c[1].parse::<f64>().ok())
}

/// Parses `lldpctl -f keyvalue`.
///
/// Keys look like `lldp.<local port>.chassis.name=<value>`; lldpctl prints one
/// neighbor block per local port.
pub fn parse_lldpctl_keyvalue(output: &str) -> NeighborMap {
    let mut by_port: BTreeMap<String, (Option<String>, Option<String>, Option<String>)> =
        BTreeMap::new();

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let mut parts = key.splitn(3, '.');
        let (Some("lldp"), Some(port), Some(field)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let entry = by_port.entry(port.to_string()).or_default();
        let value = Some(value.trim().to_string());
        match field {
            "chassis.name" => entry.0 = value,
            "port.ifname" => entry.1 = value,
            "port.descr" => entry.2 = value,
            _ => {}
        }
    }

    by_port
        .into_iter()
        .filter_map(|(port, (name, ifname, descr))| {
            let remote_port = ifname.or(descr);
            if name.is_none() && remote_port.is_none() {
                return None;
            }
            Some((
                port,
                vec![LldpNeighbor {
                    remote_system_name: name,
                    remote_port,
                }],
            ))
        })
        .collect()
}

/// Default routes from `ip route show`.
pub fn parse_default_routes(output: &str) -> Vec<RouteEntry> {
    output
        .lines()
        .filter(|line| line.trim_start().starts_with("default"))
        .map(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            let after = |key: &str| {
                words
                    .iter()
                    .position(|w| *w == key)
                    .and_then(|i| words.get(i + 1))
                    .map(|w| w.to_string())
            };
            let mut attributes = Map::new();
            if let Some(metric) = after("metric").and_then(|m| m.parse::<u64>().ok()) {
                attributes.insert("preference".to_string(), json!(metric));
            }
            attributes.insert("current_active".to_string(), json!(true));
            RouteEntry {
                destination: Some("0.0.0.0".to_string()),
                prefix_length: Some(0),
                next_hop: after("via").unwrap_or_default(),
                outgoing_interface: after("dev").unwrap_or_default(),
                protocol: after("proto").unwrap_or_else(|| "static".to_string()),
                attributes,
            }
        })
        .collect()
}

/// Busy percentage since boot from the aggregate `cpu` line of `/proc/stat`.
pub fn parse_proc_stat_usage(line: &str) -> Option<f64> {
    let line = line.lines().find(|l| l.starts_with("cpu "))?;
    let stats: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    let idle = *stats.get(3)?;
    let total: u64 = stats.iter().sum();
    if total == 0 {
        return Some(0.0);
    }
    let usage = 100.0 * (1.0 - idle as f64 / total as f64);
    Some((usage * 10.0).round() / 10.0)
}

/// Memory totals in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Parses `/proc/meminfo`; used excludes free, buffers and page cache.
pub fn parse_meminfo(output: &str) -> Option<MemorySample> {
    let fields: BTreeMap<&str, u64> = MEMINFO_LINE
        .captures_iter(output)
        .filter_map(|c| {
            let key = c.get(1)?.as_str();
            let value = c.get(2)?.as_str().parse().ok()?;
            Some((key, value))
        })
        .collect();
    let total = *fields.get("MemTotal")?;
    let reclaimable = fields.get("MemFree").copied().unwrap_or(0)
        + fields.get("Buffers").copied().unwrap_or(0)
        + fields.get("Cached").copied().unwrap_or(0);
    Some(MemorySample {
        total_bytes: total * 1024,
        used_bytes: total.saturating_sub(reclaimable) * 1024,
    })
}

/// Parses `path|label|value` lines produced by the hwmon loops.
///
/// Sensors without a label are named after their file.
pub fn parse_hwmon_lines(output: &str) -> Vec<(String, i64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let path = parts.next()?.trim();
            let label = parts.next()?.trim();
            let value = parts.next()?.trim().parse::<i64>().ok()?;
            let label = if label.is_empty() {
                path.rsplit('/')
                    .next()
                    .unwrap_or(path)
                    .trim_end_matches("_input")
                    .to_string()
            } else {
                label.to_string()
            };
            Some((label, value))
        })
        .collect()
}

/// Parses concatenated power-supply `uevent` files, each preceded by an
/// `== <path>` marker line.
pub fn parse_power_supplies(output: &str) -> Map<String, Value> {
    let mut supplies = Map::new();
    let mut current: Option<(String, Map<String, Value>)> = None;

    let mut flush = |entry: Option<(String, Map<String, Value>)>| {
        if let Some((name, props)) = entry {
            let status = props
                .get("online")
                .and_then(Value::as_str)
                .map(|v| v == "1")
                .or_else(|| {
                    props
                        .get("status")
                        .and_then(Value::as_str)
                        .map(|s| s != "Discharging" && s != "Unknown")
                })
                .unwrap_or(true);
            let mut record = props;
            record.insert("status".to_string(), json!(status));
            supplies.insert(name, Value::Object(record));
        }
    };

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("== ") {
            flush(current.take());
            let name = path
                .trim()
                .trim_end_matches("/uevent")
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            current = Some((name, Map::new()));
        } else if let Some((key, value)) = line.split_once('=')
            && let Some((_, props)) = current.as_mut()
        {
            let key = key
                .trim()
                .trim_start_matches("POWER_SUPPLY_")
                .to_lowercase();
            props.insert(key, json!(value.trim()));
        }
    }
    flush(current.take());
    supplies
}
