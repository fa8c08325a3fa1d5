//! Telemetry payload model and normalization.
//!
//! Driver output is loosely shaped and differs per platform. Everything here
//! folds it into the fixed five-key [`TelemetryUpdate`] the presentation layer
//! consumes. Normalizers never fail on odd input: bad entries are skipped and
//! missing values get defaults.

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::driver::{
    DeviceDriver, EnvironmentReport, Facts, InterfaceMap, NeighborMap, RouteMap,
};
use crate::error::DriverError;

pub mod collector;
pub mod retry;

pub use collector::{Collector, CollectorEvent, CollectorSettings};
pub use retry::RetryPolicy;

const UNKNOWN: &str = "unknown";

/// Identity block of a telemetry update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceInfo {
    pub hostname: String,
    pub model: String,
    pub serial: String,
    pub os_version: String,
    /// `"{d}d {h}h {m}m"`.
    pub uptime: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            hostname: UNKNOWN.to_string(),
            model: UNKNOWN.to_string(),
            serial: UNKNOWN.to_string(),
            os_version: UNKNOWN.to_string(),
            uptime: UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InterfaceStatus {
    pub name: String,
    /// `UP` or `DOWN`.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NeighborRow {
    pub local_port: String,
    pub neighbor: String,
    pub remote_port: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RouteRow {
    pub network: String,
    pub mask: String,
    pub next_hop: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CpuSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MemorySummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_percent: Option<f64>,
}

/// One temperature, power or fan reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SensorReading {
    pub location: String,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EnvironmentSummary {
    pub cpu: CpuSummary,
    pub memory: MemorySummary,
    pub temperature: Vec<SensorReading>,
    pub power: Vec<SensorReading>,
    pub fans: Vec<SensorReading>,
}

/// Payload of a `telemetry_update` envelope. All five keys are always present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TelemetryUpdate {
    pub device_info: DeviceInfo,
    pub interfaces: Vec<InterfaceStatus>,
    pub neighbors: Vec<NeighborRow>,
    pub routing_table: Vec<RouteRow>,
    pub environment: EnvironmentSummary,
}

impl TelemetryUpdate {
    /// The fallback sent when monitoring cannot start: identity only, every
    /// other category empty.
    pub fn minimal(hostname: Option<&str>, os_version: &str) -> Self {
        let mut device_info = DeviceInfo {
            os_version: os_version.to_string(),
            ..Default::default()
        };
        if let Some(name) = hostname.map(str::trim).filter(|h| !h.is_empty()) {
            device_info.hostname = name.to_string();
        }
        Self {
            device_info,
            ..Default::default()
        }
    }
}

/// JSON schema of the `telemetry_update` payload.
pub fn telemetry_update_schema() -> schemars::Schema {
    schemars::schema_for!(TelemetryUpdate)
}

/// Formats seconds as `"{d}d {h}h {m}m"`; seconds are dropped.
pub fn format_uptime(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    format!("{}d {}h {}m", days, hours, minutes)
}

fn or_unknown(value: Option<&String>) -> String {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

pub fn normalize_facts(facts: &Facts) -> DeviceInfo {
    DeviceInfo {
        hostname: or_unknown(facts.hostname.as_ref()),
        model: or_unknown(facts.model.as_ref()),
        serial: or_unknown(facts.serial_number.as_ref()),
        os_version: or_unknown(facts.os_version.as_ref()),
        uptime: format_uptime(facts.uptime.unwrap_or(0.0)),
    }
}

pub fn normalize_interfaces(interfaces: &InterfaceMap) -> Vec<InterfaceStatus> {
    interfaces
        .iter()
        .map(|(name, detail)| InterfaceStatus {
            name: name.clone(),
            status: if detail.is_up { "UP" } else { "DOWN" }.to_string(),
        })
        .collect()
}

pub fn normalize_neighbors(neighbors: &NeighborMap) -> Vec<NeighborRow> {
    neighbors
        .iter()
        .flat_map(|(port, list)| {
            list.iter().map(move |n| NeighborRow {
                local_port: port.clone(),
                neighbor: n
                    .remote_system_name
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
                remote_port: n
                    .remote_port
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string()),
            })
        })
        .collect()
}

/// Routes keyed by prefix (`"0.0.0.0/0"`) fill in network and mask from the
/// key when the entry does not carry them.
pub fn normalize_routes(routes: &RouteMap) -> Vec<RouteRow> {
    routes
        .iter()
        .flat_map(|(prefix, entries)| {
            let (key_network, key_mask) = match prefix.split_once('/') {
                Some((net, mask)) => (net.to_string(), mask.to_string()),
                None => ("0.0.0.0".to_string(), "0".to_string()),
            };
            entries.iter().map(move |entry| RouteRow {
                network: entry
                    .destination
                    .clone()
                    .unwrap_or_else(|| key_network.clone()),
                mask: entry
                    .prefix_length
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| key_mask.clone()),
                next_hop: entry.next_hop.clone(),
            })
        })
        .collect()
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    as_f64(value).filter(|v| *v >= 0.0).map(|v| v as u64)
}

fn records(category: &Map<String, Value>) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
    category
        .iter()
        .filter_map(|(key, value)| value.as_object().map(|record| (key, record)))
}

pub fn normalize_environment(report: &EnvironmentReport) -> EnvironmentSummary {
    let usages: Vec<f64> = records(&report.cpu)
        .filter_map(|(_, cpu)| cpu.get("%usage").and_then(as_f64))
        .collect();
    let cpu = if usages.is_empty() {
        CpuSummary::default()
    } else {
        CpuSummary {
            average_usage: Some(usages.iter().sum::<f64>() / usages.len() as f64),
            num_cpus: Some(usages.len()),
        }
    };

    let memory = if report.memory.is_empty() {
        MemorySummary::default()
    } else {
        let total = report.memory.get("available_ram").and_then(as_u64).unwrap_or(0);
        let used = report.memory.get("used_ram").and_then(as_u64).unwrap_or(0);
        memory_summary(total, used)
    };

    let temperature = records(&report.temperature)
        .map(|(location, data)| SensorReading {
            location: location.clone(),
            value: data.get("temperature").cloned().unwrap_or(Value::from(0)),
            alert: Some(data.get("is_alert").and_then(Value::as_bool).unwrap_or(false)),
            critical: Some(
                data.get("is_critical")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            ),
        })
        .collect();

    let power = records(&report.power)
        .map(|(id, data)| SensorReading {
            location: id.clone(),
            value: data.get("output").cloned().unwrap_or(Value::from(0)),
            alert: Some(!data.get("status").and_then(Value::as_bool).unwrap_or(false)),
            critical: None,
        })
        .collect();

    let fans = records(&report.fans)
        .map(|(location, data)| {
            let ok = data.get("status").and_then(Value::as_bool).unwrap_or(false);
            SensorReading {
                location: location.clone(),
                value: data.get("rpm").cloned().unwrap_or(Value::Bool(ok)),
                alert: Some(!ok),
                critical: None,
            }
        })
        .collect();

    EnvironmentSummary {
        cpu,
        memory,
        temperature,
        power,
        fans,
    }
}

fn memory_summary(total: u64, used: u64) -> MemorySummary {
    MemorySummary {
        total: Some(total),
        used: Some(used),
        usage_percent: (total > 0).then(|| used as f64 / total as f64 * 100.0),
    }
}

/// User CPU percentage from the `Cpu(s)` line of `top -bn1`.
pub fn parse_top_cpu(line: &str) -> Option<f64> {
    let first = line.split(',').next()?;
    let mut words = first.split_whitespace();
    words.next()?;
    words
        .next()?
        .trim_end_matches("us")
        .trim_end_matches('%')
        .parse()
        .ok()
}

/// `(total_mb, used_mb)` from the `Mem:` row of `free -m`.
pub fn parse_free_mb(output: &str) -> Option<(u64, u64)> {
    let row = output.lines().find(|l| l.trim_start().starts_with("Mem:"))?;
    let mut cols = row.split_whitespace().skip(1);
    let total = cols.next()?.parse().ok()?;
    let used = cols.next()?.parse().ok()?;
    Some((total, used))
}

fn hostname_is_unknown(name: Option<&String>) -> bool {
    name.map(|h| h.trim().is_empty() || h.to_lowercase().contains(UNKNOWN))
        .unwrap_or(true)
}

/// Gating category: facts with the unknown-hostname fallback.
///
/// Some platforms report `unknown` until the CLI has been touched; a raw
/// `hostname` query usually fixes that. The query is best effort: if it
/// fails or still yields nothing useful the hostname stays `unknown`.
pub async fn collect_device_info(driver: &mut dyn DeviceDriver) -> Result<DeviceInfo, DriverError> {
    let mut facts = driver.get_facts().await?;
    if hostname_is_unknown(facts.hostname.as_ref()) {
        debug!("hostname unknown in facts, querying directly");
        match driver.send_command("hostname").await {
            Ok(raw) => {
                let name = raw.trim().to_string();
                if hostname_is_unknown(Some(&name)) {
                    debug!("direct hostname query gave nothing usable: {:?}", name);
                } else {
                    facts.hostname = Some(name);
                }
            }
            Err(e) => debug!("direct hostname query failed: {}", e),
        }
    }
    Ok(normalize_facts(&facts))
}

pub async fn collect_interfaces(
    driver: &mut dyn DeviceDriver,
) -> Result<Vec<InterfaceStatus>, DriverError> {
    Ok(normalize_interfaces(&driver.get_interfaces().await?))
}

pub async fn collect_neighbors(
    driver: &mut dyn DeviceDriver,
) -> Result<Vec<NeighborRow>, DriverError> {
    Ok(normalize_neighbors(&driver.get_lldp_neighbors_detail().await?))
}

pub async fn collect_routes(
    driver: &mut dyn DeviceDriver,
    destination: &str,
) -> Result<Vec<RouteRow>, DriverError> {
    Ok(normalize_routes(&driver.get_route_to(destination).await?))
}

/// Environment, falling back to `top`/`free` when the driver reports nothing.
pub async fn collect_environment(
    driver: &mut dyn DeviceDriver,
) -> Result<EnvironmentSummary, DriverError> {
    let report = driver.get_environment().await?;
    if !report.is_empty() {
        return Ok(normalize_environment(&report));
    }

    let cpu_line = match driver.send_command("top -bn1 | grep 'Cpu(s)'").await {
        Ok(out) => out,
        Err(DriverError::Unsupported(_)) => return Ok(EnvironmentSummary::default()),
        Err(e) => {
            warn!("environment fallback failed: {}", e);
            return Ok(EnvironmentSummary::default());
        }
    };
    let free = driver.send_command("free -m").await.unwrap_or_default();
    Ok(shell_environment(&cpu_line, &free))
}

/// Environment summary from raw `top` and `free -m` output.
pub fn shell_environment(cpu_line: &str, free: &str) -> EnvironmentSummary {
    let mut summary = EnvironmentSummary {
        cpu: CpuSummary {
            average_usage: Some(parse_top_cpu(cpu_line.trim()).unwrap_or(0.0)),
            num_cpus: Some(1),
        },
        ..Default::default()
    };
    if let Some((total_mb, used_mb)) = parse_free_mb(free) {
        summary.memory = memory_summary(
            total_mb.saturating_mul(1024 * 1024),
            used_mb.saturating_mul(1024 * 1024),
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{InterfaceDetail, LldpNeighbor, RouteEntry};
    use serde_json::json;

    #[test]
    fn uptime_format_drops_seconds() {
        assert_eq!(format_uptime(3661.0), "0d 1h 1m");
        assert_eq!(format_uptime(90_061.9), "1d 1h 1m");
        assert_eq!(format_uptime(-5.0), "0d 0h 0m");
    }

    #[test]
    fn facts_fill_missing_fields_with_unknown() {
        let info = normalize_facts(&Facts {
            hostname: Some("sw1".to_string()),
            model: Some("  ".to_string()),
            ..Default::default()
        });
        assert_eq!(info.hostname, "sw1");
        assert_eq!(info.model, "unknown");
        assert_eq!(info.serial, "unknown");
        assert_eq!(info.uptime, "0d 0h 0m");
    }

    #[test]
    fn interface_status_is_up_or_down() {
        let mut map = InterfaceMap::new();
        map.insert(
            "Gi0/1".to_string(),
            InterfaceDetail {
                is_up: true,
                ..Default::default()
            },
        );
        map.insert("Gi0/2".to_string(), InterfaceDetail::default());

        let rows = normalize_interfaces(&map);
        assert_eq!(rows[0].status, "UP");
        assert_eq!(rows[1].status, "DOWN");
    }

    #[test]
    fn neighbors_default_to_unknown() {
        let mut map = NeighborMap::new();
        map.insert(
            "Gi0/1".to_string(),
            vec![
                LldpNeighbor {
                    remote_system_name: Some("core".to_string()),
                    remote_port: Some("Eth1".to_string()),
                },
                LldpNeighbor::default(),
            ],
        );
        let rows = normalize_neighbors(&map);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].neighbor, "core");
        assert_eq!(rows[1].neighbor, "Unknown");
        assert_eq!(rows[1].remote_port, "Unknown");
    }

    #[test]
    fn routes_fall_back_to_table_prefix() {
        let mut map = RouteMap::new();
        map.insert(
            "10.0.0.0/8".to_string(),
            vec![
                RouteEntry {
                    next_hop: "192.0.2.1".to_string(),
                    ..Default::default()
                },
                RouteEntry {
                    destination: Some("10.1.0.0".to_string()),
                    prefix_length: Some(16),
                    next_hop: "192.0.2.2".to_string(),
                    ..Default::default()
                },
            ],
        );
        let rows = normalize_routes(&map);
        assert_eq!(rows[0].network, "10.0.0.0");
        assert_eq!(rows[0].mask, "8");
        assert_eq!(rows[1].network, "10.1.0.0");
        assert_eq!(rows[1].mask, "16");
    }

    #[test]
    fn environment_tolerates_partial_records() {
        let report: EnvironmentReport = serde_json::from_value(json!({
            "cpu": {"0": {"%usage": 10.0}, "1": {"%usage": "30"}, "2": {"idle": 1}, "3": "junk"},
            "memory": {"available_ram": 1000, "used_ram": 250},
            "temperature": {"inlet": {"temperature": 31.5, "is_alert": true}, "bad": 5},
            "power": {"PSU1": {"status": true, "output": 120}},
            "fans": {"FAN1": {"status": false}}
        }))
        .expect("report");

        let env = normalize_environment(&report);
        assert_eq!(env.cpu.average_usage, Some(20.0));
        assert_eq!(env.cpu.num_cpus, Some(2));
        assert_eq!(env.memory.usage_percent, Some(25.0));
        assert_eq!(env.temperature.len(), 1);
        assert_eq!(env.temperature[0].alert, Some(true));
        assert_eq!(env.temperature[0].critical, Some(false));
        assert_eq!(env.power[0].value, json!(120));
        assert_eq!(env.power[0].alert, Some(false));
        assert_eq!(env.fans[0].alert, Some(true));
    }

    #[test]
    fn empty_environment_serializes_with_empty_lists() {
        let value = serde_json::to_value(EnvironmentSummary::default()).expect("json");
        assert_eq!(
            value,
            json!({"cpu": {}, "memory": {}, "temperature": [], "power": [], "fans": []})
        );
    }

    #[test]
    fn top_and_free_parsers() {
        let top = "%Cpu(s):  3.1 us,  1.0 sy,  0.0 ni, 95.8 id,  0.0 wa";
        assert_eq!(parse_top_cpu(top), Some(3.1));
        assert_eq!(parse_top_cpu("Cpu(s): 12.5%us,  2.0%sy"), Some(12.5));

        let free = "               total        used        free      shared  buff/cache   available\n\
                    Mem:            7851        2143        3020         210        2688        5200\n\
                    Swap:           2047           0        2047\n";
        assert_eq!(parse_free_mb(free), Some((7851, 2143)));
        assert_eq!(parse_free_mb("nothing"), None);
    }

    #[test]
    fn shell_environment_saturates_absurd_memory() {
        let free = "Mem: 99999999999999999999 1\n";
        assert_eq!(parse_free_mb(free), None);

        let free = format!("Mem: {} {}\n", u64::MAX / 2, u64::MAX);
        let env = shell_environment("garbage", &free);
        assert_eq!(env.cpu.average_usage, Some(0.0));
        assert_eq!(env.memory.total, Some(u64::MAX));
        assert_eq!(env.memory.used, Some(u64::MAX));
        assert_eq!(env.memory.usage_percent, Some(100.0));
    }

    #[test]
    fn minimal_update_keeps_every_category() {
        let update = TelemetryUpdate::minimal(Some(" edge1 \n"), "linux");
        assert_eq!(update.device_info.hostname, "edge1");
        assert_eq!(update.device_info.os_version, "linux");
        assert_eq!(update.device_info.uptime, "unknown");

        let value = serde_json::to_value(&update).expect("json");
        for key in [
            "device_info",
            "interfaces",
            "neighbors",
            "routing_table",
            "environment",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(
            TelemetryUpdate::minimal(None, "eos").device_info.hostname,
            "unknown"
        );
    }
}
