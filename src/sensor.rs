//! Sensor values derived from Proxmox API data.
//!
//! Every poll turns the fetched records into a flat list of [`Sensor`]s. A
//! sensor whose source call failed carries [`Reading::Unavailable`] with the
//! reason, so a permission problem on one endpoint does not hide the values
//! of the others.

use crate::client::{DatastoreUsage, GuestSummary, NodeStatus};
use crate::error::{ProxmoxError, Result};
use crate::task::{count_failed_last_24h, count_running, TaskListDiagnostics, TaskRecord};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Bytes per GiB (IEC).
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Unit of measurement of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "GiB")]
    Gibibytes,
    #[serde(rename = "s")]
    Seconds,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Percent => "%",
            Unit::Gibibytes => "GiB",
            Unit::Seconds => "s",
        }
    }
}

/// How consumers should treat successive values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Why a sensor has no value this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailability {
    /// HTTP 403: missing audit permission for the user or the token
    Forbidden,
    /// HTTP 401: token rejected
    Unauthorized,
    /// Network error, timeout, unexpected status or unparseable body
    Unreachable,
    /// No PVE node could be determined
    NodeUnresolved,
    /// The call succeeded but did not include the field
    NotReported,
}

impl Unavailability {
    pub fn as_str(self) -> &'static str {
        match self {
            Unavailability::Forbidden => "forbidden",
            Unavailability::Unauthorized => "unauthorized",
            Unavailability::Unreachable => "unreachable",
            Unavailability::NodeUnresolved => "node_unresolved",
            Unavailability::NotReported => "not_reported",
        }
    }
}

impl From<&ProxmoxError> for Unavailability {
    fn from(error: &ProxmoxError) -> Self {
        if error.is_forbidden() {
            return Unavailability::Forbidden;
        }
        match error {
            ProxmoxError::Auth(_) => Unavailability::Unauthorized,
            ProxmoxError::NodeResolution(_) => Unavailability::NodeUnresolved,
            _ => Unavailability::Unreachable,
        }
    }
}

/// Outcome of one API call as seen by sensor derivation.
pub type Fetched<T> = std::result::Result<T, Unavailability>;

/// Convert a client result, keeping only the reason of a failure.
pub fn fetched<T>(result: Result<T>) -> Fetched<T> {
    result.map_err(|e| Unavailability::from(&e))
}

/// Current value of a sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Reading {
    Value(f64),
    Text(String),
    Unavailable(Unavailability),
}

impl Reading {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn unavailability(&self) -> Option<Unavailability> {
        match self {
            Reading::Unavailable(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// A named sensor value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub key: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<StateClass>,
    pub reading: Reading,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Sensor {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            unit: None,
            state_class: None,
            reading: Reading::Unavailable(Unavailability::NotReported),
            attributes: BTreeMap::new(),
        }
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn measurement(mut self) -> Self {
        self.state_class = Some(StateClass::Measurement);
        self
    }

    pub fn total_increasing(mut self) -> Self {
        self.state_class = Some(StateClass::TotalIncreasing);
        self
    }

    pub fn reading(mut self, reading: Reading) -> Self {
        self.reading = reading;
        self
    }

    /// Merge the fields of a serializable struct into the attributes.
    pub fn attributes_from<T: Serialize>(mut self, attributes: &T) -> Self {
        if let Ok(Value::Object(map)) = serde_json::to_value(attributes) {
            self.attributes.extend(map);
        }
        self
    }
}

/// Round half away from zero to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Convert bytes to GiB, rounded to one decimal.
///
/// # Examples
///
/// ```
/// use proxmox_suite::sensor::bytes_to_gib;
///
/// assert_eq!(bytes_to_gib(2 * 1024 * 1024 * 1024), 2.0);
/// ```
pub fn bytes_to_gib(bytes: u64) -> f64 {
    round_to(bytes as f64 / GIB, 1)
}

/// `used / total * 100`, rounded to two decimals. A zero total yields 0.
pub fn usage_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to(used as f64 / total as f64 * 100.0, 2)
}

/// Proxmox reports CPU as a 0..1 fraction; larger values are taken as percent.
pub fn cpu_to_percent(cpu: f64) -> f64 {
    if cpu <= 1.0 {
        round_to(cpu * 100.0, 1)
    } else {
        round_to(cpu, 1)
    }
}

/// Human-readable uptime, e.g. `"5 days 3 h 12 min"`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = seconds % 86_400 / 3600;
    let minutes = seconds % 3600 / 60;

    let mut parts = Vec::new();
    match days {
        0 => {}
        1 => parts.push("1 day".to_string()),
        n => parts.push(format!("{} days", n)),
    }
    if hours > 0 {
        parts.push(format!("{} h", hours));
    }
    if minutes > 0 || parts.is_empty() {
        parts.push(format!("{} min", minutes));
    }
    parts.join(" ")
}

fn value_of<T>(source: &Fetched<T>, derive: impl FnOnce(&T) -> Option<f64>) -> Reading {
    match source {
        Ok(data) => derive(data)
            .map(Reading::Value)
            .unwrap_or(Reading::Unavailable(Unavailability::NotReported)),
        Err(reason) => Reading::Unavailable(*reason),
    }
}

fn text_of<T>(source: &Fetched<T>, derive: impl FnOnce(&T) -> Option<String>) -> Reading {
    match source {
        Ok(data) => derive(data)
            .map(Reading::Text)
            .unwrap_or(Reading::Unavailable(Unavailability::NotReported)),
        Err(reason) => Reading::Unavailable(*reason),
    }
}

/// CPU, memory, load and uptime sensors from a node status call.
pub fn host_sensors(status: &Fetched<NodeStatus>) -> Vec<Sensor> {
    vec![
        Sensor::new("cpu_percent", "CPU Usage")
            .unit(Unit::Percent)
            .measurement()
            .reading(value_of(status, |s| s.cpu.map(cpu_to_percent))),
        Sensor::new("mem_percent", "Memory Usage")
            .unit(Unit::Percent)
            .measurement()
            .reading(value_of(status, |s| {
                s.memory.as_ref().map(|m| usage_percent(m.used, m.total))
            })),
        Sensor::new("mem_used_gib", "Memory Used")
            .unit(Unit::Gibibytes)
            .measurement()
            .reading(value_of(status, |s| {
                s.memory.as_ref().map(|m| bytes_to_gib(m.used))
            })),
        Sensor::new("mem_total_gib", "Memory Total")
            .unit(Unit::Gibibytes)
            .measurement()
            .reading(value_of(status, |s| {
                s.memory.as_ref().map(|m| bytes_to_gib(m.total))
            })),
        Sensor::new("load_1m", "Load (1m)")
            .measurement()
            .reading(value_of(status, |s| {
                s.loadavg
                    .as_ref()
                    .and_then(|load| load.first())
                    .map(|load| round_to(*load, 2))
            })),
        Sensor::new("uptime", "Uptime")
            .unit(Unit::Seconds)
            .total_increasing()
            .reading(value_of(status, |s| s.uptime.map(|u| u as f64))),
        Sensor::new("uptime_text", "Uptime (readable)")
            .reading(text_of(status, |s| s.uptime.map(format_uptime))),
    ]
}

/// Running/total counts for VMs and containers.
pub fn guest_sensors(
    vms: &Fetched<Vec<GuestSummary>>,
    containers: &Fetched<Vec<GuestSummary>>,
) -> Vec<Sensor> {
    fn running(guests: &[GuestSummary]) -> Option<f64> {
        Some(guests.iter().filter(|g| g.is_running()).count() as f64)
    }
    fn total(guests: &[GuestSummary]) -> Option<f64> {
        Some(guests.len() as f64)
    }

    vec![
        Sensor::new("vms_running", "VMs Running").reading(value_of(vms, |g| running(g))),
        Sensor::new("vms_total", "VMs Total").reading(value_of(vms, |g| total(g))),
        Sensor::new("lxcs_running", "LXCs Running").reading(value_of(containers, |g| running(g))),
        Sensor::new("lxcs_total", "LXCs Total").reading(value_of(containers, |g| total(g))),
    ]
}

/// Running-task and failed-task sensors.
///
/// `recent` is the unfiltered history, `running` the filtered running list of
/// the same cycle.
pub fn task_sensors(
    recent: &Fetched<Vec<TaskRecord>>,
    running: &Fetched<Vec<TaskRecord>>,
    now: i64,
) -> Vec<Sensor> {
    let running_set: &[TaskRecord] = running.as_ref().map(Vec::as_slice).unwrap_or(&[]);

    let mut running_tasks = Sensor::new("running_tasks", "Running Tasks")
        .reading(value_of(running, |tasks| Some(count_running(tasks) as f64)));
    if let Ok(tasks) = running {
        running_tasks = running_tasks.attributes_from(&TaskListDiagnostics::from_tasks(tasks));
    }

    let mut failed_tasks = Sensor::new("failed_tasks_24h", "Failed Tasks (24h)").reading(
        value_of(recent, |tasks| {
            Some(count_failed_last_24h(tasks, running_set, now) as f64)
        }),
    );
    if let Ok(tasks) = recent {
        failed_tasks = failed_tasks.attributes_from(&TaskListDiagnostics::from_tasks(tasks));
    }

    vec![running_tasks, failed_tasks]
}

/// Free/used/total/usage sensors for every datastore.
///
/// When the datastore call failed, the stores in `known` are reported as
/// unavailable.
pub fn datastore_sensors(
    datastores: &Fetched<Vec<DatastoreUsage>>,
    known: &BTreeSet<String>,
) -> Vec<Sensor> {
    match datastores {
        Ok(list) => list
            .iter()
            .flat_map(|ds| {
                let source: Fetched<&DatastoreUsage> = Ok(ds);
                datastore_group(&ds.store, &source)
            })
            .collect(),
        Err(reason) => known
            .iter()
            .flat_map(|store| datastore_group(store, &Err(*reason)))
            .collect(),
    }
}

fn datastore_group(store: &str, ds: &Fetched<&DatastoreUsage>) -> Vec<Sensor> {
    let prefix = format!("Datastore {}", store);
    vec![
        Sensor::new(format!("ds:{}:free_gib", store), format!("{} Free", prefix))
            .unit(Unit::Gibibytes)
            .measurement()
            .reading(value_of(ds, |d| d.avail.map(bytes_to_gib))),
        Sensor::new(format!("ds:{}:used_gib", store), format!("{} Used", prefix))
            .unit(Unit::Gibibytes)
            .measurement()
            .reading(value_of(ds, |d| d.used.map(bytes_to_gib))),
        Sensor::new(format!("ds:{}:total_gib", store), format!("{} Total", prefix))
            .unit(Unit::Gibibytes)
            .measurement()
            .reading(value_of(ds, |d| d.total.map(bytes_to_gib))),
        Sensor::new(format!("ds:{}:usage_percent", store), format!("{} Usage", prefix))
            .unit(Unit::Percent)
            .measurement()
            .reading(value_of(ds, |d| match (d.used, d.total) {
                (Some(used), Some(total)) => Some(usage_percent(used, total)),
                _ => None,
            })),
    ]
}
