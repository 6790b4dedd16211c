//! The presence record: a TTL-bounded per-node document in the nodes
//! namespace. A node is considered alive iff its record exists.
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use codec::Value;
use sysinfo::{Pid, System};

/// Presence record TTL. The broker expires the key if the heartbeat stops.
pub const PRESENCE_TTL: Duration = Duration::from_secs(10);
/// Heartbeat period: well under the TTL so a node never lapses under
/// normal scheduling jitter.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub time_registered: f64,
    pub time_modified: f64,
    pub runtime_version: String,
    pub subscriptions: Vec<String>,
    pub publishers: HashMap<String, f64>,
    pub services: HashMap<String, String>,
    pub ps: ProcessStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessStats {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_rss: u64,
    pub platform: String,
    pub language: String,
}

impl ProcessStats {
    /// Samples the current process's pid/cpu/memory on a best-effort
    /// basis: if the platform doesn't expose this information the
    /// numeric fields default to zero rather than failing registration.
    pub fn sample() -> Self {
        let pid = std::process::id();
        let mut system = System::new();
        system.refresh_all();

        let (cpu_percent, memory_rss) = match system.process(Pid::from_u32(pid)) {
            Some(process) => (process.cpu_usage() as f64, process.memory()),
            None => (0.0, 0),
        };

        ProcessStats {
            pid,
            cpu_percent,
            memory_rss,
            platform: std::env::consts::OS.to_string(),
            language: "rust".to_string(),
        }
    }
}

pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl PresenceRecord {
    pub fn new(runtime_version: &str) -> Self {
        let now = now_epoch_secs();
        PresenceRecord {
            time_registered: now,
            time_modified: now,
            runtime_version: runtime_version.to_string(),
            subscriptions: Vec::new(),
            publishers: HashMap::new(),
            services: HashMap::new(),
            ps: ProcessStats::sample(),
        }
    }

    pub fn touch(&mut self) {
        self.time_modified = now_epoch_secs();
    }

    pub fn to_value(&self) -> Value {
        let mut map = HashMap::new();
        map.insert("time_registered".to_string(), Value::Float(self.time_registered));
        map.insert("time_modified".to_string(), Value::Float(self.time_modified));
        map.insert(
            "runtime_version".to_string(),
            Value::Str(self.runtime_version.clone()),
        );
        map.insert(
            "subscriptions".to_string(),
            Value::Seq(self.subscriptions.iter().cloned().map(Value::Str).collect()),
        );
        map.insert(
            "publishers".to_string(),
            Value::Map(
                self.publishers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Float(*v)))
                    .collect(),
            ),
        );
        map.insert(
            "services".to_string(),
            Value::Map(
                self.services
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
                    .collect(),
            ),
        );

        let mut ps = HashMap::new();
        ps.insert("pid".to_string(), Value::UInt(self.ps.pid as u64));
        ps.insert("cpu_percent".to_string(), Value::Float(self.ps.cpu_percent));
        ps.insert("memory_rss".to_string(), Value::UInt(self.ps.memory_rss));
        ps.insert("platform".to_string(), Value::Str(self.ps.platform.clone()));
        ps.insert("language".to_string(), Value::Str(self.ps.language.clone()));
        map.insert("ps".to_string(), Value::Map(ps));

        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_map()?;
        let time_registered = map.get("time_registered").and_then(float_of)?;
        let time_modified = map.get("time_modified").and_then(float_of)?;
        let runtime_version = map.get("runtime_version").and_then(Value::as_str)?.to_string();

        let subscriptions = map
            .get("subscriptions")
            .and_then(Value::as_seq)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();

        let publishers = map
            .get("publishers")
            .and_then(Value::as_map)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| float_of(v).map(|f| (k.clone(), f)))
                    .collect()
            })
            .unwrap_or_default();

        let services = map
            .get("services")
            .and_then(Value::as_map)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let ps = map
            .get("ps")
            .and_then(Value::as_map)
            .map(|m| ProcessStats {
                pid: m.get("pid").and_then(Value::as_int).unwrap_or(0) as u32,
                cpu_percent: m.get("cpu_percent").and_then(float_of).unwrap_or(0.0),
                memory_rss: m.get("memory_rss").and_then(Value::as_int).unwrap_or(0) as u64,
                platform: m
                    .get("platform")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                language: m
                    .get("language")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            })
            .unwrap_or(ProcessStats {
                pid: 0,
                cpu_percent: 0.0,
                memory_rss: 0,
                platform: "unknown".to_string(),
                language: "unknown".to_string(),
            });

        Some(PresenceRecord {
            time_registered,
            time_modified,
            runtime_version,
            subscriptions,
            publishers,
            services,
            ps,
        })
    }
}

fn float_of(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::UInt(u) => Some(*u as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_value() {
        let mut record = PresenceRecord::new("0.1.0");
        record.subscriptions.push("pytest_test_topic".to_string());
        record.services.insert("example_service".to_string(), "srv://abc".to_string());

        let value = record.to_value();
        let parsed = PresenceRecord::from_value(&value).unwrap();

        assert_eq!(parsed.runtime_version, "0.1.0");
        assert_eq!(parsed.subscriptions, vec!["pytest_test_topic".to_string()]);
        assert_eq!(parsed.services.get("example_service").unwrap(), "srv://abc");
    }
}
