//! TOML configuration for the engine.
//!
//! Every section defaults to the values the engine was tuned with, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [faultline.probe]
//! max_parallel_probes = 4
//! cpu_floor = 35.0
//!
//! [[faultline.probe.exemptions]]
//! service = "email"
//! skip = ["memory", "latency"]
//! ```

use crate::{
    classifier::ClassifierProfile,
    models::Category,
    ramp::{EdgeLimits, RampParams},
    topology::{CallEdge, Topology, default_denylist, default_edges},
};
use chrono::{Duration, FixedOffset};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultlineConfig {
    pub window: WindowConfig,
    pub classifier: ClassifierConfig,
    pub ramp: RampConfig,
    pub probe: ProbeConfig,
    pub arbiter: ArbiterConfig,
    pub topology: TopologyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Seconds queried before the alarm start (default: 600)
    pub lead_secs: i64,
    /// Seconds queried after the alarm end (default: 600)
    pub tail_secs: i64,
    /// Outward shift of the boundaries for log aggregates (default: 60)
    pub log_margin_secs: i64,
    /// Offset of the timestamps in problem files (default: 8)
    pub utc_offset_hours: i32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lead_secs: 600,
            tail_secs: 600,
            log_margin_secs: 60,
            utc_offset_hours: 8,
        }
    }
}

impl WindowConfig {
    pub fn lead(&self) -> Duration {
        Duration::seconds(self.lead_secs)
    }

    pub fn tail(&self) -> Duration {
        Duration::seconds(self.tail_secs)
    }

    pub fn log_margin(&self) -> Duration {
        Duration::seconds(self.log_margin_secs)
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_hours.checked_mul(3600)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub utilization: ClassifierProfile,
    pub saturation: ClassifierProfile,
    pub count: ClassifierProfile,
    /// Latency must exceed each neighbour by this factor (default: 1.5)
    pub latency_ratio: f64,
    /// Latency/CPU drop factor for the OOM signature (default: 1.5)
    pub drop_ratio: f64,
    /// Error-rate rise factor (default: 1.5)
    pub error_ratio: f64,
    /// gRPC unavailable span rise factor (default: 1.5)
    pub span_error_ratio: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            utilization: ClassifierProfile::utilization(),
            saturation: ClassifierProfile::saturation(),
            count: ClassifierProfile::count(),
            latency_ratio: 1.5,
            drop_ratio: 1.5,
            error_ratio: 1.5,
            span_error_ratio: 1.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RampConfig {
    pub params: RampParams,
    pub edges: EdgeLimits,
}

/// Probe kinds that can be switched off per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Cpu,
    Memory,
    Latency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalExemption {
    pub service: String,
    pub skip: Vec<ProbeKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Concurrent per-service probe tasks (default: 8)
    pub max_parallel_probes: usize,
    /// Per-service probe timeout in seconds (default: 30)
    pub probe_timeout_secs: u64,
    /// Pod CPU peak needed for a cpu candidate (default: 30.0)
    pub cpu_floor: f64,
    /// Pod memory peak needed under latency alarms (default: 25.0)
    pub memory_floor: f64,
    /// Pod memory peak needed under grey-failure alarms (default: 15.0)
    pub grey_memory_floor: f64,
    /// Host cpu/memory/disk peak needed (default: 30.0)
    pub host_floor: f64,
    /// Error rate per minute needed for a Failure candidate (default: 2.0)
    pub error_rate_floor: f64,
    /// Anomalous TCP counters needed for networkLoss (default: 2)
    pub network_loss_min_signals: usize,
    /// Services that skip some probes (default: email skips memory and latency)
    pub exemptions: Vec<SignalExemption>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_parallel_probes: 8,
            probe_timeout_secs: 30,
            cpu_floor: 30.0,
            memory_floor: 25.0,
            grey_memory_floor: 15.0,
            host_floor: 30.0,
            error_rate_floor: 2.0,
            network_loss_min_signals: 2,
            exemptions: vec![SignalExemption {
                service: "email".to_owned(),
                skip: vec![ProbeKind::Memory, ProbeKind::Latency],
            }],
        }
    }
}

impl ProbeConfig {
    pub fn is_exempt(&self, service: &str, kind: ProbeKind) -> bool {
        self.exemptions
            .iter()
            .any(|exemption| exemption.service == service && exemption.skip.contains(&kind))
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Rank of each category when a service or a problem has several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryPriorities {
    pub memory: u8,
    pub cpu: u8,
    pub jvm_chaos: u8,
    pub disk: u8,
    pub pod_killer: u8,
    pub network_latency: u8,
    pub network_loss: u8,
    pub failure: u8,
}

impl Default for CategoryPriorities {
    fn default() -> Self {
        Self {
            memory: 4,
            cpu: 3,
            jvm_chaos: 2,
            disk: 2,
            pod_killer: 2,
            network_latency: 1,
            network_loss: 1,
            failure: 1,
        }
    }
}

impl CategoryPriorities {
    pub fn of(&self, category: Category) -> u8 {
        match category {
            Category::Memory => self.memory,
            Category::Cpu => self.cpu,
            Category::JvmChaos => self.jvm_chaos,
            Category::Disk => self.disk,
            Category::PodKiller => self.pod_killer,
            Category::NetworkLatency => self.network_latency,
            Category::NetworkLoss => self.network_loss,
            Category::Failure => self.failure,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub priorities: CategoryPriorities,
    /// Service whose results always become jvmChaos (default: inventory)
    pub jvm_service: String,
    /// Service whose gRPC unavailable spans turn cpu into networkLatency (default: currency)
    pub grpc_service: String,
    /// Entry service whose latency verdict is trusted over its callees (default: frontend)
    pub frontend_service: String,
    /// Services whose lone latency verdict is re-checked on their callees
    /// (default: frontend, checkout)
    pub expansion_services: Vec<String>,
    /// Confirmed callees at which the caller's verdict stands (default: 3)
    pub expansion_min_confirmations: usize,
    /// Service watched for the OOM latency/CPU drop signature (default: email)
    pub oom_service: String,
    /// Services checked for killed pods under grey failures
    /// (default: checkout, frontend, product-catalog)
    pub pod_kill_services: Vec<String>,
    /// Killed hosts above which it is an outage, not a pod kill (default: 2)
    pub pod_kill_max_killed: usize,
    /// Hosts needed before a pod kill is believable (default: 3)
    pub pod_kill_min_hosts: usize,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            priorities: CategoryPriorities::default(),
            jvm_service: "inventory".to_owned(),
            grpc_service: "currency".to_owned(),
            frontend_service: "frontend".to_owned(),
            expansion_services: vec!["frontend".to_owned(), "checkout".to_owned()],
            expansion_min_confirmations: 3,
            oom_service: "email".to_owned(),
            pod_kill_services: vec![
                "checkout".to_owned(),
                "frontend".to_owned(),
                "product-catalog".to_owned(),
            ],
            pod_kill_max_killed: 2,
            pod_kill_min_hosts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub edges: Vec<CallEdge>,
    pub denylist: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            edges: default_edges(),
            denylist: default_denylist(),
        }
    }
}

impl TopologyConfig {
    pub fn build(&self) -> Topology {
        Topology::new(&self.edges, &self.denylist)
    }
}

impl FaultlineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.window.lead_secs <= 0 || self.window.tail_secs <= 0 {
            return invalid("window.lead_secs and window.tail_secs must be > 0".to_owned());
        }
        if self.window.log_margin_secs < 0 {
            return invalid(format!(
                "window.log_margin_secs must be non-negative, got {}",
                self.window.log_margin_secs
            ));
        }
        if self.window.offset().is_none() {
            return invalid(format!(
                "window.utc_offset_hours out of range: {}",
                self.window.utc_offset_hours
            ));
        }

        let profiles = [
            ("utilization", &self.classifier.utilization),
            ("saturation", &self.classifier.saturation),
            ("count", &self.classifier.count),
        ];
        for (name, profile) in profiles {
            if profile.ratio <= 1.0 || profile.tightened_ratio <= 1.0 {
                return invalid(format!("classifier.{name} ratios must be > 1.0"));
            }
            if profile.absolute_floor.is_some_and(|floor| floor < 0.0) {
                return invalid(format!("classifier.{name}.absolute_floor must be non-negative"));
            }
        }
        let ratios = [
            ("latency_ratio", self.classifier.latency_ratio),
            ("drop_ratio", self.classifier.drop_ratio),
            ("error_ratio", self.classifier.error_ratio),
            ("span_error_ratio", self.classifier.span_error_ratio),
        ];
        for (name, ratio) in ratios {
            if ratio <= 1.0 {
                return invalid(format!("classifier.{name} must be > 1.0, got {ratio}"));
            }
        }

        if self.ramp.params.baseline_window == 0 || self.ramp.params.consecutive == 0 {
            return invalid("ramp.params windows must be > 0".to_owned());
        }

        if self.probe.max_parallel_probes == 0 {
            return invalid("probe.max_parallel_probes must be > 0".to_owned());
        }
        if self.probe.probe_timeout_secs == 0 {
            return invalid("probe.probe_timeout_secs must be > 0".to_owned());
        }
        let floors = [
            ("cpu_floor", self.probe.cpu_floor),
            ("memory_floor", self.probe.memory_floor),
            ("grey_memory_floor", self.probe.grey_memory_floor),
            ("host_floor", self.probe.host_floor),
            ("error_rate_floor", self.probe.error_rate_floor),
        ];
        for (name, floor) in floors {
            if floor < 0.0 {
                return invalid(format!("probe.{name} must be non-negative, got {floor}"));
            }
        }
        if self.probe.network_loss_min_signals == 0 {
            return invalid("probe.network_loss_min_signals must be > 0".to_owned());
        }

        if self.arbiter.expansion_min_confirmations == 0 {
            return invalid("arbiter.expansion_min_confirmations must be > 0".to_owned());
        }
        Ok(())
    }
}

/// Loads `[faultline]` from `path`, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<FaultlineConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(FaultlineConfig::default());
    };

    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let wrapper: TomlWrapper = toml::from_str(&contents)?;
    let config = wrapper.faultline.unwrap_or_default();
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Deserialize)]
struct TomlWrapper {
    faultline: Option<FaultlineConfig>,
}
