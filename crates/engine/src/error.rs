use crate::{config::ConfigError, telemetry::TelemetryError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed candidate key: {0}")]
    MalformedCandidateKey(String),
    #[error("invalid time range {raw:?}: {reason}")]
    InvalidTimeRange { raw: String, reason: String },
    #[error("unknown alarm rule: {0}")]
    UnknownAlarmRule(String),
    #[error("invalid utc offset: {0} hours")]
    InvalidOffset(i32),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
}
