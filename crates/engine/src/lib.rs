//! Root-cause localization for microservice alarms.
//!
//! Given a [`Problem`] (alarm window, candidate services, alarm rule), the
//! [`Investigator`] probes every candidate over pod, host and span signals
//! through a [`Telemetry`] backend, then the [`arbiter`] reduces the findings
//! to the most likely `service.category` root causes.

pub mod arbiter;
pub mod candidates;
pub mod classifier;
pub mod config;
pub mod error;
pub mod evidence;
pub mod investigator;
pub mod models;
pub mod probe;
pub mod ramp;
pub mod resolver;
pub mod telemetry;
pub mod topology;
pub mod window;

#[cfg(test)]
mod testing;

pub use config::{FaultlineConfig, load_config};
pub use error::EngineError;
pub use investigator::Investigator;
pub use models::{AlarmRule, CandidateKey, Category, Diagnosis, Problem};
pub use resolver::{AmbiguityResolver, HighestScore, KeepAll};
pub use telemetry::{LogQuery, QueryRange, Signal, StaticTelemetry, Telemetry, TelemetryError};
