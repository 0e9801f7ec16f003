use crate::{
    cli::{Options, RunOptions},
    collector::{PrometheusTelemetry, QueryTemplates},
    error::CliError,
};
use faultline_engine::{StaticTelemetry, Telemetry};
use serde::Deserialize;
use std::{path::Path, sync::Arc};
use tracing::info;
use tracing_subscriber::{EnvFilter, filter::Directive, fmt};

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    // A second initialization (tests) keeps the first subscriber.
    let _ = fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Default, Deserialize)]
struct QueriesWrapper {
    #[serde(default)]
    queries: QueryTemplates,
}

/// Loads the `[queries]` table of the config file, defaults without one.
pub fn load_queries(path: Option<&Path>) -> Result<QueryTemplates, CliError> {
    let Some(path) = path else {
        return Ok(QueryTemplates::default());
    };
    let contents = std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let wrapper: QueriesWrapper = toml::from_str(&contents)?;
    Ok(wrapper.queries)
}

/// Fixtures win over Prometheus; with neither, every probe finds no data.
pub fn init_telemetry(opts: &RunOptions) -> Result<Arc<dyn Telemetry>, CliError> {
    if let Some(fixtures) = &opts.fixtures {
        info!(path = %fixtures.display(), "Using telemetry fixtures");
        return Ok(Arc::new(StaticTelemetry::from_path(fixtures)?));
    }

    if let Some(url) = &opts.prometheus_url {
        info!(url, "Using Prometheus telemetry");
        let queries = load_queries(opts.config.as_deref())?;
        let telemetry = PrometheusTelemetry::new(url.clone())
            .with_queries(queries)
            .with_request_timeout(std::time::Duration::from_secs(opts.request_timeout))?;
        return Ok(Arc::new(telemetry));
    }

    info!("No telemetry source configured, diagnoses will be empty");
    Ok(Arc::new(StaticTelemetry::new()))
}
