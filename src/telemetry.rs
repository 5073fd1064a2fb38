//! Process telemetry bootstrap for searchdispatch binaries.
//!
//! Installs a JSON `tracing` subscriber and the OpenTelemetry tracer and
//! meter providers the dispatch instruments record into. Everything is read
//! from the environment:
//!
//! - `SEARCHDISPATCH_LOG`: `tracing` filter directives, e.g. `info,searchdispatch=debug`
//! - `SEARCHDISPATCH_TELEMETRY_ENABLED`: set to false to skip the OTel providers
//! - `OTEL_SERVICE_NAME`, `OTEL_RESOURCE_ATTRIBUTES`
//! - `OTEL_TRACES_SAMPLER`, `OTEL_TRACES_SAMPLER_ARG`

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "SEARCHDISPATCH_LOG";
const ENABLED_ENV: &str = "SEARCHDISPATCH_TELEMETRY_ENABLED";

/// Telemetry settings parsed from the environment
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_filter: String,
    pub otel_enabled: bool,
    pub traces_sampler: String,
    pub resource_attributes: Vec<KeyValue>,
    sampler: Sampler,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str, default_log_filter: &str) -> Result<Self> {
        let service_name = std::env::var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string())
            .trim()
            .to_string();
        if service_name.is_empty() {
            return Err(Error::Config("OTEL_SERVICE_NAME cannot be empty".to_string()));
        }

        let log_filter = std::env::var(LOG_FILTER_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_log_filter.to_string());

        let otel_enabled = parse_optional_bool(ENABLED_ENV)?.unwrap_or(true);

        let traces_sampler = std::env::var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|_| "parentbased_always_on".to_string());
        let sampler_arg = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = parse_sampler(&traces_sampler, sampler_arg.as_deref())?;

        let mut attributes: BTreeMap<String, String> = match std::env::var("OTEL_RESOURCE_ATTRIBUTES") {
            Ok(raw) => parse_resource_attributes(&raw)?.into_iter().collect(),
            Err(_) => BTreeMap::new(),
        };
        attributes.insert("service.name".to_string(), service_name.clone());
        attributes
            .entry("service.namespace".to_string())
            .or_insert_with(|| "searchdispatch".to_string());

        Ok(Self {
            service_name,
            log_filter,
            otel_enabled,
            traces_sampler,
            resource_attributes: attributes
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
            sampler,
        })
    }
}

/// Keeps the OTel providers alive for the life of the process.
pub struct Telemetry {
    config: TelemetryConfig,
    providers: Option<(TracerProvider, SdkMeterProvider)>,
}

impl Telemetry {
    pub fn init(default_service_name: &str, default_log_filter: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name, default_log_filter)?;
        let filter = EnvFilter::try_new(&config.log_filter).map_err(|e| {
            Error::Config(format!("invalid {LOG_FILTER_ENV} '{}': {e}", config.log_filter))
        })?;

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let providers = config.otel_enabled.then(|| {
            let resource = Resource::new(config.resource_attributes.clone());
            let tracer_provider = TracerProvider::builder()
                .with_config(
                    trace::Config::default()
                        .with_sampler(config.sampler.clone())
                        .with_resource(resource.clone()),
                )
                .build();
            let _ = global::set_tracer_provider(tracer_provider.clone());

            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            global::set_meter_provider(meter_provider.clone());
            global::set_text_map_propagator(TraceContextPropagator::new());
            (tracer_provider, meter_provider)
        });

        info!(
            service_name = %config.service_name,
            otel_enabled = config.otel_enabled,
            traces_sampler = %config.traces_sampler,
            "Telemetry initialized"
        );

        Ok(Self { config, providers })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some((tracer_provider, meter_provider)) = self.providers.take() {
            let _ = meter_provider.shutdown();
            let _ = tracer_provider.shutdown();
        }
    }
}

fn parse_optional_bool(name: &str) -> Result<Option<bool>> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(Error::Config(format!("{name} must be a boolean, got '{raw}'"))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    let ratio = || -> Result<f64> {
        let raw = arg.ok_or_else(|| {
            Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
        })?;
        match raw.trim().parse::<f64>() {
            Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
            _ => Err(Error::Config(format!(
                "OTEL_TRACES_SAMPLER_ARG must be a float in [0,1], got '{raw}'"
            ))),
        }
    };
    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(ratio()?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(ratio()?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' is invalid, expected key=value"
            ))),
        })
        .collect()
}
