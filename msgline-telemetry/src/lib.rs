// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Msgline telemetry (metrics + tracing + logging).

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use msgline_core::MetricsCollector;
use opentelemetry::metrics::{Counter, Meter, MeterProvider, UpDownCounter};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// `MetricsCollector` backed by OpenTelemetry instruments, created on first use.
pub struct OtelMetrics {
    meter: Meter,
    counters: DashMap<&'static str, Counter<u64>>,
    gauges: DashMap<&'static str, (UpDownCounter<i64>, AtomicI64)>,
}

impl OtelMetrics {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: DashMap::new(),
            gauges: DashMap::new(),
        }
    }
}

impl MetricsCollector for OtelMetrics {
    fn incr_counter(&self, name: &'static str, value: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| self.meter.u64_counter(name).init())
            .add(value, &[]);
    }

    /// Gauges are up/down counters moved by the delta from the last value.
    fn set_gauge(&self, name: &'static str, value: i64) {
        let entry = self
            .gauges
            .entry(name)
            .or_insert_with(|| (self.meter.i64_up_down_counter(name).init(), AtomicI64::new(0)));
        let (instrument, last) = entry.value();
        let previous = last.swap(value, Ordering::Relaxed);
        instrument.add(value - previous, &[]);
    }
}

pub struct TelemetryConfig<'a> {
    pub service_name: &'a str,
    pub otlp_endpoint: Option<&'a str>,
    /// JSON lines instead of the human-readable format.
    pub json_logs: bool,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: &'a str,
}

/// Initialize telemetry (tracing + metrics).
pub fn init_telemetry(config: TelemetryConfig<'_>) -> anyhow::Result<OtelMetrics> {
    let resource = opentelemetry_sdk::Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.to_string(),
    )]);

    let tracer_provider = if let Some(endpoint) = config.otlp_endpoint {
        opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(resource))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?
    } else {
        opentelemetry_sdk::trace::TracerProvider::builder().build()
    };
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(config.service_name.to_string());

    let meter_provider = if let Some(endpoint) = config.otlp_endpoint {
        opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .build()?
    } else {
        SdkMeterProvider::default()
    };
    let meter = meter_provider.meter(config.service_name.to_string());
    opentelemetry::global::set_meter_provider(meter_provider);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter));
    if config.json_logs {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    }

    Ok(OtelMetrics::new(meter))
}

/// Flushes pending spans and shuts down the global tracer provider.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
