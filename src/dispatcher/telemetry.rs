//! Dispatch-path telemetry instruments and recording helpers.

use crate::search::DispatchResult;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct DispatchInstruments {
    requests: Counter<u64>,
    duration_seconds: Histogram<f64>,
    coverage_ratio: Histogram<f64>,
    degraded_results: Counter<u64>,
    group_selection_attempts: Histogram<u64>,
    reconfigurations: Counter<u64>,
}

fn instruments() -> &'static DispatchInstruments {
    static INSTRUMENTS: OnceLock<DispatchInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("searchdispatch.dispatch");
        DispatchInstruments {
            requests: meter
                .u64_counter("searchdispatch.dispatch.requests")
                .with_description("Dispatched queries by outcome")
                .init(),
            duration_seconds: meter
                .f64_histogram("searchdispatch.dispatch.duration")
                .with_description("Time from send to merged result")
                .with_unit("s")
                .init(),
            coverage_ratio: meter
                .f64_histogram("searchdispatch.dispatch.coverage_ratio")
                .with_description("Searched documents relative to active documents")
                .init(),
            degraded_results: meter
                .u64_counter("searchdispatch.dispatch.degraded")
                .with_description("Degraded results by reason")
                .init(),
            group_selection_attempts: meter
                .u64_histogram("searchdispatch.dispatch.group_selection_attempts")
                .with_description("Groups tried before an invoker could be built")
                .init(),
            reconfigurations: meter
                .u64_counter("searchdispatch.dispatch.reconfigurations")
                .with_description("Topology generations swapped in")
                .init(),
        }
    })
}

pub fn record_search(result: &DispatchResult, invoker: &'static str, duration_seconds: f64) {
    let i = instruments();
    let outcome = match result.first_error() {
        Some(error) => error.code.as_str(),
        None => "success",
    };
    let attrs = [
        KeyValue::new("outcome", outcome),
        KeyValue::new("invoker", invoker),
    ];

    i.requests.add(1, &attrs);
    i.duration_seconds.record(duration_seconds, &attrs);
    i.coverage_ratio.record(result.coverage.ratio(), &attrs);
    if result.coverage.is_degraded() {
        i.degraded_results.add(
            1,
            &[KeyValue::new("reason", result.coverage.degraded.as_str())],
        );
    }
}

pub fn record_group_selection(attempts: u32, selected: bool) {
    instruments().group_selection_attempts.record(
        attempts as u64,
        &[KeyValue::new("selected", selected)],
    );
}

pub fn record_reconfiguration() {
    instruments().reconfigurations.add(1, &[]);
}
