#![allow(clippy::needless_doctest_main)]
//! A wrapper around the `prometheus` crate that provides a global, `lazy_static` metrics registry
//! and functions to add and use the following components (more info at
//! [Prometheus docs](https://prometheus.io/docs/concepts/metric_types/)):
//!
//! - `IntCounter`: used to represent a single integer value that only increases.
//! - `IntGauge`: used to represent a single integer value that can go up or down.
//!
//! Metrics are created with a `try_create_*` function and stored as a `Result`: a metric that
//! failed to register (e.g., a duplicate name) is silently ignored by the `inc_*`/`set_*`
//! helpers, so instrumentation can never fail the caller.
//!
//! ## Example
//!
//! ```rust
//! use lazy_static::lazy_static;
//! use node_metrics::*;
//!
//! lazy_static! {
//!     pub static ref RUN_COUNT: Result<IntCounter> = try_create_int_counter(
//!         "runs_total",
//!         "Total number of runs"
//!     );
//!     pub static ref CURRENT_VALUE: Result<IntGauge> = try_create_int_gauge(
//!         "current_value",
//!         "The current value"
//!     );
//! }
//!
//! fn main() {
//!     for i in 0..100 {
//!         inc_counter(&RUN_COUNT);
//!         set_gauge(&CURRENT_VALUE, i);
//!     }
//!
//!     assert_eq!(100, RUN_COUNT.as_ref().unwrap().get());
//!     assert_eq!(99, CURRENT_VALUE.as_ref().unwrap().get());
//! }
//! ```

use prometheus::proto::MetricFamily;
pub use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Result, TextEncoder};

/// Collect all the metrics for reporting.
pub fn gather() -> Vec<MetricFamily> {
    prometheus::gather()
}

/// Attempts to create an `IntCounter`, returning `Err` if the registry does not accept the counter
/// (potentially due to naming conflict).
pub fn try_create_int_counter(name: &str, help: &str) -> Result<IntCounter> {
    let opts = Opts::new(name, help);
    let counter = IntCounter::with_opts(opts)?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Attempts to create an `IntGauge`, returning `Err` if the registry does not accept the gauge
/// (potentially due to naming conflict).
pub fn try_create_int_gauge(name: &str, help: &str) -> Result<IntGauge> {
    let opts = Opts::new(name, help);
    let gauge = IntGauge::with_opts(opts)?;
    prometheus::register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Attempts to create an `IntCounterVec`, returning `Err` if the registry does not accept the
/// counter (potentially due to naming conflict).
pub fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec> {
    let opts = Opts::new(name, help);
    let counter_vec = IntCounterVec::new(opts, label_names)?;
    prometheus::register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

pub fn inc_counter(counter: &Result<IntCounter>) {
    if let Ok(counter) = counter {
        counter.inc();
    }
}

pub fn inc_counter_by(counter: &Result<IntCounter>, value: u64) {
    if let Ok(counter) = counter {
        counter.inc_by(value);
    }
}

pub fn inc_counter_vec(int_counter_vec: &Result<IntCounterVec>, name: &[&str]) {
    if let Ok(counter_vec) = int_counter_vec {
        if let Ok(counter) = counter_vec.get_metric_with_label_values(name) {
            counter.inc();
        }
    }
}

pub fn set_gauge(gauge: &Result<IntGauge>, value: i64) {
    if let Ok(gauge) = gauge {
        gauge.set(value);
    }
}

pub fn get_int_gauge_value(gauge: &Result<IntGauge>) -> Option<i64> {
    gauge.as_ref().ok().map(|g| g.get())
}

/// Renders every registered metric in the Prometheus text exposition format.
pub fn encode_text() -> std::result::Result<String, String> {
    let mut buffer = vec![];
    TextEncoder::new()
        .encode(&gather(), &mut buffer)
        .map_err(|e| format!("Unable to encode metrics: {:?}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics are not utf8: {:?}", e))
}
