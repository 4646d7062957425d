//! Logging setup and in-process metrics for foreman services.
//!
//! - **Logging**: human-readable or JSON output through `tracing-subscriber`
//! - **Metrics**: counters, gauges and duration histograms fed from the
//!   lifecycle [`EventBus`](fm_core::event_bus::EventBus), exportable as
//!   Prometheus text or JSON

pub mod logging;
pub mod metrics;
