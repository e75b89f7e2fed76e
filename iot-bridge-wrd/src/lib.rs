//! Bridge for WRD temperature/humidity sensors.
//!
//! Each configured sensor gets its own polling task. A poll opens a short-lived
//! TCP connection, reads the handful of text lines the sensor pushes on
//! connect, and turns them into a [`reader::Reading`]. Readings are published
//! to a label-keyed gauge registry that is scraped over HTTP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  WRD sensor  │────>│  SensorMonitor  │────>│ SensorGauges │────>│ HTTP server │
//! │  (tcp/80)    │     │ (poll/backoff)  │     │  (registry)  │     │  (/metrics) │
//! └──────────────┘     └─────────────────┘     └──────────────┘     └─────────────┘
//! ```
//!
//! # Exported metrics
//!
//! ```text
//! temperature_metric_celsius{node, campus, building, room}
//! humidity_metric_ratio{node, campus, building, room}
//! ```
//!
//! A sensor that is failing has no series at all; values are never left
//! frozen at a stale reading or replaced by zero.

pub mod collector;
pub mod config;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod reader;

pub use collector::{SensorGauges, SharedGauges};
pub use config::WrdBridgeConfig;
pub use http::HttpServer;
pub use metrics::{MetricsSink, SensorLabels};
pub use monitor::{RetryState, SensorMonitor};
pub use reader::{FailureKind, ReadError, Reading, SensorReader, TcpSensorReader};
