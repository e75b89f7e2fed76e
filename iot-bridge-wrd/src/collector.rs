//! Label-keyed gauge registry rendered in Prometheus exposition format.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use crate::metrics::{MetricsSink, SensorLabels};
use crate::reader::Reading;

pub const TEMPERATURE_METRIC: &str = "temperature_metric_celsius";
pub const HUMIDITY_METRIC: &str = "humidity_metric_ratio";

const TEMPERATURE_HELP: &str = "Temperature measured by the WRD Sensor";
const HUMIDITY_HELP: &str = "Humidity percentage measured by the WRD Sensor";

/// Latest published values for one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub temperature: f64,
    pub humidity: f64,
    /// Unix epoch milliseconds of the last `set`.
    pub updated_at: i64,
}

/// One published series as shown on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    #[serde(flatten)]
    pub labels: SensorLabels,
    #[serde(flatten)]
    pub sample: Sample,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GaugeStats {
    /// Total `set` calls.
    pub updates: u64,
    /// Total `delete` calls that removed a series.
    pub deletes: u64,
}

/// Thread-safe store of the latest reading per sensor.
///
/// Temperature and humidity live in one entry, so a scrape never sees one
/// value from an old reading next to one from a new reading.
#[derive(Debug, Default)]
pub struct SensorGauges {
    series: RwLock<BTreeMap<SensorLabels, Sample>>,
    stats: RwLock<GaugeStats>,
}

/// Create a shareable registry handle.
pub type SharedGauges = Arc<SensorGauges>;

impl SensorGauges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sample for `labels`, if one is published.
    pub fn get(&self, labels: &SensorLabels) -> Option<Sample> {
        self.series.read().get(labels).copied()
    }

    /// Number of sensors with published values.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    /// Every published series, ordered by label set.
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        self.series
            .read()
            .iter()
            .map(|(labels, sample)| SeriesSnapshot {
                labels: labels.clone(),
                sample: *sample,
            })
            .collect()
    }

    pub fn stats(&self) -> GaugeStats {
        self.stats.read().clone()
    }

    /// Render all series in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let series = self.series.read();
        let mut output = Vec::with_capacity(256 + series.len() * 200);

        write_family(&mut output, TEMPERATURE_METRIC, TEMPERATURE_HELP, &series, |s| {
            s.temperature
        });
        write_family(&mut output, HUMIDITY_METRIC, HUMIDITY_HELP, &series, |s| {
            s.humidity
        });

        let stats = self.stats.read();
        writeln!(output).ok();
        writeln!(output, "# TYPE wrd_bridge_series gauge").ok();
        writeln!(output, "wrd_bridge_series {}", series.len()).ok();
        writeln!(output, "# TYPE wrd_bridge_updates_total counter").ok();
        writeln!(output, "wrd_bridge_updates_total {}", stats.updates).ok();
        writeln!(output, "# TYPE wrd_bridge_deletes_total counter").ok();
        writeln!(output, "wrd_bridge_deletes_total {}", stats.deletes).ok();

        String::from_utf8(output).unwrap_or_default()
    }
}

impl MetricsSink for SensorGauges {
    fn set(&self, labels: &SensorLabels, reading: &Reading) {
        let sample = Sample {
            temperature: reading.temperature,
            humidity: reading.humidity,
            updated_at: chrono::Utc::now().timestamp_millis(),
        };

        self.series.write().insert(labels.clone(), sample);
        self.stats.write().updates += 1;

        trace!(
            sensor = %labels.node,
            temperature = sample.temperature,
            humidity = sample.humidity,
            "Gauges updated"
        );
    }

    fn delete(&self, labels: &SensorLabels) {
        if self.series.write().remove(labels).is_some() {
            self.stats.write().deletes += 1;
            trace!(sensor = %labels.node, "Gauges removed");
        }
    }
}

/// Write `# HELP`/`# TYPE` and one line per series. Families with no
/// series are omitted.
fn write_family(
    output: &mut Vec<u8>,
    name: &str,
    help: &str,
    series: &BTreeMap<SensorLabels, Sample>,
    value: impl Fn(&Sample) -> f64,
) {
    if series.is_empty() {
        return;
    }

    writeln!(output, "# HELP {} {}", name, help).ok();
    writeln!(output, "# TYPE {} gauge", name).ok();
    for (labels, sample) in series {
        writeln!(
            output,
            "{}{} {}",
            name,
            format_labels(labels),
            format_value(value(sample))
        )
        .ok();
    }
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a sample value for the exposition format.
///
/// Whole numbers drop the fraction and negative zero prints as `0`.
fn format_value(value: f64) -> String {
    match value {
        v if v.is_nan() => "NaN".to_string(),
        v if v == f64::INFINITY => "+Inf".to_string(),
        v if v == f64::NEG_INFINITY => "-Inf".to_string(),
        v if v == 0.0 => "0".to_string(),
        v if v.fract() == 0.0 => format!("{:.0}", v),
        v => v.to_string(),
    }
}

fn format_labels(labels: &SensorLabels) -> String {
    let parts: Vec<String> = labels
        .pairs()
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    format!("{{{}}}", parts.join(","))
}
