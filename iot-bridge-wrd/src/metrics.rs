//! Label sets and the sink interface the monitors publish through.

use serde::Serialize;

use crate::reader::Reading;

/// The label set that identifies one sensor's metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SensorLabels {
    /// Sensor address.
    pub node: String,
    pub campus: String,
    pub building: String,
    pub room: String,
}

impl SensorLabels {
    pub fn new(node: &str, campus: &str, building: &str, room: &str) -> Self {
        Self {
            node: node.to_string(),
            campus: campus.to_string(),
            building: building.to_string(),
            room: room.to_string(),
        }
    }

    /// Label pairs sorted by label name.
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            ("building", self.building.as_str()),
            ("campus", self.campus.as_str()),
            ("node", self.node.as_str()),
            ("room", self.room.as_str()),
        ]
    }
}

/// Destination for sensor readings.
///
/// Implementations must be safe to call from many monitor tasks at once and
/// must apply each `set`/`delete` atomically for both values of a label set.
pub trait MetricsSink: Send + Sync {
    /// Upsert temperature and humidity for `labels`.
    fn set(&self, labels: &SensorLabels, reading: &Reading);

    /// Remove both values for `labels` so they vanish from the export.
    fn delete(&self, labels: &SensorLabels);
}
