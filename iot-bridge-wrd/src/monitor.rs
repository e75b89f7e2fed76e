//! Per-sensor polling loop with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::config::{PollingConfig, SensorConfig};
use crate::metrics::{MetricsSink, SensorLabels};
use crate::reader::{ReadError, Reading, SensorReader};

/// Compute the backoff delay after `failures` consecutive failures.
///
/// `base * 2^(failures - 1)`, capped at `max`. Zero failures means no delay.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    1u32.checked_shl(failures - 1)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Consecutive-failure counter for one sensor.
#[derive(Debug, Clone)]
pub struct RetryState {
    failures: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryState {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: 0,
            base_delay,
            max_delay,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Count one more failure and return how long to wait before retrying.
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        backoff_delay(self.base_delay, self.max_delay, self.failures)
    }

    /// Clear the counter, returning the streak length it had.
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }
}

/// Polls one sensor forever and keeps its metrics in the sink current.
pub struct SensorMonitor<R> {
    sensor: SensorConfig,
    labels: SensorLabels,
    reader: R,
    sink: Arc<dyn MetricsSink>,
    sample_interval: Duration,
    retry: RetryState,
}

impl<R: SensorReader> SensorMonitor<R> {
    pub fn new(
        sensor: SensorConfig,
        reader: R,
        sink: Arc<dyn MetricsSink>,
        sample_interval: Duration,
        retry: RetryState,
    ) -> Self {
        let labels = sensor.labels();
        Self {
            sensor,
            labels,
            reader,
            sink,
            sample_interval,
            retry,
        }
    }

    /// Create a monitor using the shared polling settings.
    pub fn from_config(
        sensor: SensorConfig,
        reader: R,
        sink: Arc<dyn MetricsSink>,
        polling: &PollingConfig,
    ) -> Self {
        Self::new(
            sensor,
            reader,
            sink,
            polling.sample_interval(),
            RetryState::new(polling.retry_base_delay(), polling.retry_max_delay()),
        )
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    /// Run the polling loop. Only stops when the task is aborted.
    pub async fn run(mut self) {
        info!(
            sensor = %self.sensor.ip,
            campus = %self.sensor.campus,
            building = %self.sensor.building,
            room = %self.sensor.room,
            interval_secs = self.sample_interval.as_secs(),
            "Starting sensor monitor"
        );

        loop {
            let delay = self.poll_once().await;
            tokio::time::sleep(delay).await;
        }
    }

    /// Poll once, publish or retract, and return how long to sleep.
    pub async fn poll_once(&mut self) -> Duration {
        match self.reader.read(&self.sensor.ip).await {
            Ok(reading) => self.on_success(reading),
            Err(e) => self.on_failure(e),
        }
    }

    fn on_success(&mut self, reading: Reading) -> Duration {
        let previous_failures = self.retry.reset();
        if previous_failures > 0 {
            info!(
                sensor = %self.sensor.ip,
                campus = %self.sensor.campus,
                building = %self.sensor.building,
                room = %self.sensor.room,
                previous_failures,
                "Sensor read successful after failures"
            );
        }

        // The sensor reports exactly 0% while warming up.
        if reading.humidity != 0.0 {
            self.sink.set(&self.labels, &reading);
        } else {
            debug!(
                sensor = %self.sensor.ip,
                temperature = reading.temperature,
                "Zero humidity, not publishing"
            );
        }

        self.sample_interval
    }

    fn on_failure(&mut self, error: ReadError) -> Duration {
        error!(
            sensor = %self.sensor.ip,
            campus = %self.sensor.campus,
            building = %self.sensor.building,
            room = %self.sensor.room,
            kind = %error.kind(),
            error = %error,
            "Failed to read sensor"
        );

        self.sink.delete(&self.labels);

        let delay = self.retry.record_failure();
        debug!(
            sensor = %self.sensor.ip,
            failures = self.retry.failures(),
            delay_secs = delay.as_secs(),
            "Retrying after backoff"
        );
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::ReadStop;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::future::Future;

    const BASE: Duration = Duration::from_secs(15);
    const MAX: Duration = Duration::from_secs(24 * 60 * 60);
    const INTERVAL: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Set(SensorLabels, f64, f64),
        Delete(SensorLabels),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl MetricsSink for RecordingSink {
        fn set(&self, labels: &SensorLabels, reading: &Reading) {
            self.events.lock().push(Event::Set(
                labels.clone(),
                reading.temperature,
                reading.humidity,
            ));
        }

        fn delete(&self, labels: &SensorLabels) {
            self.events.lock().push(Event::Delete(labels.clone()));
        }
    }

    /// Hands out queued results, one per read.
    struct ScriptedReader {
        script: Mutex<VecDeque<Result<Reading, ReadError>>>,
    }

    impl ScriptedReader {
        fn new(script: Vec<Result<Reading, ReadError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl SensorReader for ScriptedReader {
        fn read(&self, _host: &str) -> impl Future<Output = Result<Reading, ReadError>> + Send {
            let next = self
                .script
                .lock()
                .pop_front()
                .expect("scripted reader ran out of results");
            std::future::ready(next)
        }
    }

    fn ok(temperature: f64, humidity: f64) -> Result<Reading, ReadError> {
        Ok(Reading {
            temperature,
            humidity,
            raw: Vec::new(),
        })
    }

    fn fail() -> Result<Reading, ReadError> {
        Err(ReadError::InsufficientData {
            received: 0,
            stop: ReadStop::Deadline,
        })
    }

    fn sensor() -> SensorConfig {
        SensorConfig {
            ip: "10.0.0.21".to_string(),
            campus: "north".to_string(),
            building: "B1".to_string(),
            room: "101".to_string(),
        }
    }

    fn monitor(
        script: Vec<Result<Reading, ReadError>>,
    ) -> (SensorMonitor<ScriptedReader>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let monitor = SensorMonitor::new(
            sensor(),
            ScriptedReader::new(script),
            sink.clone(),
            INTERVAL,
            RetryState::new(BASE, MAX),
        );
        (monitor, sink)
    }

    #[test]
    fn test_backoff_delay_law() {
        for n in 1..=20u32 {
            let expected = (BASE * 2u32.pow(n - 1)).min(MAX);
            assert_eq!(backoff_delay(BASE, MAX, n), expected, "failure #{}", n);
        }
    }

    #[test]
    fn test_backoff_delay_first_values() {
        assert_eq!(backoff_delay(BASE, MAX, 0), Duration::ZERO);
        assert_eq!(backoff_delay(BASE, MAX, 1), Duration::from_secs(15));
        assert_eq!(backoff_delay(BASE, MAX, 2), Duration::from_secs(30));
        assert_eq!(backoff_delay(BASE, MAX, 3), Duration::from_secs(60));
        // 15 * 2^13 = 122880s > 24h
        assert_eq!(backoff_delay(BASE, MAX, 14), MAX);
    }

    #[test]
    fn test_backoff_delay_saturates_on_long_streaks() {
        assert_eq!(backoff_delay(BASE, MAX, 33), MAX);
        assert_eq!(backoff_delay(BASE, MAX, u32::MAX), MAX);
    }

    #[test]
    fn test_retry_state_reset() {
        let mut retry = RetryState::new(BASE, MAX);
        retry.record_failure();
        retry.record_failure();
        assert_eq!(retry.failures(), 2);

        assert_eq!(retry.reset(), 2);
        assert_eq!(retry.failures(), 0);
        assert_eq!(retry.record_failure(), BASE);
    }

    #[tokio::test]
    async fn test_success_publishes_and_waits_sample_interval() {
        let (mut monitor, sink) = monitor(vec![ok(22.82, 36.73)]);

        let delay = monitor.poll_once().await;

        assert_eq!(delay, INTERVAL);
        assert_eq!(
            sink.take(),
            vec![Event::Set(sensor().labels(), 22.82, 36.73)]
        );
    }

    #[tokio::test]
    async fn test_zero_humidity_is_not_published() {
        let (mut monitor, sink) = monitor(vec![ok(21.0, 0.0)]);

        let delay = monitor.poll_once().await;

        assert_eq!(delay, INTERVAL);
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_failure_deletes_before_next_attempt() {
        let (mut monitor, sink) = monitor(vec![ok(22.0, 40.0), fail()]);

        monitor.poll_once().await;
        let delay = monitor.poll_once().await;

        assert_eq!(delay, BASE);
        assert_eq!(
            sink.take(),
            vec![
                Event::Set(sensor().labels(), 22.0, 40.0),
                Event::Delete(sensor().labels()),
            ]
        );
    }

    #[tokio::test]
    async fn test_consecutive_failures_back_off_exponentially() {
        let (mut monitor, sink) = monitor(vec![fail(), fail(), fail(), fail()]);

        let mut delays = Vec::new();
        for _ in 0..4 {
            delays.push(monitor.poll_once().await);
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(15),
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
            ]
        );
        assert_eq!(monitor.retry_state().failures(), 4);
        assert!(
            sink.take()
                .iter()
                .all(|e| matches!(e, Event::Delete(_)))
        );
    }

    #[tokio::test]
    async fn test_success_resets_backoff() {
        let (mut monitor, _sink) = monitor(vec![fail(), fail(), fail(), ok(20.0, 50.0), fail()]);

        for _ in 0..3 {
            monitor.poll_once().await;
        }
        assert_eq!(monitor.retry_state().failures(), 3);

        assert_eq!(monitor.poll_once().await, INTERVAL);
        assert_eq!(monitor.retry_state().failures(), 0);

        assert_eq!(monitor.poll_once().await, BASE);
    }

    #[tokio::test]
    async fn test_zero_humidity_still_resets_backoff() {
        let (mut monitor, sink) = monitor(vec![fail(), ok(20.0, 0.0)]);

        monitor.poll_once().await;
        monitor.poll_once().await;

        assert_eq!(monitor.retry_state().failures(), 0);
        assert_eq!(sink.take(), vec![Event::Delete(sensor().labels())]);
    }
}
