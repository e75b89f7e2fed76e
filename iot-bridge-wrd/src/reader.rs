//! WRD sensor wire protocol.
//!
//! The sensor is a TCP server. As soon as a client connects it pushes a few
//! newline-terminated ASCII lines and expects nothing back:
//!
//! ```text
//! Copyright (c) 2010 WRD Tech. Co., Ltd. All rights reserved.
//! Temperature = 22.82C
//! Humidity = 36.73%
//! ```
//!
//! Some firmware emits one extra line before the humidity, so humidity is
//! looked up on line 2 first and line 3 second. Sub-zero temperatures come
//! out in a mangled form such as `-1.-38C`, see [`parse_temperature`].

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

use crate::config::PollingConfig;

/// Most lines read from one connection.
pub const MAX_LINES: usize = 5;

/// Fewest lines that can hold banner, temperature and humidity.
pub const MIN_LINES: usize = 3;

/// Longest line accepted, newline included.
pub const MAX_LINE_BYTES: usize = 256;

/// One successful sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity, 0-100.
    pub humidity: f64,
    /// Trimmed lines the sample was parsed from.
    pub raw: Vec<String>,
}

/// Why line collection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStop {
    /// The sensor closed the connection.
    Eof,
    /// The read deadline expired.
    Deadline,
    /// Transport error mid-read.
    Io(String),
    /// [`MAX_LINES`] lines were read.
    LineLimit,
    /// A line ran past [`MAX_LINE_BYTES`] without a newline.
    LineTooLong,
}

impl fmt::Display for ReadStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadStop::Eof => write!(f, "connection closed by sensor"),
            ReadStop::Deadline => write!(f, "read deadline expired"),
            ReadStop::Io(e) => write!(f, "read error: {}", e),
            ReadStop::LineLimit => write!(f, "line limit reached"),
            ReadStop::LineTooLong => write!(f, "line longer than {} bytes", MAX_LINE_BYTES),
        }
    }
}

/// A failed poll.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("insufficient data received: {received} line(s), {stop}")]
    InsufficientData { received: usize, stop: ReadStop },

    #[error("failed to parse temperature from {line:?}")]
    TemperatureParse { line: String },

    #[error("failed to parse humidity from {line:?}: {reason}")]
    HumidityParse { line: String, reason: String },
}

/// Failure category, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    ConnectTimeout,
    Connect,
    InsufficientData,
    TemperatureParse,
    HumidityParse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectTimeout => "connect_timeout",
            FailureKind::Connect => "connect_error",
            FailureKind::InsufficientData => "insufficient_data",
            FailureKind::TemperatureParse => "temperature_parse_error",
            FailureKind::HumidityParse => "humidity_parse_error",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ReadError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ReadError::ConnectTimeout { .. } => FailureKind::ConnectTimeout,
            ReadError::Connect { .. } => FailureKind::Connect,
            ReadError::InsufficientData { .. } => FailureKind::InsufficientData,
            ReadError::TemperatureParse { .. } => FailureKind::TemperatureParse,
            ReadError::HumidityParse { .. } => FailureKind::HumidityParse,
        }
    }
}

/// Something that can take a sample from a sensor.
pub trait SensorReader: Send + Sync {
    fn read(&self, host: &str) -> impl Future<Output = Result<Reading, ReadError>> + Send;
}

/// Reads WRD sensors over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpSensorReader {
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpSensorReader {
    pub fn new(port: u16, connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            port,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(
            config.port,
            config.connect_timeout(),
            config.read_timeout(),
        )
    }

    /// Connect to `host`, collect its lines and parse them.
    ///
    /// The stream is owned by this call, so the connection is closed on
    /// every return path.
    pub async fn read_sensor(&self, host: &str) -> Result<Reading, ReadError> {
        let addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port),
            Err(e) => {
                return Err(ReadError::Connect {
                    addr: host.to_string(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, e),
                });
            }
        };

        let stream = connect_within(addr, self.connect_timeout, TcpStream::connect(addr)).await?;

        let deadline = Instant::now() + self.read_timeout;
        let mut reader = BufReader::new(stream);
        let (lines, stop) = collect_lines(&mut reader, deadline).await;
        drop(reader);

        trace!(sensor = %addr, lines = ?lines, stop = %stop, "Collected sensor response");

        if lines.len() < MIN_LINES {
            return Err(ReadError::InsufficientData {
                received: lines.len(),
                stop,
            });
        }

        let reading = parse_lines(&lines)?;
        debug!(
            sensor = %addr,
            temperature = reading.temperature,
            humidity = reading.humidity,
            "Sensor read"
        );
        Ok(reading)
    }
}

impl SensorReader for TcpSensorReader {
    fn read(&self, host: &str) -> impl Future<Output = Result<Reading, ReadError>> + Send {
        self.read_sensor(host)
    }
}

/// Drive `connect` to completion, giving up after `limit`.
async fn connect_within<S, F>(addr: SocketAddr, limit: Duration, connect: F) -> Result<S, ReadError>
where
    F: Future<Output = io::Result<S>>,
{
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ReadError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(ReadError::ConnectTimeout {
            addr: addr.to_string(),
            timeout: limit,
        }),
    }
}

/// Read up to [`MAX_LINES`] newline-terminated lines before `deadline`.
///
/// Never fails: the first error, timeout or end of stream ends collection and
/// the lines gathered so far are returned along with the reason. A fragment
/// without a trailing newline is discarded, as is anything past
/// [`MAX_LINE_BYTES`] on one line.
pub async fn collect_lines<R>(reader: &mut R, deadline: Instant) -> (Vec<String>, ReadStop)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::with_capacity(MAX_LINES);
    let mut buf = Vec::new();

    while lines.len() < MAX_LINES {
        buf.clear();
        let mut line = (&mut *reader).take(MAX_LINE_BYTES as u64);
        match timeout_at(deadline, line.read_until(b'\n', &mut buf)).await {
            Err(_) => return (lines, ReadStop::Deadline),
            Ok(Err(e)) => return (lines, ReadStop::Io(e.to_string())),
            Ok(Ok(_)) if buf.last() == Some(&b'\n') => {
                lines.push(String::from_utf8_lossy(&buf).trim().to_string())
            }
            Ok(Ok(n)) if n >= MAX_LINE_BYTES => return (lines, ReadStop::LineTooLong),
            Ok(Ok(_)) => return (lines, ReadStop::Eof),
        }
    }

    (lines, ReadStop::LineLimit)
}

/// Parse a complete sensor response.
///
/// `lines` is everything the sensor sent, already trimmed. A reading is only
/// returned when both temperature and humidity parse.
pub fn parse_lines(lines: &[String]) -> Result<Reading, ReadError> {
    if lines.len() < MIN_LINES {
        return Err(ReadError::InsufficientData {
            received: lines.len(),
            stop: ReadStop::Eof,
        });
    }

    let temperature =
        parse_temperature(&lines[1]).ok_or_else(|| ReadError::TemperatureParse {
            line: lines[1].clone(),
        })?;

    let humidity_line = if lines[2].ends_with('%') {
        lines[2].as_str()
    } else {
        match lines.get(3) {
            Some(line) => line.as_str(),
            None => {
                return Err(ReadError::HumidityParse {
                    line: lines[2].clone(),
                    reason: "no humidity line".to_string(),
                });
            }
        }
    };
    let humidity = parse_humidity(humidity_line)?;

    Ok(Reading {
        temperature,
        humidity,
        raw: lines.to_vec(),
    })
}

/// Parse a `Temperature = <value>C` line.
///
/// Values the sensor can print as ordinary decimals (`22.82`, `0.0`) parse
/// directly. Below zero the firmware prints the integer part, a dot, and the
/// hundredths with their own minus sign: `0.-3` is -0.03 and `-1.-38` is
/// -1.38. Any other shape is rejected.
pub fn parse_temperature(line: &str) -> Option<f64> {
    let token = last_token(line)?.strip_suffix('C')?;
    parse_decimal(token).or_else(|| parse_negative_encoding(token))
}

fn parse_negative_encoding(token: &str) -> Option<f64> {
    let (int_part, frac_part) = token.split_once('.')?;
    let digits = frac_part.strip_prefix('-')?;
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let int_part: i64 = int_part.parse().ok()?;
    let hundredths: u32 = digits.parse().ok()?;

    Some(-(int_part.unsigned_abs() as f64 + f64::from(hundredths) / 100.0))
}

/// Parse a `Humidity = <value>%` line into a percentage in `[0, 100]`.
pub fn parse_humidity(line: &str) -> Result<f64, ReadError> {
    let err = |reason: &str| ReadError::HumidityParse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let token = last_token(line).ok_or_else(|| err("no value"))?;
    let token = token.strip_suffix('%').unwrap_or(token);
    let value = parse_decimal(token).ok_or_else(|| err("not a number"))?;

    if !(0.0..=100.0).contains(&value) {
        return Err(err("out of range"));
    }

    Ok(value)
}

fn last_token(line: &str) -> Option<&str> {
    line.split_whitespace().next_back()
}

fn parse_decimal(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
