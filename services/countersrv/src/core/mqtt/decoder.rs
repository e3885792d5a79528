//! MQTT payload decoding into canonical readings.
//!
//! JSON-path extractors are compiled once at registry build time so the
//! per-message cost is a plain segment walk, not expression parsing.
//! Binary payloads are network byte order with exact lengths; CSV is
//! `channel, value [, timestamp]`.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::core::config::{MqttDataType, MqttDeviceConfig, PayloadFormat};
use crate::core::reading::{DeviceReading, Quality};
use crate::utils::{CounterSrvError, Result};

/// One step of a compiled JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// A compiled `$.a.b[0]`-style path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    /// Parse a dotted path with optional array indices. The leading `$`
    /// names the document root.
    pub fn parse(expr: &str) -> Result<Self> {
        let rest = expr.strip_prefix('$').ok_or_else(|| {
            CounterSrvError::ConfigError(format!("json path must start with '$': {expr}"))
        })?;

        let mut segments = Vec::new();
        let mut chars = rest.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    let mut key = String::new();
                    while let Some(&next) = chars.peek() {
                        if next == '.' || next == '[' {
                            break;
                        }
                        key.push(next);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(CounterSrvError::ConfigError(format!(
                            "empty key segment in json path: {expr}"
                        )));
                    }
                    segments.push(PathSegment::Key(key));
                }
                '[' => {
                    let mut digits = String::new();
                    for next in chars.by_ref() {
                        if next == ']' {
                            break;
                        }
                        digits.push(next);
                    }
                    let index = digits.parse::<usize>().map_err(|_| {
                        CounterSrvError::ConfigError(format!(
                            "invalid array index in json path: {expr}"
                        ))
                    })?;
                    segments.push(PathSegment::Index(index));
                }
                other => {
                    return Err(CounterSrvError::ConfigError(format!(
                        "unexpected character '{other}' in json path: {expr}"
                    )));
                }
            }
        }

        Ok(Self { segments })
    }

    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                PathSegment::Key(key) => current.get(key)?,
                PathSegment::Index(index) => current.get(index)?,
            };
        }
        Some(current)
    }
}

/// Numeric payload value together with its integer raw form.
struct DecodedValue {
    raw: i64,
    value: f64,
}

fn coerce_number(value: f64, data_type: MqttDataType, context: &str) -> Result<DecodedValue> {
    if !value.is_finite() {
        return Err(CounterSrvError::DecodeError(format!(
            "{context}: non-finite value"
        )));
    }

    let in_range = match data_type {
        MqttDataType::UInt32 => value >= 0.0 && value <= f64::from(u32::MAX),
        MqttDataType::Int16 => value >= f64::from(i16::MIN) && value <= f64::from(i16::MAX),
        MqttDataType::UInt16 => value >= 0.0 && value <= f64::from(u16::MAX),
        MqttDataType::Float32 | MqttDataType::Float64 => true,
    };
    if !in_range {
        return Err(CounterSrvError::DecodeError(format!(
            "{context}: value {value} out of range for {data_type:?}"
        )));
    }

    Ok(DecodedValue {
        raw: value as i64,
        value,
    })
}

fn parse_typed(text: &str, data_type: MqttDataType, context: &str) -> Result<DecodedValue> {
    let parsed: f64 = match data_type {
        MqttDataType::UInt32 => text.parse::<u32>().map(f64::from).map_err(|e| {
            CounterSrvError::DecodeError(format!("{context}: invalid uint32 '{text}': {e}"))
        })?,
        MqttDataType::Int16 => text.parse::<i16>().map(f64::from).map_err(|e| {
            CounterSrvError::DecodeError(format!("{context}: invalid int16 '{text}': {e}"))
        })?,
        MqttDataType::UInt16 => text.parse::<u16>().map(f64::from).map_err(|e| {
            CounterSrvError::DecodeError(format!("{context}: invalid uint16 '{text}': {e}"))
        })?,
        MqttDataType::Float32 => text.parse::<f32>().map(f64::from).map_err(|e| {
            CounterSrvError::DecodeError(format!("{context}: invalid float32 '{text}': {e}"))
        })?,
        MqttDataType::Float64 => text.parse::<f64>().map_err(|e| {
            CounterSrvError::DecodeError(format!("{context}: invalid float64 '{text}': {e}"))
        })?,
    };
    coerce_number(parsed, data_type, context)
}

fn decode_binary(payload: &[u8], data_type: MqttDataType) -> Result<DecodedValue> {
    let expected = match data_type {
        MqttDataType::Int16 | MqttDataType::UInt16 => 2,
        MqttDataType::UInt32 | MqttDataType::Float32 => 4,
        MqttDataType::Float64 => 8,
    };
    if payload.len() != expected {
        return Err(CounterSrvError::DecodeError(format!(
            "binary payload length {} does not match {:?} ({} bytes)",
            payload.len(),
            data_type,
            expected
        )));
    }

    let value = match data_type {
        MqttDataType::UInt16 => f64::from(u16::from_be_bytes([payload[0], payload[1]])),
        MqttDataType::Int16 => f64::from(i16::from_be_bytes([payload[0], payload[1]])),
        MqttDataType::UInt32 => f64::from(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ])),
        MqttDataType::Float32 => f64::from(f32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ])),
        MqttDataType::Float64 => f64::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
            payload[7],
        ]),
    };
    coerce_number(value, data_type, "binary payload")
}

fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let n = n.as_f64()?;
            parse_epoch(n)
        }
        Value::String(s) => parse_timestamp_text(s),
        _ => None,
    }
}

fn parse_timestamp_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(number) = text.parse::<f64>() {
        return parse_epoch(number);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Heuristic epoch: values above 10^12 are milliseconds, otherwise seconds.
fn parse_epoch(number: f64) -> Option<DateTime<Utc>> {
    if number <= 0.0 {
        return None;
    }
    let millis = if number >= 1e12 { number } else { number * 1e3 };
    DateTime::from_timestamp_millis(millis as i64)
}

/// One MQTT device with its extractors compiled.
pub struct DeviceBinding {
    pub config: MqttDeviceConfig,
    channel_path: Option<JsonPath>,
    value_path: Option<JsonPath>,
    device_id_path: Option<JsonPath>,
    timestamp_path: Option<JsonPath>,
}

impl DeviceBinding {
    pub fn compile(config: MqttDeviceConfig) -> Result<Self> {
        let compile = |expr: &Option<String>| -> Result<Option<JsonPath>> {
            expr.as_deref().map(JsonPath::parse).transpose()
        };
        Ok(Self {
            channel_path: compile(&config.channel_path)?,
            value_path: compile(&config.value_path)?,
            device_id_path: compile(&config.device_id_path)?,
            timestamp_path: compile(&config.timestamp_path)?,
            config,
        })
    }

    /// Decode one publish payload into a reading. The timestamp comes from
    /// the payload when an extractor yields one, otherwise `arrival`.
    pub fn decode(&self, payload: &[u8], arrival: DateTime<Utc>) -> Result<DeviceReading> {
        let (device_id, channel, decoded, timestamp) = match self.config.format {
            PayloadFormat::Json => self.decode_json(payload)?,
            PayloadFormat::Binary => {
                let decoded = decode_binary(payload, self.config.data_type)?;
                (None, 0, decoded, None)
            }
            PayloadFormat::Csv => self.decode_csv(payload)?,
        };

        let processed = decoded.value * self.config.scale_factor;
        Ok(DeviceReading {
            device_id: device_id.unwrap_or_else(|| self.config.device_id.clone()),
            channel,
            timestamp: timestamp.unwrap_or(arrival),
            raw_value: decoded.raw,
            processed_value: Some(processed),
            rate: None,
            quality: Quality::Good,
            unit: self.config.unit.clone(),
        })
    }

    #[allow(clippy::type_complexity)]
    fn decode_json(
        &self,
        payload: &[u8],
    ) -> Result<(Option<String>, u32, DecodedValue, Option<DateTime<Utc>>)> {
        let root: Value = serde_json::from_slice(payload)
            .map_err(|e| CounterSrvError::DecodeError(format!("invalid json payload: {e}")))?;

        let channel_path = self.channel_path.as_ref().ok_or_else(|| {
            CounterSrvError::DecodeError("json device without channel path".to_string())
        })?;
        let value_path = self.value_path.as_ref().ok_or_else(|| {
            CounterSrvError::DecodeError("json device without value path".to_string())
        })?;

        let channel_value = channel_path
            .resolve(&root)
            .ok_or_else(|| CounterSrvError::DecodeError("channel path not found".to_string()))?;
        let channel = channel_value
            .as_u64()
            .or_else(|| channel_value.as_str().and_then(|s| s.parse().ok()))
            .and_then(|c| u32::try_from(c).ok())
            .ok_or_else(|| {
                CounterSrvError::DecodeError(format!("channel is not a number: {channel_value}"))
            })?;

        let value = value_path
            .resolve(&root)
            .ok_or_else(|| CounterSrvError::DecodeError("value path not found".to_string()))?;
        let number = value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| {
                CounterSrvError::DecodeError(format!("value is not a number: {value}"))
            })?;
        let decoded = coerce_number(number, self.config.data_type, "json value")?;

        let device_id = self
            .device_id_path
            .as_ref()
            .and_then(|p| p.resolve(&root))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let timestamp = self
            .timestamp_path
            .as_ref()
            .and_then(|p| p.resolve(&root))
            .and_then(parse_timestamp_value);

        Ok((device_id, channel, decoded, timestamp))
    }

    #[allow(clippy::type_complexity)]
    fn decode_csv(
        &self,
        payload: &[u8],
    ) -> Result<(Option<String>, u32, DecodedValue, Option<DateTime<Utc>>)> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| CounterSrvError::DecodeError("csv payload is not utf-8".to_string()))?;
        let fields: Vec<&str> = text.split(',').map(str::trim).collect();

        if fields.len() < 2 {
            return Err(CounterSrvError::DecodeError(format!(
                "csv payload needs at least channel and value, got {} field(s)",
                fields.len()
            )));
        }

        let channel = fields[0].parse::<u32>().map_err(|e| {
            CounterSrvError::DecodeError(format!("invalid csv channel '{}': {e}", fields[0]))
        })?;
        let decoded = parse_typed(fields[1], self.config.data_type, "csv value")?;
        let timestamp = fields.get(2).and_then(|t| parse_timestamp_text(t));

        Ok((None, channel, decoded, timestamp))
    }
}
