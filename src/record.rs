//! Module that contains all valid record types for this application and the
//! payload parser for the inbound sensor messages.
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Format shared by the database rows and the republished payloads.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Errors raised while decoding an inbound sensor payload.
///
/// All of these are recoverable: the message is dropped and the
/// subscription keeps running.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The payload is not UTF-8, not JSON, or a field has the wrong shape.
    #[error("payload cannot be decoded: {0}")]
    Malformed(String),
    /// A required field is absent from the payload.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// A numeric field is NaN or infinite.
    #[error("field '{0}' is not a finite number")]
    NonFinite(&'static str),
}

/// Deployment-dependent parser behaviour.
///
/// Some installations run a single sensor node and omit `device_id`
/// entirely; others fan several nodes into one topic and need it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Reject payloads without a `device_id` field.
    pub require_device_id: bool,
}

#[derive(Debug, Clone, PartialEq)]
/// A validated environmental reading from a sensor node.
pub struct Reading {
    /// Timestamp the reading was taken, falling back to the time of
    /// receipt when the payload carries none.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the publishing node, if the deployment uses one.
    pub device_id: Option<String>,
    /// Temperature in degrees celsius.
    pub temperature: f64,
    /// Atmospheric pressure in hPa.
    pub pressure: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Illuminance in lux, only published by nodes with a light sensor.
    pub luminosity: Option<f64>,
}

#[derive(Serialize, Debug)]
/// Outbound copy of a stored reading, carrying the canonical timestamp
/// assigned by the server. Field names mirror the inbound wire format.
pub struct EnrichedReading<'a> {
    pub timestamp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<&'a str>,
    pub temperature: f64,
    pub pression: f64,
    pub humidite: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub luminosite: Option<f64>,
}

impl Reading {
    /// The canonical `"YYYY-MM-DD HH:MM:SS"` UTC timestamp string stored
    /// with the reading and attached to the republished copy.
    pub fn canonical_timestamp(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Builds the republish payload for this reading.
    pub fn enrich<'a>(&'a self, canonical_timestamp: &'a str) -> EnrichedReading<'a> {
        EnrichedReading {
            timestamp: canonical_timestamp,
            device_id: self.device_id.as_deref(),
            temperature: self.temperature,
            pression: self.pressure,
            humidite: self.humidity,
            luminosite: self.luminosity,
        }
    }
}

/// Decodes and validates a raw inbound payload.
///
/// The inbound wire format is a flat JSON object with the keys
/// `temperature`, `pression` and `humidite` (numbers, required) and
/// `device_id` (string), `luminosite` (number) and `timestamp` (integer
/// epoch seconds) as optional extras. `received` supplies the timestamp
/// when the payload has none.
///
/// Does not touch any process state; a rejected payload leaves no trace
/// beyond the returned error.
pub fn parse(
    raw: &[u8],
    received: DateTime<Utc>,
    opts: &ParseOptions,
) -> Result<Reading, ParseError> {
    let text = std::str::from_utf8(raw)
        .map_err(|err| ParseError::Malformed(format!("payload is not UTF-8: {}", err)))?;

    let value = serde_json::from_str::<Value>(text.trim_end())
        .map_err(|err| ParseError::Malformed(format!("payload is not JSON: {}", err)))?;

    let object = value
        .as_object()
        .ok_or_else(|| ParseError::Malformed(String::from("payload is not a JSON object")))?;

    let temperature = required_number(object, "temperature")?;
    let pressure = required_number(object, "pression")?;
    let humidity = required_number(object, "humidite")?;

    let luminosity = match object.get("luminosite") {
        Some(value) => Some(number(value, "luminosite")?),
        None => None,
    };

    let device_id = match object.get("device_id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(_) => {
            return Err(ParseError::Malformed(String::from(
                "field 'device_id' is not a string",
            )))
        }
        None if opts.require_device_id => return Err(ParseError::MissingField("device_id")),
        None => None,
    };

    let timestamp = match object.get("timestamp") {
        Some(value) => {
            let epoch = value.as_i64().ok_or_else(|| {
                ParseError::Malformed(String::from("field 'timestamp' is not an integer"))
            })?;
            Utc.timestamp_opt(epoch, 0).single().ok_or_else(|| {
                ParseError::Malformed(format!("field 'timestamp' is out of range: {}", epoch))
            })?
        }
        None => received,
    };

    Ok(Reading {
        timestamp,
        device_id,
        temperature,
        pressure,
        humidity,
        luminosity,
    })
}

fn required_number(
    object: &serde_json::Map<String, Value>,
    name: &'static str,
) -> Result<f64, ParseError> {
    match object.get(name) {
        Some(value) => number(value, name),
        None => Err(ParseError::MissingField(name)),
    }
}

fn number(value: &Value, name: &'static str) -> Result<f64, ParseError> {
    let number = value
        .as_f64()
        .ok_or_else(|| ParseError::Malformed(format!("field '{}' is not a number", name)))?;
    if !number.is_finite() {
        return Err(ParseError::NonFinite(name));
    }
    Ok(number)
}
