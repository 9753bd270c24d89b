// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

mod current;
mod legacy;

pub(crate) use self::current::ProtocolCurrent;
pub(crate) use self::legacy::ProtocolLegacy;

use crate::Coordinates;
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

pub(crate) const DEFAULT_UNIT_TEMPERATURE: &str = "°C";
pub(crate) const DEFAULT_UNIT_WINDSPEED: &str = "km/h";

/// A forecast query understood by the provider.
pub(crate) trait Protocol {
    fn request(&self, endpoint: &Url, coords: Coordinates) -> Url;
}

/// Current conditions, identical whichever provider schema they came from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CanonicalWeather {
    pub temperature: f64,
    pub windspeed: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Precipitation in millimeters.
    pub precipitation: f64,
    /// Provider timestamp, passed through untouched.
    pub observation_time: String,
    pub unit_temperature: String,
    pub unit_windspeed: String,
}

/// The provider response schemas this crate knows about.
#[derive(Debug, PartialEq)]
pub enum Shape<'a> {
    /// `current` with `current_units`.
    Current {
        current: &'a Map<String, Value>,
        units: &'a Map<String, Value>,
    },
    /// Non-empty `current_weather`, without units.
    Legacy {
        current_weather: &'a Map<String, Value>,
    },
    Unrecognized,
}

impl Shape<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Shape::Current {..} => "current",
            Shape::Legacy {..} => "current_weather",
            Shape::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("unexpected provider response")]
    Unrecognized,
}

/// Decides which schema `payload` follows. The `current` schema wins when a
/// payload carries both.
pub fn classify(payload: &Value) -> Shape<'_> {
    let current = payload.get("current").and_then(Value::as_object);
    let units = payload.get("current_units").and_then(Value::as_object);
    if let (Some(current), Some(units)) = (current, units) {
        return Shape::Current {current, units}
    }
    match payload.get("current_weather").and_then(Value::as_object) {
        Some(current_weather) if !current_weather.is_empty() => {
            Shape::Legacy {current_weather}
        }
        _ => Shape::Unrecognized,
    }
}

pub fn normalize(payload: &Value) -> Result<CanonicalWeather, SchemaError> {
    match classify(payload) {
        Shape::Current {current, units} => Ok(current::extract(current, units)),
        Shape::Legacy {current_weather} => Ok(legacy::extract(current_weather)),
        Shape::Unrecognized => Err(SchemaError::Unrecognized),
    }
}

/// Reads a numeric field, falling back to 0.0 when it is missing, not a
/// number, or not finite. Numeric strings are accepted.
pub fn coerce_or_default(value: Option<&Value>) -> f64 {
    let coerced = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b {1.0} else {0.0}),
        _ => None,
    };
    coerced.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn text_or_empty(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}
