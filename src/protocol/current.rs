// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::Coordinates;
use crate::protocol::{CanonicalWeather, DEFAULT_UNIT_TEMPERATURE,
    DEFAULT_UNIT_WINDSPEED, Protocol, coerce_or_default, text_or_empty};
use serde_json::{Map, Value};
use url::Url;

const CURRENT_FIELDS: &str =
    "temperature_2m,wind_speed_10m,relative_humidity_2m,precipitation";

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProtocolCurrent;

impl Protocol for ProtocolCurrent {
    fn request(&self, endpoint: &Url, coords: Coordinates) -> Url {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("latitude", &coords.latitude.to_string())
            .append_pair("longitude", &coords.longitude.to_string())
            .append_pair("current", CURRENT_FIELDS)
            .append_pair("wind_speed_unit", "kmh")
            .append_pair("precipitation_unit", "mm")
            .append_pair("timezone", "auto");
        url
    }
}

pub(super) fn extract(current: &Map<String, Value>, units: &Map<String, Value>)
    -> CanonicalWeather
{
    let unit = |key: &str, default: &str| {
        units.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
    };
    CanonicalWeather {
        temperature: coerce_or_default(current.get("temperature_2m")),
        windspeed: coerce_or_default(current.get("wind_speed_10m")),
        humidity: coerce_or_default(current.get("relative_humidity_2m")),
        precipitation: coerce_or_default(current.get("precipitation")),
        observation_time: text_or_empty(current.get("time")),
        unit_temperature: unit("temperature_2m", DEFAULT_UNIT_TEMPERATURE),
        unit_windspeed: unit("wind_speed_10m", DEFAULT_UNIT_WINDSPEED),
    }
}
