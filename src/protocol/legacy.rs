// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::Coordinates;
use crate::protocol::{CanonicalWeather, DEFAULT_UNIT_TEMPERATURE,
    DEFAULT_UNIT_WINDSPEED, Protocol, coerce_or_default, text_or_empty};
use serde_json::{Map, Value};
use url::Url;

/// The older `current_weather=true` query. Its answers carry no units.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProtocolLegacy;

impl Protocol for ProtocolLegacy {
    fn request(&self, endpoint: &Url, coords: Coordinates) -> Url {
        let mut url = endpoint.clone();
        url.query_pairs_mut()
            .append_pair("latitude", &coords.latitude.to_string())
            .append_pair("longitude", &coords.longitude.to_string())
            .append_pair("current_weather", "true")
            .append_pair("windspeed_unit", "kmh");
        url
    }
}

pub(super) fn extract(current_weather: &Map<String, Value>) -> CanonicalWeather {
    CanonicalWeather {
        temperature: coerce_or_default(current_weather.get("temperature")),
        windspeed: coerce_or_default(current_weather.get("windspeed")),
        humidity: coerce_or_default(current_weather.get("relative_humidity")),
        precipitation: coerce_or_default(current_weather.get("precipitation")),
        observation_time: text_or_empty(current_weather.get("time")),
        unit_temperature: DEFAULT_UNIT_TEMPERATURE.to_string(),
        unit_windspeed: DEFAULT_UNIT_WINDSPEED.to_string(),
    }
}
