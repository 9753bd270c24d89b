// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::client::{Fetch, HttpFetcher, fetch_within};
use crate::protocol::{CanonicalWeather, Protocol, ProtocolCurrent,
    ProtocolLegacy, Shape, classify, normalize};
use crate::{Coordinates, Error, ErrorKind};
use serde_derive::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use url::Url;

/// A coordinate as sent by a caller, who may use a number or a string.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CoordinateValue {
    Number(f64),
    Text(String),
}

impl CoordinateValue {
    fn to_degrees(&self) -> Option<f64> {
        let degrees = match self {
            CoordinateValue::Number(v) => *v,
            CoordinateValue::Text(s) => s.trim().parse().ok()?,
        };
        Some(degrees).filter(|v| v.is_finite())
    }
}

impl From<f64> for CoordinateValue {
    fn from(v: f64) -> Self {CoordinateValue::Number(v)}
}

impl From<&str> for CoordinateValue {
    fn from(s: &str) -> Self {CoordinateValue::Text(s.to_string())}
}

impl From<String> for CoordinateValue {
    fn from(s: String) -> Self {CoordinateValue::Text(s)}
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct WeatherRequest {
    #[serde(default)]
    pub lat: Option<CoordinateValue>,
    #[serde(default)]
    pub lon: Option<CoordinateValue>,
}

impl WeatherRequest {
    pub fn new<A, B>(lat: A, lon: B) -> Self
    where
        A: Into<CoordinateValue>,
        B: Into<CoordinateValue>,
    {
        WeatherRequest {lat: Some(lat.into()), lon: Some(lon.into())}
    }

    /// Ranges are not checked. Out of range values go to the provider as is.
    pub fn coordinates(&self) -> Result<Coordinates, Error> {
        let degrees = |v: &Option<CoordinateValue>| {
            v.as_ref().and_then(CoordinateValue::to_degrees)
        };
        match (degrees(&self.lat), degrees(&self.lon)) {
            (Some(latitude), Some(longitude)) => {
                Ok(Coordinates {latitude, longitude})
            }
            _ => Err(Error::detailed(ErrorKind::InvalidArgument,
                "lat/lon must be numbers")),
        }
    }
}

/// Answers weather queries from the forecast provider.
#[derive(Debug)]
pub struct WeatherService<F = HttpFetcher> {
    fetcher: F,
    endpoint: Url,
    timeout: Duration,
}

impl<F: Fetch> WeatherService<F> {
    pub const DEFAULT_ENDPOINT: &'static str =
        "https://api.open-meteo.com/v1/forecast";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);

    pub fn new(fetcher: F, endpoint: Url, timeout: Duration) -> Self {
        WeatherService {fetcher, endpoint, timeout}
    }

    /// Validates, fetches and normalizes. Unless the primary query comes
    /// back in the `current` shape, the legacy query is tried once and its
    /// answer is used instead.
    #[instrument(skip_all, fields(lat = ?request.lat, lon = ?request.lon))]
    pub async fn get_weather(
        &self,
        request: &WeatherRequest,
        deadline: Option<Instant>,
    ) -> Result<CanonicalWeather, Error> {
        let coords = request.coordinates()?;
        let primary = self.fetch(&ProtocolCurrent, coords, deadline).await?;
        let shape = classify(&primary);
        let is_current = matches!(shape, Shape::Current {..});
        debug!(shape = shape.name(), "primary response classified");
        let payload = if is_current {
            primary
        } else {
            debug!("trying legacy query");
            self.fetch(&ProtocolLegacy, coords, deadline).await?
        };
        let weather = normalize(&payload).map_err(|e| {
            warn!(error = %e, "provider response matches no known schema");
            Error::from(e)
        })?;
        debug!(?weather, "normalized");
        Ok(weather)
    }

    async fn fetch<P: Protocol>(
        &self,
        protocol: &P,
        coords: Coordinates,
        deadline: Option<Instant>,
    ) -> Result<Value, Error> {
        let url = protocol.request(&self.endpoint, coords);
        fetch_within(&self.fetcher, url, self.timeout, deadline).await
            .map_err(|e| {
                warn!(error = %e, "forecast fetch failed");
                Error::from(e)
            })
    }
}
