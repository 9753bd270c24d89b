// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::client::{Fetch, FetchError, HttpFetcher, fetch_within};
use crate::{CanonicalWeather, Error, ErrorKind, LocationCoordinates};
use hyper::StatusCode;
use hyper::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error as StdError;
use std::fmt::{Display, self};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};
use url::Url;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IpLocation {
    pub ip: String,
    pub coordinates: LocationCoordinates,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IpWeather {
    pub ip: String,
    pub coordinates: LocationCoordinates,
    pub weather: WeatherReport,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeatherReport {
    pub temperature: f64,
    pub windspeed: f64,
    pub humidity: f64,
    pub precipitation: f64,
    pub observation_time: String,
    pub units: Units,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Units {
    pub temperature: String,
    pub windspeed: String,
}

impl From<CanonicalWeather> for WeatherReport {
    fn from(w: CanonicalWeather) -> Self {
        WeatherReport {
            temperature: w.temperature,
            windspeed: w.windspeed,
            humidity: w.humidity,
            precipitation: w.precipitation,
            observation_time: w.observation_time,
            units: Units {
                temperature: w.unit_temperature,
                windspeed: w.unit_windspeed,
            },
        }
    }
}

/// Failure of one of the two upstream services, tagged with which one.
#[derive(Debug)]
pub enum GatewayError {
    Location(Error),
    Weather(Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Location(_) => StatusCode::BAD_REQUEST,
            GatewayError::Weather(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn into_error(self) -> Error {
        match self {
            GatewayError::Location(e) | GatewayError::Weather(e) => e,
        }
    }
}

impl Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GatewayError::Location(e) => write!(f, "Location service: {}", e),
            GatewayError::Weather(e) => write!(f, "Weather service: {}", e),
        }
    }
}

impl StdError for GatewayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            GatewayError::Location(e) | GatewayError::Weather(e) => Some(e),
        }
    }
}

/// A reply from one of the services, as `respond` writes it.
#[derive(Debug, Deserialize)]
enum Reply<T> {
    Ok(T),
    Err(RemoteError),
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    kind: ErrorKind,
    detail: String,
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Error {
        Error::detailed(e.kind, e.detail)
    }
}

fn unwrap_reply<T: DeserializeOwned>(payload: Value) -> Result<T, Error> {
    match serde_json::from_value::<Reply<T>>(payload) {
        Ok(Reply::Ok(v)) => Ok(v),
        Ok(Reply::Err(e)) => Err(e.into()),
        Err(e) => Err(Error::new(ErrorKind::Internal, e)),
    }
}

/// Keeps the upstream service's own error when its reply body carries one.
fn remote_failure(e: FetchError) -> Error {
    if let FetchError::UpstreamHttp {body, ..} = &e {
        if let Ok(Reply::<Value>::Err(remote)) = serde_json::from_str(body) {
            return remote.into()
        }
    }
    Error::from(e)
}

fn service_url(base: &Url, route: &str) -> Result<Url, Error> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| Error::detailed(ErrorKind::Internal,
            "service address cannot take a path"))?
        .pop_if_empty()
        .push(route);
    Ok(url)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn non_empty(s: &str) -> Option<String> {
    Some(s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

/// The `ip` query parameter if given, else the first `X-Forwarded-For`
/// entry, else `X-Real-IP`, else the peer address.
pub(crate) fn client_ip(query: Option<&str>, headers: &HeaderMap, peer: IpAddr)
    -> String
{
    query.and_then(non_empty)
        .or_else(|| {
            header(headers, "x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .and_then(non_empty)
        })
        .or_else(|| header(headers, "x-real-ip").and_then(non_empty))
        .unwrap_or_else(|| peer.to_string())
}

/// Front door chaining the location and weather services.
#[derive(Debug)]
pub struct Gateway<F = HttpFetcher> {
    fetcher: F,
    location_service: Url,
    weather_service: Url,
    timeout: Duration,
}

impl<F: Fetch> Gateway<F> {
    pub const DEFAULT_LOCATION_SERVICE: &'static str =
        "http://location-service:50051";
    pub const DEFAULT_WEATHER_SERVICE: &'static str =
        "http://weather-service:50052";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(fetcher: F, location_service: Url, weather_service: Url,
        timeout: Duration) -> Self
    {
        Gateway {fetcher, location_service, weather_service, timeout}
    }

    async fn call<T: DeserializeOwned>(&self, url: Url,
        deadline: Option<Instant>) -> Result<T, Error>
    {
        let payload = fetch_within(&self.fetcher, url, self.timeout, deadline)
            .await
            .map_err(remote_failure)?;
        unwrap_reply(payload)
    }

    async fn locate(&self, ip: &str, deadline: Option<Instant>)
        -> Result<LocationCoordinates, GatewayError>
    {
        if ip.is_empty() {
            return Err(GatewayError::Location(Error::detailed(
                ErrorKind::InvalidArgument, "IP address is required")))
        }
        let mut url = service_url(&self.location_service, "location")
            .map_err(GatewayError::Location)?;
        url.query_pairs_mut().append_pair("ip", ip);
        self.call(url, deadline).await.map_err(|e| {
            warn!(error = %e, "location service failed");
            GatewayError::Location(e)
        })
    }

    #[instrument(skip(self, deadline))]
    pub async fn get_location(&self, ip: &str, deadline: Option<Instant>)
        -> Result<IpLocation, GatewayError>
    {
        let coordinates = self.locate(ip, deadline).await?;
        Ok(IpLocation {ip: ip.to_string(), coordinates})
    }

    #[instrument(skip(self, deadline))]
    pub async fn get_weather(&self, ip: &str, deadline: Option<Instant>)
        -> Result<IpWeather, GatewayError>
    {
        let coordinates = self.locate(ip, deadline).await?;
        let mut url = service_url(&self.weather_service, "weather")
            .map_err(GatewayError::Weather)?;
        url.query_pairs_mut()
            .append_pair("lat", &coordinates.lat.to_string())
            .append_pair("lon", &coordinates.lon.to_string());
        let weather = self.call::<CanonicalWeather>(url, deadline).await
            .map_err(|e| {
                warn!(error = %e, "weather service failed");
                GatewayError::Weather(e)
            })?;
        Ok(IpWeather {
            ip: ip.to_string(),
            coordinates,
            weather: weather.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::stub::StubFetcher;
    use hyper::header::HeaderValue;
    use serde_json::json;
    use std::net::Ipv4Addr;

    fn gateway<F: Fetch>(fetcher: F) -> Gateway<F> {
        Gateway::new(
            fetcher,
            Url::parse("http://location.test:50051").unwrap(),
            Url::parse("http://weather.test:50052/").unwrap(),
            Duration::from_millis(200),
        )
    }

    fn weather_reply() -> Value {
        json!({"Ok": {
            "temperature": 18.3,
            "windspeed": 11.2,
            "humidity": 64.0,
            "precipitation": 0.4,
            "observation_time": "2024-05-01T12:00",
            "unit_temperature": "°C",
            "unit_windspeed": "km/h",
        }})
    }

    fn upstream_error(status: StatusCode, kind: &str, detail: &str)
        -> FetchError
    {
        let body = json!({"Err": {"kind": kind, "detail": detail, "cause": []}});
        FetchError::UpstreamHttp {status, body: body.to_string()}
    }

    #[tokio::test]
    async fn chains_location_into_weather() {
        let stub = StubFetcher::new(|url: &Url| {
            if url.path() == "/location" {
                Ok(json!({"Ok": {"lat": 37.5, "lon": -122.25}}))
            } else {
                Ok(weather_reply())
            }
        });
        let gw = gateway(stub);
        let report = gw.get_weather("8.8.8.8", None).await.unwrap();
        assert_eq!(report.ip, "8.8.8.8");
        assert_eq!(report.coordinates, LocationCoordinates {
            lat: 37.5,
            lon: -122.25,
        });
        assert_eq!(report.weather.precipitation, 0.4);
        assert_eq!(report.weather.units, Units {
            temperature: "°C".into(),
            windspeed: "km/h".into(),
        });
        let urls = gw.fetcher.urls();
        assert_eq!(urls[0].as_str(), "http://location.test:50051/location?ip=8.8.8.8");
        assert_eq!(urls[1].as_str(),
            "http://weather.test:50052/weather?lat=37.5&lon=-122.25");
    }

    #[tokio::test]
    async fn location_failure_stops_the_chain() {
        let stub = StubFetcher::new(|_: &Url| {
            Err(upstream_error(StatusCode::SERVICE_UNAVAILABLE, "Unavailable",
                "provider down"))
        });
        let gw = gateway(stub);
        let err = gw.get_weather("8.8.8.8", None).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = err.into_error();
        assert_eq!(*err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.detail(), "provider down");
        assert_eq!(gw.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn weather_failure_is_a_bad_gateway() {
        let stub = StubFetcher::new(|url: &Url| {
            if url.path() == "/location" {
                Ok(json!({"Ok": {"lat": 1.0, "lon": 2.0}}))
            } else {
                Err(upstream_error(StatusCode::GATEWAY_TIMEOUT,
                    "DeadlineExceeded", "upstream provider timed out"))
            }
        });
        let gw = gateway(stub);
        let err = gw.get_weather("8.8.8.8", None).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(*err.into_error().kind(), ErrorKind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn unreadable_upstream_errors_fall_back_to_the_fetch_error() {
        let stub = StubFetcher::new(|_: &Url| Err(FetchError::UpstreamHttp {
            status: StatusCode::BAD_GATEWAY,
            body: "<html>".into(),
        }));
        let gw = gateway(stub);
        let err = gw.get_location("8.8.8.8", None).await.unwrap_err()
            .into_error();
        assert_eq!(*err.kind(), ErrorKind::Unavailable);
        assert!(err.detail().contains("502"));
    }

    #[tokio::test]
    async fn empty_ip_is_rejected_without_a_call() {
        let stub = StubFetcher::new(|_: &Url| Ok(json!({})));
        let gw = gateway(stub);
        let err = gw.get_location("", None).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(*err.into_error().kind(), ErrorKind::InvalidArgument);
        assert_eq!(gw.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn unexpected_reply_is_internal() {
        let stub = StubFetcher::new(|_: &Url| Ok(json!({"lat": 1.0})));
        let gw = gateway(stub);
        let err = gw.get_location("8.8.8.8", None).await.unwrap_err()
            .into_error();
        assert_eq!(*err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn client_ip_prefers_query_then_headers_then_peer() {
        let peer = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(None, &headers, peer), "192.0.2.9");
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.4"));
        assert_eq!(client_ip(None, &headers, peer), "198.51.100.4");
        headers.insert("x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"));
        assert_eq!(client_ip(None, &headers, peer), "203.0.113.7");
        assert_eq!(client_ip(Some(""), &headers, peer), "203.0.113.7");
        assert_eq!(client_ip(Some("8.8.8.8"), &headers, peer), "8.8.8.8");
    }
}
