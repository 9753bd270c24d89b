// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

#![deny(warnings)]

mod client;
mod err;
mod gateway;
mod location;
mod protocol;
mod service;
mod weather;

pub use crate::client::{Fetch, FetchError, HttpFetcher};
pub use crate::err::{Error, ErrorKind};
pub use crate::gateway::{Gateway, GatewayError, IpLocation, IpWeather, Units,
    WeatherReport};
pub use crate::location::{LocationCoordinates, LocationRequest,
    LocationService};
pub use crate::protocol::{CanonicalWeather, SchemaError, Shape, classify,
    coerce_or_default, normalize};
pub use crate::service::{DEADLINE_HEADER, Server, ServiceBuilder,
    ServiceKind};
pub use crate::weather::{CoordinateValue, WeatherRequest, WeatherService};

/// Latitude and longitude in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}
