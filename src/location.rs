// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::client::{Fetch, HttpFetcher, fetch_within};
use crate::protocol::coerce_or_default;
use crate::{Error, ErrorKind};
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{instrument, warn};
use url::Url;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct LocationCoordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct LocationRequest {
    #[serde(default)]
    pub ip: String,
}

impl LocationRequest {
    pub fn new<S: Into<String>>(ip: S) -> Self {
        LocationRequest {ip: ip.into()}
    }
}

/// Looks up the coordinates of an IP address.
#[derive(Debug)]
pub struct LocationService<F = HttpFetcher> {
    fetcher: F,
    endpoint: Url,
    timeout: Duration,
}

impl<F: Fetch> LocationService<F> {
    pub const DEFAULT_ENDPOINT: &'static str = "https://ipwho.is";
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(fetcher: F, endpoint: Url, timeout: Duration) -> Self {
        LocationService {fetcher, endpoint, timeout}
    }

    fn request_url(&self, ip: &str) -> Result<Url, Error> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| Error::detailed(ErrorKind::Internal,
                "geolocation endpoint cannot take a path"))?
            .pop_if_empty()
            .push(ip);
        url.query_pairs_mut().append_pair("fields", "latitude,longitude");
        Ok(url)
    }

    /// Missing coordinates in the provider answer are reported as 0.0.
    #[instrument(skip_all, fields(ip = %request.ip))]
    pub async fn get_location(
        &self,
        request: &LocationRequest,
        deadline: Option<Instant>,
    ) -> Result<LocationCoordinates, Error> {
        let ip = request.ip.trim();
        if ip.is_empty() {
            return Err(Error::detailed(ErrorKind::InvalidArgument,
                "IP address is required"))
        }
        let url = self.request_url(ip)?;
        let payload = fetch_within(&self.fetcher, url, self.timeout, deadline)
            .await
            .map_err(|e| {
                warn!(error = %e, "geolocation fetch failed");
                Error::from(e)
            })?;
        Ok(LocationCoordinates {
            lat: coerce_or_default(payload.get("latitude")),
            lon: coerce_or_default(payload.get("longitude")),
        })
    }
}
