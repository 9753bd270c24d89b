// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::gateway::{GatewayError, client_ip};
use crate::{Error, ErrorKind, Gateway, HttpFetcher, LocationRequest,
    LocationService, WeatherRequest, WeatherService};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{Display, self};
use std::future::Future;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use url::Url;

/// Header carrying the caller's remaining time budget in milliseconds.
pub const DEADLINE_HEADER: &str = "x-request-timeout-ms";

const MAX_REQUEST_BODY: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceKind {
    Weather,
    Location,
    Gateway,
}

impl ServiceKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "weather" => Some(ServiceKind::Weather),
            "location" => Some(ServiceKind::Location),
            "gateway" => Some(ServiceKind::Gateway),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceKind::Weather => "weather",
            ServiceKind::Location => "location",
            ServiceKind::Gateway => "gateway",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            ServiceKind::Weather => 50052,
            ServiceKind::Location => 50051,
            ServiceKind::Gateway => 3000,
        }
    }

    /// Environment variable overriding the default port.
    pub fn port_var(&self) -> &'static str {
        match self {
            ServiceKind::Weather => "WEATHER_PORT",
            ServiceKind::Location => "LOCATION_PORT",
            ServiceKind::Gateway => "GATEWAY_PORT",
        }
    }
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServiceBuilder {
    #[serde(default = "ServiceBuilder::default_ip")]
    ip: IpAddr,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "ServiceBuilder::default_workers")]
    workers: usize,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    endpoint: Option<Url>,
    #[serde(default)]
    location_service: Option<Url>,
    #[serde(default)]
    weather_service: Option<Url>,
    #[serde(default = "ServiceBuilder::default_shutdown_grace_ms")]
    shutdown_grace_ms: u64,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        ServiceBuilder {
            ip: Self::default_ip(),
            port: None,
            workers: Self::default_workers(),
            timeout_ms: None,
            endpoint: None,
            location_service: None,
            weather_service: None,
            shutdown_grace_ms: Self::default_shutdown_grace_ms(),
        }
    }
}

impl ServiceBuilder {
    pub const DEFAULT_IP: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
    pub const DEFAULT_WORKERS: usize = 10;
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

    fn default_ip() -> IpAddr {
        Self::DEFAULT_IP.into()
    }

    fn default_workers() -> usize {
        Self::DEFAULT_WORKERS
    }

    fn default_shutdown_grace_ms() -> u64 {
        Self::DEFAULT_SHUTDOWN_GRACE.as_millis() as u64
    }

    pub fn ip(mut self, a: IpAddr) -> Self {
        self.ip = a;
        self
    }

    pub fn port(mut self, p: u16) -> Self {
        self.port = Some(p);
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout_ms = Some(t.as_millis() as u64);
        self
    }

    pub fn endpoint(mut self, u: Url) -> Self {
        self.endpoint = Some(u);
        self
    }

    /// Location service the gateway calls.
    pub fn location_service(mut self, u: Url) -> Self {
        self.location_service = Some(u);
        self
    }

    /// Weather service the gateway calls.
    pub fn weather_service(mut self, u: Url) -> Self {
        self.weather_service = Some(u);
        self
    }

    pub fn shutdown_grace(mut self, t: Duration) -> Self {
        self.shutdown_grace_ms = t.as_millis() as u64;
        self
    }

    pub fn get_address(&self, kind: ServiceKind) -> SocketAddr {
        (self.ip, self.port.unwrap_or_else(|| kind.default_port())).into()
    }

    /// Size of the worker pool, never less than one.
    pub fn get_workers(&self) -> usize {
        self.workers.max(1)
    }

    pub fn from_config<R: Read>(config: R) -> Result<Self, serde_json::Error> {
        serde_json::from_reader(config)
    }

    fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map_or(default, Duration::from_millis)
    }

    /// Binds the listening socket. The returned server does not accept
    /// connections until it is run.
    pub async fn bind(self, kind: ServiceKind) -> Result<Server, Error> {
        let fetcher = HttpFetcher::new()?;
        let handler = match kind {
            ServiceKind::Weather => {
                let endpoint = url_or(self.endpoint.as_ref(),
                    <WeatherService>::DEFAULT_ENDPOINT)?;
                let timeout = self.timeout_or(<WeatherService>::DEFAULT_TIMEOUT);
                Handler::Weather(WeatherService::new(fetcher, endpoint, timeout))
            }
            ServiceKind::Location => {
                let endpoint = url_or(self.endpoint.as_ref(),
                    <LocationService>::DEFAULT_ENDPOINT)?;
                let timeout =
                    self.timeout_or(<LocationService>::DEFAULT_TIMEOUT);
                Handler::Location(LocationService::new(fetcher, endpoint,
                    timeout))
            }
            ServiceKind::Gateway => {
                let location = url_or(self.location_service.as_ref(),
                    <Gateway>::DEFAULT_LOCATION_SERVICE)?;
                let weather = url_or(self.weather_service.as_ref(),
                    <Gateway>::DEFAULT_WEATHER_SERVICE)?;
                let timeout = self.timeout_or(<Gateway>::DEFAULT_TIMEOUT);
                Handler::Gateway(Gateway::new(fetcher, location, weather,
                    timeout))
            }
        };
        let listener = TcpListener::bind(self.get_address(kind)).await?;
        Ok(Server {
            listener,
            handler: Arc::new(handler),
            limit: Arc::new(Semaphore::new(self.get_workers())),
            grace: Duration::from_millis(self.shutdown_grace_ms),
        })
    }
}

fn url_or(configured: Option<&Url>, default: &str) -> Result<Url, Error> {
    match configured {
        Some(url) => Ok(url.clone()),
        None => Url::parse(default)
            .map_err(|e| Error::new(ErrorKind::Internal, e)),
    }
}

#[derive(Debug)]
enum Handler {
    Weather(WeatherService),
    Location(LocationService),
    Gateway(Gateway),
}

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    handler: Arc<Handler>,
    limit: Arc<Semaphore>,
    grace: Duration,
}

impl Server {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` completes, then lets open connections finish
    /// within the grace period.
    pub async fn run<S>(self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let Server {listener, handler, limit, grace} = self;
        let graceful = GracefulShutdown::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue
                        }
                    };
                    let handler = handler.clone();
                    let limit = limit.clone();
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        let limit = limit.clone();
                        async move {
                            let deadline = caller_deadline(req.headers());
                            let _permit = limit.acquire().await;
                            Ok::<_, Infallible>(
                                reply(&handler, req, peer, deadline).await)
                        }
                    });
                    let conn = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service);
                    let conn = graceful.watch(conn);
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(%peer, error = %e, "connection error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    info!("shutting down");
                    break
                }
            }
        }
        drop(listener);
        tokio::select! {
            _ = graceful.shutdown() => info!("all connections closed"),
            _ = tokio::time::sleep(grace) => {
                warn!(?grace, "grace period elapsed, dropping connections")
            }
        }
    }
}

async fn reply(handler: &Handler, req: Request<Incoming>, peer: SocketAddr,
    deadline: Option<Instant>) -> Response<Full<Bytes>>
{
    let method = req.method().clone();
    let uri = req.uri().clone();
    debug!(%method, %uri, "request");
    match (&method, uri.path(), handler) {
        (&Method::GET, "/health", _) => {
            respond::<_>(&Ok(Health {ok: true}))
        }
        (&Method::GET, "/weather", Handler::Weather(service)) => {
            let request = WeatherRequest {
                lat: query_param(&uri, "lat").map(Into::into),
                lon: query_param(&uri, "lon").map(Into::into),
            };
            respond(&service.get_weather(&request, deadline).await)
        }
        (&Method::POST, "/weather", Handler::Weather(service)) => {
            match read_json::<WeatherRequest>(req).await {
                Ok(request) => {
                    respond(&service.get_weather(&request, deadline).await)
                }
                Err(e) => respond::<()>(&Err(e)),
            }
        }
        (&Method::GET, "/location", Handler::Location(service)) => {
            let request = LocationRequest {
                ip: query_param(&uri, "ip").unwrap_or_default(),
            };
            respond(&service.get_location(&request, deadline).await)
        }
        (&Method::POST, "/location", Handler::Location(service)) => {
            match read_json::<LocationRequest>(req).await {
                Ok(request) => {
                    respond(&service.get_location(&request, deadline).await)
                }
                Err(e) => respond::<()>(&Err(e)),
            }
        }
        (&Method::GET, "/location", Handler::Gateway(gateway)) => {
            let ip = client_ip(query_param(&uri, "ip").as_deref(),
                req.headers(), peer.ip());
            respond_gateway(gateway.get_location(&ip, deadline).await)
        }
        (&Method::GET, "/weather", Handler::Gateway(gateway)) => {
            let ip = client_ip(query_param(&uri, "ip").as_deref(),
                req.headers(), peer.ip());
            respond_gateway(gateway.get_weather(&ip, deadline).await)
        }
        _ => respond::<()>(&Err(Error::detailed(ErrorKind::InvalidArgument,
            format!("no route for {} {}", method, uri.path())))),
    }
}

#[derive(Serialize)]
struct Health {
    ok: bool,
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query().unwrap_or("");
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn caller_deadline(headers: &HeaderMap) -> Option<Instant> {
    let millis = headers.get(DEADLINE_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Instant::now() + Duration::from_millis(millis))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>)
    -> Result<T, Error>
{
    let body = Limited::new(req.into_body(), MAX_REQUEST_BODY)
        .collect()
        .await
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, e))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| Error::new(ErrorKind::InvalidArgument, e))
}

fn status_of(kind: &ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(r: &Result<T, Error>) -> Response<Full<Bytes>> {
    let status = match r {
        Ok(_) => StatusCode::OK,
        Err(e) => status_of(e.kind()),
    };
    respond_with(status, r)
}

fn respond_gateway<T: Serialize>(r: Result<T, GatewayError>)
    -> Response<Full<Bytes>>
{
    match r {
        Ok(v) => respond::<T>(&Ok(v)),
        Err(e) => {
            let status = e.status();
            respond_with::<()>(status, &Err(e.into_error()))
        }
    }
}

fn respond_with<T: Serialize>(status: StatusCode, r: &Result<T, Error>)
    -> Response<Full<Bytes>>
{
    if let Err(e) = r {
        debug!(kind = ?e.kind(), detail = e.detail(), "request failed");
    }
    let (status, body) = match serde_json::to_vec_pretty(r) {
        Ok(body) => (status, body),
        Err(e) => {
            error!(error = %e, "failed to serialize reply");
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new())
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"));
    response
}
