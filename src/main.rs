// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

#![deny(warnings)]

use clap::{Arg, ArgMatches, Command, value_parser};
use std::env;
use std::error::Error;
use std::fmt::{Display, self};
use std::fs::File;
use std::io;
use std::net::AddrParseError;
use std::num::ParseIntError;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::{ParseError, Url};
use weatherapp::{Gateway, ServiceBuilder, ServiceKind};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

fn cli() -> Command {
    let address_help = format!("IP address to start service on (default: {})",
        ServiceBuilder::DEFAULT_IP);
    Command::new(APP_NAME)
        .version(APP_VERSION)
        .author(APP_AUTHORS)
        .about("Weather and IP location lookup services")
        .subcommand_required(true)
        .arg(
            Arg::new("ADDRESS")
                .short('a')
                .long("address")
                .global(true)
                .help(address_help)
        )
        .arg(
            Arg::new("PORT")
                .short('p')
                .long("port")
                .global(true)
                .value_parser(value_parser!(u16))
                .help("Port to start service on (overrides the environment)")
        )
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .long("config")
                .global(true)
                .help("Path to JSON configuration file")
        )
        .subcommand(
            Command::new("weather")
                .about("Serve current weather (port from WEATHER_PORT, \
                    default 50052)")
        )
        .subcommand(
            Command::new("location")
                .about("Serve IP geolocation (port from LOCATION_PORT, \
                    default 50051)")
        )
        .subcommand(
            Command::new("gateway")
                .about("Serve weather and location for the caller's IP (port \
                    from GATEWAY_PORT, default 3000)")
                .arg(
                    Arg::new("LOCATION_SERVICE")
                        .long("location-service")
                        .help("Location service URL (overrides \
                            LOCATION_SERVICE_HOST and LOCATION_SERVICE_PORT)")
                )
                .arg(
                    Arg::new("WEATHER_SERVICE")
                        .long("weather-service")
                        .help("Weather service URL (overrides \
                            WEATHER_SERVICE_HOST and WEATHER_SERVICE_PORT)")
                )
        )
}

/// Upstream address from a host and port variable pair, if either is set.
fn upstream_from_env(default: &str, host_var: &str, port_var: &str)
    -> Result<Option<Url>, AppError>
{
    let host = env::var(host_var).ok();
    let port = env::var(port_var).ok();
    if host.is_none() && port.is_none() {
        return Ok(None)
    }
    let mut url = Url::parse(default).map_err(AppError::BadUpstream)?;
    if let Some(host) = host {
        url.set_host(Some(host.trim())).map_err(AppError::BadUpstream)?;
    }
    if let Some(port) = port {
        let port = port.trim().parse().map_err(AppError::BadPort)?;
        url.set_port(Some(port))
            .map_err(|()| AppError::BadUpstream(ParseError::InvalidPort))?;
    }
    Ok(Some(url))
}

fn configure_gateway(matches: &ArgMatches, mut service: ServiceBuilder)
    -> Result<ServiceBuilder, AppError>
{
    if let Some(url) = upstream_from_env(<Gateway>::DEFAULT_LOCATION_SERVICE,
        "LOCATION_SERVICE_HOST", "LOCATION_SERVICE_PORT")?
    {
        service = service.location_service(url);
    }
    if let Some(url) = upstream_from_env(<Gateway>::DEFAULT_WEATHER_SERVICE,
        "WEATHER_SERVICE_HOST", "WEATHER_SERVICE_PORT")?
    {
        service = service.weather_service(url);
    }
    if let Some(url) = matches.get_one::<String>("LOCATION_SERVICE") {
        service = service.location_service(
            Url::parse(url).map_err(AppError::BadUpstream)?);
    }
    if let Some(url) = matches.get_one::<String>("WEATHER_SERVICE") {
        service = service.weather_service(
            Url::parse(url).map_err(AppError::BadUpstream)?);
    }
    Ok(service)
}

fn configure(matches: &ArgMatches, kind: ServiceKind)
    -> Result<ServiceBuilder, AppError>
{
    let mut service = match matches.get_one::<String>("CONFIG") {
        Some(path) => {
            let config_file = File::open(Path::new(path))
                .map_err(AppError::FailedToOpenConfigFile)?;
            ServiceBuilder::from_config(config_file)
                .map_err(AppError::BadConfigFile)?
        }
        None => ServiceBuilder::default(),
    };
    if let Ok(port) = env::var(kind.port_var()) {
        service = service.port(port.trim().parse().map_err(AppError::BadPort)?);
    }
    if let Some(ip) = matches.get_one::<String>("ADDRESS") {
        service = service.ip(ip.parse().map_err(AppError::BadAddress)?);
    }
    if let Some(port) = matches.get_one::<u16>("PORT") {
        service = service.port(*port);
    }
    if kind == ServiceKind::Gateway {
        service = configure_gateway(matches, service)?;
    }
    Ok(service)
}

fn run() -> Result<(), AppError> {
    let matches = cli().get_matches();
    let (name, sub_matches) = matches.subcommand()
        .ok_or(AppError::MissingService)?;
    let kind = ServiceKind::from_name(name)
        .ok_or_else(|| AppError::UnknownService(name.to_string()))?;
    let service = configure(sub_matches, kind)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(service.get_workers())
        .enable_all()
        .build()
        .map_err(AppError::FailedToStartRuntime)?;
    info!(service = %kind, address = %service.get_address(kind),
        workers = service.get_workers(), "starting");
    runtime.block_on(async move {
        let server = service.bind(kind).await?;
        info!(service = %kind, address = %server.local_addr()?, "listening");
        server.run(shutdown_signal()).await;
        Ok::<_, weatherapp::Error>(())
    })
    .map_err(AppError::ServiceError)
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for interrupt");
            futures::future::pending::<()>().await
        }
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                futures::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();
    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let code = if let Err(e) = run() {
        print_error(e);
        1
    } else {
        0
    };
    std::process::exit(code)
}

fn print_error(e: AppError) {
    eprintln!("Error: {}", e);
    let mut e: &dyn Error = &e;
    while let Some(cause) = e.source() {
        eprintln!("Because: {}", cause);
        e = cause;
    }
}

#[derive(Debug)]
enum AppError {
    BadAddress(AddrParseError),
    BadConfigFile(serde_json::Error),
    BadPort(ParseIntError),
    BadUpstream(ParseError),
    FailedToOpenConfigFile(io::Error),
    FailedToStartRuntime(io::Error),
    MissingService,
    ServiceError(weatherapp::Error),
    UnknownService(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AppError::BadAddress(_) => f.write_str("Bad address"),
            AppError::BadConfigFile(_) => f.write_str("Bad configuration file"),
            AppError::BadPort(_) => f.write_str("Bad port"),
            AppError::BadUpstream(_) => f.write_str("Bad upstream service URL"),
            AppError::FailedToOpenConfigFile(_) =>
                f.write_str("Failed to open configuration file"),
            AppError::FailedToStartRuntime(_) =>
                f.write_str("Failed to start runtime"),
            AppError::MissingService => f.write_str("No service given"),
            AppError::ServiceError(_) => f.write_str("Service error"),
            AppError::UnknownService(name) =>
                write!(f, "Unknown service '{}'", name),
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::BadAddress(e) => Some(e),
            AppError::BadConfigFile(e) => Some(e),
            AppError::BadPort(e) => Some(e),
            AppError::BadUpstream(e) => Some(e),
            AppError::FailedToOpenConfigFile(e) => Some(e),
            AppError::FailedToStartRuntime(e) => Some(e),
            AppError::MissingService => None,
            AppError::ServiceError(e) => Some(e),
            AppError::UnknownService(_) => None,
        }
    }
}
