//! All three services end to end: running servers in front of mock providers.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;
use weatherapp::{DEADLINE_HEADER, ServiceBuilder, ServiceKind};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Running {
    fn url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.task.await.unwrap();
    }
}

fn builder() -> ServiceBuilder {
    ServiceBuilder::default()
        .ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .port(0)
        .workers(4)
        .timeout(Duration::from_secs(5))
        .shutdown_grace(Duration::from_secs(1))
}

async fn start(kind: ServiceKind, builder: ServiceBuilder) -> Running {
    let server = builder.bind(kind).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));
    Running {addr, stop, task}
}

async fn call(req: Request<Full<Bytes>>) -> (StatusCode, Value) {
    let client = Client::builder(TokioExecutor::new())
        .build::<_, Full<Bytes>>(HttpConnector::new());
    let resp = client.request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(addr: SocketAddr, path_and_query: &str) -> Request<Full<Bytes>> {
    Request::get(format!("http://{}{}", addr, path_and_query))
        .body(Full::default())
        .unwrap()
}

fn post(addr: SocketAddr, path: &str, body: Value) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}{}", addr, path))
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn forecast_endpoint(provider: &MockServer) -> Url {
    Url::parse(&format!("{}/v1/forecast", provider.uri())).unwrap()
}

fn shape_a() -> Value {
    json!({
        "current": {
            "time": "2024-05-01T12:00",
            "temperature_2m": 18.3,
            "wind_speed_10m": 11.2,
            "relative_humidity_2m": 64,
            "precipitation": 0.0,
        },
        "current_units": {"temperature_2m": "°C", "wind_speed_10m": "km/h"},
    })
}

async fn start_weather(provider: &MockServer) -> Running {
    start(ServiceKind::Weather, builder().endpoint(forecast_endpoint(provider)))
        .await
}

async fn start_location(provider: &MockServer) -> Running {
    let endpoint = Url::parse(&provider.uri()).unwrap();
    start(ServiceKind::Location, builder().endpoint(endpoint)).await
}

#[tokio::test]
async fn weather_from_current_schema() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("timezone", "auto"))
        .and(query_param("latitude", "52.52"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shape_a()))
        .expect(1)
        .mount(&provider)
        .await;
    let running = start_weather(&provider).await;

    let (status, body) =
        call(get(running.addr, "/weather?lat=52.52&lon=13.41")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {
        "temperature": 18.3,
        "windspeed": 11.2,
        "humidity": 64.0,
        "precipitation": 0.0,
        "observation_time": "2024-05-01T12:00",
        "unit_temperature": "°C",
        "unit_windspeed": "km/h",
    }}));
    running.stop().await;
}

#[tokio::test]
async fn weather_falls_back_to_legacy_schema() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("timezone", "auto"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "latitude": 1.0,
        })))
        .expect(1)
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("current_weather", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "current_weather": {"temperature": 9.5, "windspeed": 3.1},
        })))
        .expect(1)
        .mount(&provider)
        .await;
    let running = start_weather(&provider).await;

    let (status, body) = call(post(running.addr, "/weather",
        json!({"lat": 1.0, "lon": "2.0"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Ok"]["temperature"], 9.5);
    assert_eq!(body["Ok"]["unit_windspeed"], "km/h");
    running.stop().await;
}

#[tokio::test]
async fn weather_errors_carry_kind_and_status() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&provider)
        .await;
    let running = start_weather(&provider).await;

    let (status, body) = call(get(running.addr, "/weather?lat=abc&lon=1"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Err"]["kind"], "InvalidArgument");

    let (status, body) = call(get(running.addr, "/weather?lat=1&lon=2")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["Err"]["kind"], "Unavailable");
    assert!(body["Err"]["detail"].as_str().unwrap().contains("503"));

    let (status, body) = call(post(running.addr, "/weather",
        json!("not an object"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Err"]["kind"], "InvalidArgument");

    let (status, _) = call(get(running.addr, "/location?ip=1.1.1.1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    running.stop().await;
}

#[tokio::test]
async fn caller_deadline_bounds_the_call() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200)
            .set_body_json(json!({}))
            .set_delay(Duration::from_secs(10)))
        .mount(&provider)
        .await;
    let running = start(ServiceKind::Weather, builder()
        .endpoint(forecast_endpoint(&provider))
        .timeout(Duration::from_secs(30))).await;

    let mut req = get(running.addr, "/weather?lat=1&lon=2");
    req.headers_mut().insert(DEADLINE_HEADER, "200".parse().unwrap());
    let started = Instant::now();
    let (status, body) = call(req).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["Err"]["kind"], "DeadlineExceeded");
    assert!(started.elapsed() < Duration::from_secs(5));
    running.stop().await;
}

#[tokio::test]
async fn one_worker_serves_one_call_at_a_time() {
    let delay = Duration::from_millis(400);
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200)
            .set_body_json(shape_a())
            .set_delay(delay))
        .expect(2)
        .mount(&provider)
        .await;
    let running = start(ServiceKind::Weather, builder()
        .workers(1)
        .endpoint(forecast_endpoint(&provider))).await;

    let started = Instant::now();
    let first = tokio::spawn(call(get(running.addr, "/weather?lat=1&lon=2")));
    let second = tokio::spawn(call(get(running.addr, "/weather?lat=3&lon=4")));
    let (first, _) = first.await.unwrap();
    let (second, _) = second.await.unwrap();
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert!(started.elapsed() >= delay * 2 - Duration::from_millis(50));
    running.stop().await;
}

#[tokio::test]
async fn stop_lets_in_flight_calls_finish() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200)
            .set_body_json(shape_a())
            .set_delay(Duration::from_millis(500)))
        .mount(&provider)
        .await;
    let running = start(ServiceKind::Weather, builder()
        .endpoint(forecast_endpoint(&provider))
        .shutdown_grace(Duration::from_secs(5))).await;
    let addr = running.addr;

    let pending = tokio::spawn(call(get(addr, "/weather?lat=1&lon=2")));
    tokio::time::sleep(Duration::from_millis(150)).await;
    let started = Instant::now();
    running.stop().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Ok"]["temperature"], 18.3);
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn location_lookup() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/8.8.8.8"))
        .and(query_param("fields", "latitude,longitude"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "latitude": 37.386,
            "longitude": -122.0838,
        })))
        .expect(2)
        .mount(&provider)
        .await;
    let running = start_location(&provider).await;

    let (status, body) = call(get(running.addr, "/location?ip=8.8.8.8")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {"lat": 37.386, "lon": -122.0838}}));

    let (_, body) = call(post(running.addr, "/location",
        json!({"ip": "8.8.8.8"}))).await;
    assert_eq!(body["Ok"]["lat"], 37.386);

    let (status, body) = call(get(running.addr, "/location")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Err"]["kind"], "InvalidArgument");
    running.stop().await;
}

#[tokio::test]
async fn health_check() {
    let provider = MockServer::start().await;
    let running = start_location(&provider).await;
    let (status, body) = call(get(running.addr, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {"ok": true}}));
    running.stop().await;
}

/// Location and weather services with their providers, and a gateway in
/// front of them.
struct Stack {
    geo: MockServer,
    forecast: MockServer,
    location: Running,
    weather: Running,
    gateway: Running,
}

impl Stack {
    async fn start() -> Stack {
        let geo = MockServer::start().await;
        let forecast = MockServer::start().await;
        let location = start_location(&geo).await;
        let weather = start_weather(&forecast).await;
        let gateway = start(ServiceKind::Gateway, builder()
            .location_service(location.url())
            .weather_service(weather.url())).await;
        Stack {geo, forecast, location, weather, gateway}
    }

    async fn locate(&self, ip: &str, lat: f64, lon: f64) {
        Mock::given(method("GET"))
            .and(path(format!("/{}", ip)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "latitude": lat,
                "longitude": lon,
            })))
            .mount(&self.geo)
            .await;
    }

    async fn stop(self) {
        self.gateway.stop().await;
        self.weather.stop().await;
        self.location.stop().await;
    }
}

#[tokio::test]
async fn gateway_chains_location_into_weather() {
    let stack = Stack::start().await;
    stack.locate("8.8.8.8", 37.5, -122.25).await;
    Mock::given(method("GET"))
        .and(path("/v1/forecast"))
        .and(query_param("latitude", "37.5"))
        .and(query_param("longitude", "-122.25"))
        .respond_with(ResponseTemplate::new(200).set_body_json(shape_a()))
        .expect(1)
        .mount(&stack.forecast)
        .await;

    let (status, body) =
        call(get(stack.gateway.addr, "/weather?ip=8.8.8.8")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {
        "ip": "8.8.8.8",
        "coordinates": {"lat": 37.5, "lon": -122.25},
        "weather": {
            "temperature": 18.3,
            "windspeed": 11.2,
            "humidity": 64.0,
            "precipitation": 0.0,
            "observation_time": "2024-05-01T12:00",
            "units": {"temperature": "°C", "windspeed": "km/h"},
        },
    }}));

    let (status, body) =
        call(get(stack.gateway.addr, "/location?ip=8.8.8.8")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Ok": {
        "ip": "8.8.8.8",
        "coordinates": {"lat": 37.5, "lon": -122.25},
    }}));
    stack.stop().await;
}

#[tokio::test]
async fn gateway_locates_the_forwarded_client() {
    let stack = Stack::start().await;
    stack.locate("203.0.113.7", 1.0, 2.0).await;
    stack.locate("127.0.0.1", 3.0, 4.0).await;

    let mut req = get(stack.gateway.addr, "/location");
    req.headers_mut().insert("x-forwarded-for",
        "203.0.113.7, 10.0.0.1".parse().unwrap());
    let (status, body) = call(req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Ok"]["ip"], "203.0.113.7");
    assert_eq!(body["Ok"]["coordinates"]["lat"], 1.0);

    let (status, body) = call(get(stack.gateway.addr, "/location")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Ok"]["ip"], "127.0.0.1");
    assert_eq!(body["Ok"]["coordinates"]["lon"], 4.0);
    stack.stop().await;
}

#[tokio::test]
async fn gateway_reports_which_service_failed() {
    let stack = Stack::start().await;
    stack.locate("8.8.8.8", 1.0, 2.0).await;
    Mock::given(method("GET"))
        .and(path("/10.0.0.1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&stack.geo)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&stack.forecast)
        .await;

    let (status, body) =
        call(get(stack.gateway.addr, "/weather?ip=10.0.0.1")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["Err"]["kind"], "Unavailable");
    assert!(body["Err"]["detail"].as_str().unwrap().contains("503"));

    let (status, body) =
        call(get(stack.gateway.addr, "/weather?ip=8.8.8.8")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["Err"]["kind"], "Unavailable");

    let (status, body) = call(get(stack.gateway.addr, "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Ok"]["ok"], true);
    stack.stop().await;
}
