// Copyright (C) 2018 Stephane Raux. Distributed under the MIT license.

use crate::{Error, ErrorKind};
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{header, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_tls::native_tls::TlsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde_json::Value;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

const USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const MAX_BODY_IN_ERROR: usize = 200;

/// Issues a single GET to a provider and decodes the JSON body.
///
/// Implementations must not retry. Exactly one request is attempted per call
/// and it must give up once `timeout` has elapsed.
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: Url, timeout: Duration)
        -> BoxFuture<'_, Result<Value, FetchError>>;
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream provider timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream provider returned HTTP {status}: {body}")]
    UpstreamHttp {
        status: StatusCode,
        body: String,
    },
    #[error("upstream provider unreachable")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
    #[error("upstream provider returned malformed JSON")]
    Decode(#[source] serde_json::Error),
    #[error("could not build upstream request")]
    Request(#[source] Box<dyn StdError + Send + Sync>),
}

#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, Error> {
        let tls = TlsConnector::new()
            .map_err(|e| Error::new(ErrorKind::Internal, e))?;
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let connector = HttpsConnector::from((http, tls.into()));
        let client = Client::builder(TokioExecutor::new())
            .build::<_, Empty<Bytes>>(connector);
        Ok(HttpFetcher {client})
    }

    async fn get(&self, url: Url) -> Result<Value, FetchError> {
        let uri = url.as_str().parse::<Uri>()
            .map_err(|e| FetchError::Request(e.into()))?;
        let req = Request::get(uri)
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .body(Empty::new())
            .map_err(|e| FetchError::Request(e.into()))?;
        let resp = self.client.request(req).await
            .map_err(|e| FetchError::Transport(e.into()))?;
        let status = resp.status();
        let body = resp.into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Transport(e.into()))?
            .to_bytes();
        debug!(%status, bytes = body.len(), "provider responded");
        if !status.is_success() {
            let body = String::from_utf8_lossy(&body);
            return Err(FetchError::UpstreamHttp {
                status,
                body: truncate_body(&body),
            })
        }
        serde_json::from_slice(&body).map_err(FetchError::Decode)
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: Url, timeout: Duration)
        -> BoxFuture<'_, Result<Value, FetchError>>
    {
        Box::pin(async move {
            match tokio::time::timeout(timeout, self.get(url)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(timeout)),
            }
        })
    }
}

/// Runs one fetch bounded by `timeout` and, if given, by the caller's
/// deadline, whichever comes first.
pub(crate) async fn fetch_within<F>(
    fetcher: &F,
    url: Url,
    timeout: Duration,
    deadline: Option<Instant>,
) -> Result<Value, FetchError>
where
    F: Fetch + ?Sized,
{
    let budget = match deadline {
        Some(deadline) => {
            deadline.saturating_duration_since(Instant::now()).min(timeout)
        }
        None => timeout,
    };
    if budget.is_zero() {
        return Err(FetchError::Timeout(budget))
    }
    debug!(%url, ?budget, "fetching");
    match tokio::time::timeout(budget, fetcher.fetch(url, budget)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(budget)),
    }
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() > MAX_BODY_IN_ERROR {
        let head = body.chars().take(MAX_BODY_IN_ERROR).collect::<String>();
        format!("{}...", head)
    } else {
        body.to_string()
    }
}
