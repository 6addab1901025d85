use std::time::Duration;

use http::Uri;
use hyper::body::HttpBody;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, StatusCode};
use hyper_tls::HttpsConnector;
use tokio::runtime::Runtime;

use crate::{Error, Result};

const MAX_ATTEMPTS: u32 = 3;
const MAX_REDIRECTS: u32 = 5;

enum FetchOutcome {
    Body(Vec<u8>),
    Status(StatusCode),
}

/// Blocking HTTP GET service. The async hyper client is driven by an owned
/// runtime so callers stay plain threads.
pub struct HttpService {
    client: Client<HttpsConnector<HttpConnector>>,
    runtime: Runtime,
    timeout: Duration,
}

impl HttpService {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|err| Error::Transport(format!("runtime: {}", err)))?;
        Ok(Self {
            client,
            runtime,
            timeout,
        })
    }

    /// Fetches `uri`, following redirects, with bounded retries on transport
    /// failures and 5xx responses. 4xx responses fail immediately.
    pub fn get(&self, uri: &str) -> Result<Vec<u8>> {
        self.get_with_bearer(uri, None)
    }

    /// `get` with an `Authorization: bearer` header. The token comes from
    /// the caller; this crate never talks to an identity service itself.
    pub fn get_with_bearer(&self, uri: &str, bearer: Option<&str>) -> Result<Vec<u8>> {
        let uri: Uri = uri
            .parse()
            .map_err(|_| Error::Transport(format!("bad url: {}", uri)))?;

        let mut last_failure = String::new();
        for _ in 0..MAX_ATTEMPTS {
            let attempt = self.runtime.block_on(async {
                tokio::time::timeout(self.timeout, self.get_once(uri.clone(), bearer)).await
            });
            match attempt {
                Ok(Ok(FetchOutcome::Body(body))) => return Ok(body),
                Ok(Ok(FetchOutcome::Status(status))) => {
                    if status.is_client_error() {
                        return Err(Error::Transport(format!("http {} for {}", status, uri)));
                    }
                    last_failure = format!("http {} for {}", status, uri);
                }
                Ok(Err(err)) => last_failure = err.to_string(),
                Err(_) => last_failure = format!("request timed out after {:?}", self.timeout),
            }
        }
        Err(Error::Transport(last_failure))
    }

    async fn get_once(&self, mut uri: Uri, bearer: Option<&str>) -> hyper::Result<FetchOutcome> {
        let mut redirects = 0;
        loop {
            let mut request = Request::builder().uri(uri.clone());
            if let Some(token) = bearer {
                request = request.header("Authorization", format!("bearer {}", token));
            }
            let request = request
                .body(Body::empty())
                .expect("GET request is always well formed");
            let mut response = self.client.request(request).await?;

            if response.status().is_redirection() && redirects < MAX_REDIRECTS {
                let location = response
                    .headers()
                    .get(hyper::header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| resolve_location(&uri, value));
                if let Some(next) = location {
                    uri = next;
                    redirects += 1;
                    continue;
                }
            }

            if !response.status().is_success() {
                return Ok(FetchOutcome::Status(response.status()));
            }

            let content_length: usize = match response.headers().get(hyper::header::CONTENT_LENGTH)
            {
                Some(val) => val.to_str().ok().and_then(|s| s.parse().ok()).unwrap_or(0),
                None => 0,
            };

            let mut result = Vec::with_capacity(std::cmp::max(content_length, 1024));
            while let Some(piece) = response.body_mut().data().await {
                let piece = piece?;
                result.extend_from_slice(&piece);
            }
            return Ok(FetchOutcome::Body(result));
        }
    }
}

fn resolve_location(base: &Uri, location: &str) -> Option<Uri> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.parse().ok();
    }
    Uri::builder()
        .scheme(base.scheme()?.clone())
        .authority(base.authority()?.clone())
        .path_and_query(location)
        .build()
        .ok()
}
