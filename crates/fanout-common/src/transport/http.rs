//! HTTP transport.
//!
//! Each record is POSTed to a fixed endpoint with its id in the
//! `Idempotency-Key` header, so the endpoint can deduplicate retried
//! deliveries. Responses are classified by status code:
//!
//! | Status                        | Class       |
//! |-------------------------------|-------------|
//! | 2xx                           | success     |
//! | 429, 503                      | `Throttled` |
//! | 408, 500, 502, 504            | `Transient` |
//! | anything else                 | `Fatal`     |
//!
//! Connection failures and timeouts are `Transient`. An integer
//! `Retry-After` header on a throttled response becomes the error's
//! `retry_after` hint.

use crate::error::{FanoutError, Result};
use crate::outcome::{InvocationError, InvokeResult};
use crate::record::Record;
use crate::transport::Transport;
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Header carrying the record id.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maps a response status to a failure, or `None` for success.
///
/// # Example
///
/// ```
/// use fanout_common::transport::classify_status;
/// use fanout_common::FailureClass;
/// use hyper::StatusCode;
///
/// assert!(classify_status(StatusCode::OK, None).is_none());
/// let err = classify_status(StatusCode::TOO_MANY_REQUESTS, None).unwrap();
/// assert_eq!(err.class, FailureClass::Throttled);
/// ```
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<InvocationError> {
    if status.is_success() {
        return None;
    }

    let message = format!("endpoint returned {}", status);
    let error = match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            let error = InvocationError::throttled(message);
            match retry_after {
                Some(wait) => error.with_retry_after(wait),
                None => error,
            }
        }
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::GATEWAY_TIMEOUT => InvocationError::transient(message),
        _ => InvocationError::fatal(message),
    };
    Some(error)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Delivers records by HTTP POST.
///
/// The underlying client keeps connections alive, so one transport should
/// be shared by the whole run.
///
/// # Example
///
/// ```no_run
/// use fanout_common::transport::HttpTransport;
/// use std::time::Duration;
///
/// let transport = HttpTransport::new("http://127.0.0.1:8080/ingest")
///     .unwrap()
///     .with_timeout(Duration::from_secs(5));
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: Uri,
    timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint is not a valid
    /// `http://` URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        let uri: Uri = endpoint.parse().map_err(|e| {
            FanoutError::Configuration(format!("Invalid endpoint '{}': {}", endpoint, e))
        })?;
        if uri.scheme_str() != Some("http") || uri.host().is_none() {
            return Err(FanoutError::Configuration(format!(
                "Invalid endpoint '{}': must be an http:// URL",
                endpoint
            )));
        }

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            endpoint: uri,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the per-request timeout (default 30 seconds).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    fn build_request(&self, record: &Record) -> std::result::Result<Request<Full<Bytes>>, InvocationError> {
        Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_KEY, record.id.as_str())
            .body(Full::new(record.payload.clone()))
            .map_err(|e| InvocationError::fatal(format!("Failed to build request: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn invoke(&self, record: &Record) -> InvokeResult {
        let request = self.build_request(record)?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| {
                InvocationError::transient(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| InvocationError::transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if let Some(error) = classify_status(status, parse_retry_after(response.headers())) {
            return Err(error);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| InvocationError::transient(format!("Failed to read response: {}", e)))?;
        Ok(body.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureClass;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use std::net::SocketAddr;

    // Status is chosen by the idempotency key prefix
    async fn stub(headers: AxumHeaders, body: Bytes) -> impl IntoResponse {
        let key = headers
            .get(IDEMPOTENCY_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if key.starts_with("throttle") {
            (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "2")], Bytes::new()).into_response()
        } else if key.starts_with("busy") {
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        } else if key.starts_with("flaky") {
            StatusCode::BAD_GATEWAY.into_response()
        } else if key.starts_with("bad") {
            StatusCode::UNPROCESSABLE_ENTITY.into_response()
        } else if key.starts_with("slow") {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::OK.into_response()
        } else {
            (StatusCode::OK, body).into_response()
        }
    }

    async fn spawn_stub() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/ingest", post(stub));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn transport(addr: SocketAddr) -> HttpTransport {
        HttpTransport::new(&format!("http://{}/ingest", addr)).unwrap()
    }

    #[test]
    fn test_classify_status_table() {
        let cases = [
            (StatusCode::OK, None),
            (StatusCode::ACCEPTED, None),
            (StatusCode::TOO_MANY_REQUESTS, Some(FailureClass::Throttled)),
            (StatusCode::SERVICE_UNAVAILABLE, Some(FailureClass::Throttled)),
            (StatusCode::REQUEST_TIMEOUT, Some(FailureClass::Transient)),
            (StatusCode::INTERNAL_SERVER_ERROR, Some(FailureClass::Transient)),
            (StatusCode::BAD_GATEWAY, Some(FailureClass::Transient)),
            (StatusCode::GATEWAY_TIMEOUT, Some(FailureClass::Transient)),
            (StatusCode::BAD_REQUEST, Some(FailureClass::Fatal)),
            (StatusCode::NOT_FOUND, Some(FailureClass::Fatal)),
            (StatusCode::NOT_IMPLEMENTED, Some(FailureClass::Fatal)),
        ];
        for (status, expected) in cases {
            let class = classify_status(status, None).map(|e| e.class);
            assert_eq!(class, expected, "status {}", status);
        }
    }

    #[test]
    fn test_retry_after_only_on_throttled() {
        let wait = Some(Duration::from_secs(3));
        let throttled = classify_status(StatusCode::TOO_MANY_REQUESTS, wait).unwrap();
        assert_eq!(throttled.retry_after, wait);

        let transient = classify_status(StatusCode::BAD_GATEWAY, wait).unwrap();
        assert_eq!(transient.retry_after, None);
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_rejects_invalid_endpoints() {
        assert!(HttpTransport::new("127.0.0.1:8080").is_err());
        assert!(HttpTransport::new("https://example.com").is_err());
        assert!(HttpTransport::new("not a url").is_err());
        assert!(HttpTransport::new("http://127.0.0.1:8080/ingest").is_ok());
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let addr = spawn_stub().await;
        let record = Record::new("ok-1", 0, r#"{"n":1}"#);

        let body = transport(addr).invoke(&record).await.unwrap();
        assert_eq!(&body[..], br#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_status_classification_end_to_end() {
        let addr = spawn_stub().await;
        let transport = transport(addr);

        let throttled = transport
            .invoke(&Record::new("throttle-1", 0, "{}"))
            .await
            .unwrap_err();
        assert_eq!(throttled.class, FailureClass::Throttled);
        assert_eq!(throttled.retry_after, Some(Duration::from_secs(2)));

        let busy = transport.invoke(&Record::new("busy-1", 1, "{}")).await.unwrap_err();
        assert_eq!(busy.class, FailureClass::Throttled);

        let flaky = transport.invoke(&Record::new("flaky-1", 2, "{}")).await.unwrap_err();
        assert_eq!(flaky.class, FailureClass::Transient);

        let bad = transport.invoke(&Record::new("bad-1", 3, "{}")).await.unwrap_err();
        assert_eq!(bad.class, FailureClass::Fatal);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let addr = spawn_stub().await;
        let transport = transport(addr).with_timeout(Duration::from_millis(50));

        let err = transport.invoke(&Record::new("slow-1", 0, "{}")).await.unwrap_err();
        assert_eq!(err.class, FailureClass::Transient);
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport(addr)
            .invoke(&Record::new("ok-1", 0, "{}"))
            .await
            .unwrap_err();
        assert_eq!(err.class, FailureClass::Transient);
    }
}
