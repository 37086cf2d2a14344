//! HTTP delivery of serialized messages to the collector.
//!
//! The submitter only needs one capability: POST a JSON body and get back a
//! status, headers and body, or a transport failure. [`Transport`] is that
//! capability; [`HttpTransport`] implements it over a pooled reqwest client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Certificate, Client, StatusCode};
use tracing::debug;

use crate::config::Config;

/// What came back from the collector.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl TransportResponse {
    /// Response with no headers.
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Errors that can occur before a response is available.
#[derive(Debug)]
pub enum TransportError {
    /// HTTP request failed (connection refused, DNS, TLS, body read)
    Request(reqwest::Error),

    /// Request timed out
    Timeout,

    /// Transport could not be built from the configuration
    Config(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Request(e) => write!(f, "HTTP request failed: {}", e),
            TransportError::Timeout => write!(f, "Request timed out"),
            TransportError::Config(e) => write!(f, "Transport configuration error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// POST a JSON body to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, body: String) -> Result<TransportResponse, TransportError>;

    /// Destination, for logging
    fn endpoint(&self) -> &str;
}

/// Basic-auth credentials.
#[derive(Debug, Clone)]
struct BasicAuth {
    user: String,
    password: String,
}

/// reqwest-backed [`Transport`].
///
/// The underlying client is built once and reused, so connections to the
/// collector are pooled across submissions.
pub struct HttpTransport {
    client: Client,
    url: String,
    auth: Option<BasicAuth>,
    timeout: Duration,
}

impl HttpTransport {
    /// Build a transport from the relay configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Config` if the CA certificate cannot be read
    /// or parsed, or if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .timeout(config.request_timeout)
            .default_headers(json_headers())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90));

        if config.tls {
            if let Some(path) = &config.ca_cert {
                let pem = std::fs::read(path).map_err(|e| {
                    TransportError::Config(format!(
                        "cannot read CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let certificate = Certificate::from_pem(&pem).map_err(|e| {
                    TransportError::Config(format!(
                        "invalid CA certificate {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                builder = builder.add_root_certificate(certificate);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        let auth = config.auth_enabled.then(|| BasicAuth {
            user: config.auth_user.clone(),
            password: config.auth_password.clone(),
        });

        Ok(Self {
            client,
            url: config.submit_url(),
            auth,
            timeout: config.request_timeout,
        })
    }

    /// Get the submission URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether basic auth is sent with each request.
    pub fn uses_auth(&self) -> bool {
        self.auth.is_some()
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, body: String) -> Result<TransportResponse, TransportError> {
        debug!(url = %self.url, bytes = body.len(), "POST to collector");

        let mut request = self.client.post(&self.url).timeout(self.timeout).body(body);
        if let Some(auth) = &self.auth {
            request = request.basic_auth(&auth.user, Some(&auth.password));
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            auth_user: "u".to_string(),
            auth_password: "p".to_string(),
            request_timeout: Duration::from_secs(5),
            ..Config::default()
        }
    }

    /// Accept one connection, answer with `response`, return the raw request.
    async fn serve_once(listener: TcpListener, response: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);

            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }

        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
        String::from_utf8(raw).unwrap()
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(format!("{}", TransportError::Timeout), "Request timed out");

        let err = TransportError::Config("bad cert".to_string());
        assert!(format!("{}", err).contains("bad cert"));
    }

    #[test]
    fn test_http_transport_from_default_config() {
        let config = Config::default();
        let transport = HttpTransport::new(&config).unwrap();

        assert_eq!(transport.url(), "http://localhost:80/API/device/Log");
        assert_eq!(transport.endpoint(), transport.url());
        assert_eq!(transport.timeout(), Duration::from_secs(30));
        assert!(transport.uses_auth());
    }

    #[test]
    fn test_http_transport_without_auth() {
        let config = Config {
            auth_enabled: false,
            ..Config::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert!(!transport.uses_auth());
    }

    #[test]
    fn test_http_transport_tls_url() {
        let config = Config {
            tls: true,
            port: 8443,
            host: "collector.example".to_string(),
            ..Config::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.url(), "https://collector.example:8443/API/device/Log");
    }

    #[test]
    fn test_missing_ca_certificate_is_config_error() {
        let config = Config {
            tls: true,
            ca_cert: Some(PathBuf::from("/nonexistent/relay-ca.pem")),
            ..Config::default()
        };
        let result = HttpTransport::new(&config);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_ca_certificate_ignored_without_tls() {
        let config = Config {
            tls: false,
            ca_cert: Some(PathBuf::from("/nonexistent/relay-ca.pem")),
            ..Config::default()
        };
        assert!(HttpTransport::new(&config).is_ok());
    }

    #[test]
    fn test_json_headers() {
        let headers = json_headers();
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert_eq!(headers[ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn test_post_sends_json_headers_and_basic_auth() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 401 Unauthorized\r\ncontent-type: application/json\r\ncontent-length: 17\r\nconnection: close\r\n\r\n{\"error\":\"token\"}",
        ));

        let transport = HttpTransport::new(&local_config(port)).unwrap();
        let response = transport.post(r#"{"device_id":"00"}"#.to_string()).await.unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body, r#"{"error":"token"}"#);

        let request = server.await.unwrap();
        let lower = request.to_ascii_lowercase();
        assert!(request.starts_with("POST /API/device/Log HTTP/1.1\r\n"));
        assert!(lower.contains("content-type: application/json\r\n"));
        assert!(lower.contains("accept: application/json\r\n"));
        // base64("u:p")
        assert!(request.contains("Basic dTpw\r\n"));
        assert!(request.ends_with(r#"{"device_id":"00"}"#));
    }

    #[tokio::test]
    async fn test_post_without_auth_omits_authorization() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
        ));

        let config = Config {
            auth_enabled: false,
            ..local_config(port)
        };
        let transport = HttpTransport::new(&config).unwrap();
        let response = transport.post("{}".to_string()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(!request.contains("authorization:"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let transport = HttpTransport::new(&local_config(port)).unwrap();
        let result = transport.post("{}".to_string()).await;
        assert!(matches!(result, Err(TransportError::Request(_))));
    }
}
