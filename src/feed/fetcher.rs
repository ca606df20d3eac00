use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout, covering connect, headers and body.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Default response size limit (10MB).
pub const DEFAULT_MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

const DEFAULT_USER_AGENT: &str = concat!("feedsync/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while fetching a feed.
///
/// Every variant is transient from the updater's point of view and is retried.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Classification of a fetched body, used to pick a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    JsonListing,
    SyndicationXml,
    Unknown,
}

impl ContentKind {
    /// Classify a declared `Content-Type` header value.
    ///
    /// `application/json` and friends map to [`ContentKind::JsonListing`];
    /// anything mentioning xml (`application/rss+xml`, `application/atom+xml`,
    /// `text/xml`, ...) maps to [`ContentKind::SyndicationXml`].
    pub fn from_content_type(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("json") {
            ContentKind::JsonListing
        } else if content_type.contains("xml") {
            ContentKind::SyndicationXml
        } else {
            ContentKind::Unknown
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentKind::JsonListing => "json-listing",
            ContentKind::SyndicationXml => "syndication-xml",
            ContentKind::Unknown => "unknown",
        })
    }
}

/// Body of one successful fetch, handed straight to the parser.
#[derive(Debug, Clone)]
pub struct RawFetchResult {
    pub content_kind: ContentKind,
    /// The `Content-Type` header as the server sent it (empty if absent)
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl RawFetchResult {
    pub fn new(content_type: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let content_type = content_type.into();
        Self {
            content_kind: ContentKind::from_content_type(&content_type),
            content_type,
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// Performs one network fetch. No retries, no persistence.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawFetchResult, FetchError>;
}

/// [`ContentFetcher`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_size: usize,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_FETCH_TIMEOUT,
            max_size: DEFAULT_MAX_FEED_SIZE,
        }
    }

    /// Build a client with the given user agent.
    pub fn with_user_agent(user_agent: &str) -> Result<Self, FetchError> {
        let user_agent = if user_agent.is_empty() {
            DEFAULT_USER_AGENT
        } else {
            user_agent
        };
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self::new(client))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    async fn fetch_inner(&self, url: &str) -> Result<RawFetchResult, FetchError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::HttpStatus(response.status().as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = read_limited_bytes(response, self.max_size).await?;
        Ok(RawFetchResult::new(content_type, body))
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawFetchResult, FetchError> {
        let raw = tokio::time::timeout(self.timeout, self.fetch_inner(url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        tracing::debug!(
            url = %url,
            content_kind = %raw.content_kind,
            bytes = raw.body.len(),
            "Fetched feed"
        );
        Ok(raw)
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A truncated body would otherwise surface later as a confusing parse error
    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(template: ResponseTemplate) -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(template)
            .mount(&mock_server)
            .await;
        mock_server
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(reqwest::Client::new())
    }

    #[test]
    fn test_content_kind_classification() {
        let cases = [
            ("application/json", ContentKind::JsonListing),
            ("application/json; charset=utf-8", ContentKind::JsonListing),
            ("application/feed+json", ContentKind::JsonListing),
            ("application/rss+xml", ContentKind::SyndicationXml),
            ("application/atom+xml", ContentKind::SyndicationXml),
            ("Text/XML; charset=ISO-8859-1", ContentKind::SyndicationXml),
            ("text/html", ContentKind::Unknown),
            ("", ContentKind::Unknown),
        ];
        for (content_type, expected) in cases {
            assert_eq!(
                ContentKind::from_content_type(content_type),
                expected,
                "content type {:?}",
                content_type
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_xml_body() {
        let body = "<rss version=\"2.0\"><channel></channel></rss>";
        let server = serve(
            ResponseTemplate::new(200).set_body_raw(body, "application/rss+xml"),
        )
        .await;

        let raw = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(raw.content_kind, ContentKind::SyndicationXml);
        assert_eq!(raw.content_type, "application/rss+xml");
        assert_eq!(raw.body, body.as_bytes());
    }

    #[tokio::test]
    async fn test_fetch_json_body() {
        let server = serve(
            ResponseTemplate::new(200).set_body_raw("{\"domains\": []}", "application/json"),
        )
        .await;

        let raw = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(raw.content_kind, ContentKind::JsonListing);
    }

    #[tokio::test]
    async fn test_fetch_unknown_kind_is_not_an_error() {
        let server = serve(
            ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"),
        )
        .await;

        let raw = fetcher()
            .fetch(&format!("{}/feed", server.uri()))
            .await
            .unwrap();
        assert_eq!(raw.content_kind, ContentKind::Unknown);
        assert_eq!(raw.content_type, "text/html");
    }

    #[tokio::test]
    async fn test_fetch_404_error() {
        let server = serve(ResponseTemplate::new(404)).await;

        match fetcher().fetch(&format!("{}/feed", server.uri())).await {
            Err(FetchError::HttpStatus(404)) => {}
            other => panic!("Expected HttpStatus(404), got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_500_error_single_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let result = fetcher()
            .fetch(&format!("{}/feed", mock_server.uri()))
            .await;
        assert!(matches!(result, Err(FetchError::HttpStatus(500))));
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let server = serve(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(500)),
        )
        .await;

        let result = fetcher()
            .timeout(Duration::from_millis(50))
            .fetch(&format!("{}/feed", server.uri()))
            .await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let server = serve(
            ResponseTemplate::new(200).set_body_raw("x".repeat(2048), "application/xml"),
        )
        .await;

        let result = fetcher()
            .max_size(1024)
            .fetch(&format!("{}/feed", server.uri()))
            .await;
        assert!(matches!(result, Err(FetchError::ResponseTooLarge)));
    }

    #[tokio::test]
    async fn test_fetch_short_body_is_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Declares 100 bytes, sends 5, then closes the connection
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\n\
                      Content-Type: application/rss+xml\r\n\
                      Content-Length: 100\r\n\
                      Connection: close\r\n\r\n\
                      <rss>",
                )
                .await;
            let _ = socket.shutdown().await;
        });

        let result = fetcher().fetch(&format!("http://{}/feed", addr)).await;
        match result {
            Err(FetchError::IncompleteResponse { expected, received }) => {
                assert_eq!(expected, 100);
                assert_eq!(received, 5);
            }
            // hyper usually notices the early close first and fails the body stream
            Err(FetchError::Network(_)) => {}
            other => panic!("Expected a short-body error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        // Port 9 (discard) is almost never listening on test hosts
        let result = fetcher().fetch("http://127.0.0.1:9/feed").await;
        assert!(matches!(
            result,
            Err(FetchError::Network(_)) | Err(FetchError::Timeout(_))
        ));
    }
}
