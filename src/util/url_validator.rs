use thiserror::Error;
use url::Url;

/// Errors from validating a feed URL before it is followed.
#[derive(Error, Debug)]
pub enum UrlError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL embeds a username or password.
    #[error("Credentials in feed URLs are not allowed")]
    EmbeddedCredentials,
}

/// Validates a URL string for use as a feed source.
///
/// Accepts absolute `http`/`https` URLs with a host and no embedded
/// credentials. Surrounding whitespace is ignored.
///
/// # Examples
///
/// ```
/// use feedsync::util::validate_feed_url;
///
/// let url = validate_feed_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_feed_url("file:///etc/passwd").is_err());
/// assert!(validate_feed_url("example.com/rss").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlError::MissingHost);
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlError::EmbeddedCredentials);
    }

    Ok(url)
}
