//! Loading schemas over HTTP(S).
//!
//! Requires the `remote` feature (enabled by default).

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{
    HeaderMap, ACCEPT, ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, IF_NONE_MATCH, LINK,
    USER_AGENT,
};
use reqwest::StatusCode;
use url::Url;

use crate::error::LoadError;
use crate::httpcache::{CachedResponse, Clock, HttpCache, SystemClock};
use crate::loader::{decode_document, Format, LoadContext, Loader};
use crate::schema::Schema;

/// Upper bound for every request, regardless of the caller's deadline.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling for response bodies (10 MiB).
pub const DEFAULT_SIZE_LIMIT: u64 = 10 * 1024 * 1024;

/// Media types we can decode, in order of preference.
pub const ACCEPT_SCHEMA: &str = "application/schema+json, application/json;q=0.9, \
     application/schema+yaml;q=0.8, application/yaml;q=0.7, */*;q=0.1";

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Loads schemas with `GET` requests.
///
/// Responses are cached in the configured [`HttpCache`] as their
/// `Cache-Control` header allows. Stale entries with an ETag are revalidated
/// with `If-None-Match`. Cache failures never fail a load.
#[derive(Clone)]
pub struct HttpLoader {
    client: Client,
    cache: Option<Arc<dyn HttpCache>>,
    clock: Arc<dyn Clock>,
    size_limit: u64,
    timeout: Duration,
    user_agent: String,
}

impl std::fmt::Debug for HttpLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpLoader")
            .field("cached", &self.cache.is_some())
            .field("size_limit", &self.size_limit)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl HttpLoader {
    /// A loader without a response cache.
    ///
    /// # Errors
    ///
    /// Returns `LoadError::HttpTransport` if the HTTP client cannot be built.
    pub fn new() -> Result<Self, LoadError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| LoadError::HttpTransport {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            cache: None,
            clock: Arc::new(SystemClock),
            size_limit: DEFAULT_SIZE_LIMIT,
            timeout: HTTP_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn HttpCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = limit;
        self
    }

    /// Shorten the per-request timeout. It never exceeds [`HTTP_TIMEOUT`].
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(HTTP_TIMEOUT);
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    fn request_timeout(&self, ctx: &LoadContext, url: &Url) -> Result<Duration, LoadError> {
        let Some(deadline) = ctx.deadline else {
            return Ok(self.timeout);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(LoadError::DeadlineExceeded {
                url: url.to_string(),
            });
        }
        Ok(remaining.min(self.timeout))
    }

    fn cached(&self, url: &Url) -> Option<CachedResponse> {
        let cache = self.cache.as_ref()?;
        match cache.load_cache(url) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(url = %url, error = %err, "ignoring unreadable http cache entry");
                None
            }
        }
    }

    fn store(&self, url: &Url, entry: &CachedResponse) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.store_cache(url, entry) {
                tracing::debug!(url = %url, error = %err, "failed to refresh http cache entry");
            }
        }
    }

    fn save(&self, url: &Url, headers: &HeaderMap, body: &[u8]) {
        if let Some(cache) = &self.cache {
            match cache.save_cache(url, headers, body, self.clock.now()) {
                Ok(Some(entry)) => {
                    tracing::trace!(url = %url, max_age = ?entry.max_age, "cached response");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "failed to write http cache entry");
                }
            }
        }
    }
}

impl Loader for HttpLoader {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        let mut url = Url::parse(reference).map_err(|source| LoadError::InvalidReference {
            reference: reference.to_string(),
            source,
        })?;
        url.set_fragment(None);

        let cached = self.cached(&url);
        if let Some(entry) = &cached {
            if entry.is_fresh(self.clock.now()) {
                tracing::debug!(url = %url, "schema served from http cache");
                return decode_body(&url, &entry.body, entry.content_type.as_deref());
            }
        }

        let mut request = self
            .client
            .get(url.clone())
            .timeout(self.request_timeout(ctx, &url)?)
            .header(ACCEPT, ACCEPT_SCHEMA)
            .header(ACCEPT_ENCODING, "gzip")
            .header(USER_AGENT, self.user_agent.as_str());
        if let Some(referrer) = &ctx.referrer {
            request = request.header(LINK, format!("<{referrer}>; rel=\"describedby\""));
        }
        if let Some(etag) = cached.as_ref().and_then(|entry| entry.etag.as_deref()) {
            request = request.header(IF_NONE_MATCH, etag);
        }

        tracing::debug!(url = %url, "fetching schema");
        let response = request.send().map_err(|source| LoadError::HttpTransport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            if let Some(mut entry) = cached {
                tracing::debug!(url = %url, "cached schema revalidated");
                entry.cached_at = self.clock.now();
                self.store(&url, &entry);
                return decode_body(&url, &entry.body, entry.content_type.as_deref());
            }
        }
        if !status.is_success() {
            return Err(LoadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let headers = response.headers().clone();
        let body = read_body(&url, &headers, response, self.size_limit)?;
        let schema = decode_body(&url, &body, header_str(&headers, CONTENT_TYPE.as_str()))?;
        self.save(&url, &headers, &body);
        Ok(schema)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn decode_body(url: &Url, body: &[u8], content_type: Option<&str>) -> Result<Arc<Schema>, LoadError> {
    let format = media_format(url, content_type)?;
    decode_document(url.as_str(), body, format).map(Arc::new)
}

/// Read the response body, undoing `Content-Encoding`, never holding more
/// than `limit` bytes.
fn read_body(
    url: &Url,
    headers: &HeaderMap,
    body: impl Read,
    limit: u64,
) -> Result<Vec<u8>, LoadError> {
    let encoding = header_str(headers, CONTENT_ENCODING.as_str())
        .map(|encoding| encoding.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match encoding.as_str() {
        "" | "identity" => read_limited(url, body, limit),
        "gzip" | "x-gzip" => {
            let compressed = read_limited(url, body, limit)?;
            read_limited(url, GzDecoder::new(compressed.as_slice()), limit)
        }
        _ => Err(LoadError::UnsupportedContentEncoding {
            url: url.to_string(),
            encoding,
        }),
    }
}

fn read_limited(url: &Url, reader: impl Read, limit: u64) -> Result<Vec<u8>, LoadError> {
    let mut body = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut body)
        .map_err(|source| LoadError::ReadBody {
            url: url.to_string(),
            source,
        })?;
    if body.len() as u64 > limit {
        return Err(LoadError::SizeLimitExceeded {
            url: url.to_string(),
            limit,
        });
    }
    Ok(body)
}

/// Pick the decoder for a `Content-Type`. Unknown or missing types decode as
/// JSON.
fn media_format(url: &Url, content_type: Option<&str>) -> Result<Format, LoadError> {
    let Some(content_type) = content_type else {
        return Ok(Format::Json);
    };
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or_default().trim().to_ascii_lowercase();

    for parameter in parts {
        let Some((name, value)) = parameter.split_once('=') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("charset") {
            continue;
        }
        let charset = value.trim().trim_matches('"').to_ascii_lowercase();
        if !matches!(charset.as_str(), "utf-8" | "utf8" | "us-ascii") {
            return Err(LoadError::UnsupportedCharset {
                url: url.to_string(),
                charset,
            });
        }
    }

    if is_yaml_media_type(&media_type) {
        Ok(Format::Yaml)
    } else {
        Ok(Format::Json)
    }
}

fn is_yaml_media_type(media_type: &str) -> bool {
    match media_type {
        "application/yaml" | "application/x-yaml" | "text/yaml" => true,
        other => other
            .strip_prefix("application/")
            .is_some_and(|subtype| subtype.ends_with("+yaml")),
    }
}
