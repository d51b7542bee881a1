//! Best-effort response cache for the HTTP loader.
//!
//! Entries are keyed by the canonical request URL. Whether and for how long
//! a response is cached is decided by its `Cache-Control` header alone.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use data_encoding::BASE32_NOPAD;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use percent_encoding::percent_decode_str;
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE, ETAG};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CacheError;

/// Extension of disk cache records.
pub const CACHE_FILE_EXT: &str = ".json.gz";

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A cached response body and its freshness metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub cached_at: SystemTime,
    pub max_age: Duration,
    #[serde(default)]
    pub etag: Option<String>,
}

impl CachedResponse {
    /// Build a cache entry for a response, or `None` when the response must
    /// not be cached.
    pub fn from_response(headers: &HeaderMap, body: &[u8], now: SystemTime) -> Option<Self> {
        let max_age = max_age(headers)?;
        Some(Self {
            body: body.to_vec(),
            content_type: header_str(headers, CONTENT_TYPE.as_str()),
            cached_at: now,
            max_age,
            etag: header_str(headers, ETAG.as_str()),
        })
    }

    pub fn is_fresh(&self, now: SystemTime) -> bool {
        match self.cached_at.checked_add(self.max_age) {
            Some(expires) => now < expires,
            None => true,
        }
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// How long a response may be cached according to `Cache-Control`.
///
/// `no-store` and `no-cache` forbid caching, as does the absence of a
/// `max-age` directive.
pub fn max_age(headers: &HeaderMap) -> Option<Duration> {
    let mut max_age = None;
    for value in headers.get_all(CACHE_CONTROL) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(argument.trim().trim_matches('"'))),
                None => (directive, None),
            };
            if name.eq_ignore_ascii_case("no-store") || name.eq_ignore_ascii_case("no-cache") {
                return None;
            }
            if name.eq_ignore_ascii_case("max-age") {
                if let Some(seconds) = argument.and_then(|arg| arg.parse::<u64>().ok()) {
                    max_age = Some(Duration::from_secs(seconds));
                }
            }
        }
    }
    max_age
}

/// Storage for [`CachedResponse`]s.
pub trait HttpCache: Send + Sync {
    /// The entry stored for `url`, fresh or not.
    fn load_cache(&self, url: &Url) -> Result<Option<CachedResponse>, CacheError>;

    /// Store `entry` for `url`, replacing any previous one.
    fn store_cache(&self, url: &Url, entry: &CachedResponse) -> Result<(), CacheError>;

    /// Cache a response if its headers allow it, returning the stored entry.
    fn save_cache(
        &self,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        now: SystemTime,
    ) -> Result<Option<CachedResponse>, CacheError> {
        let Some(entry) = CachedResponse::from_response(headers, body, now) else {
            return Ok(None);
        };
        self.store_cache(url, &entry)?;
        Ok(Some(entry))
    }
}

fn canonical_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// In-process cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HttpCache for MemoryCache {
    fn load_cache(&self, url: &Url) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&canonical_key(url))
            .cloned())
    }

    fn store_cache(&self, url: &Url, entry: &CachedResponse) -> Result<(), CacheError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical_key(url), entry.clone());
        Ok(())
    }
}

/// Cache persisted below a directory, one gzip-compressed record per URL.
///
/// Records live at `<root>/<scheme>/<host>/[<port>/]<path>.json.gz`, see
/// [`DiskCache::path_for`].
///
/// Records are gzip-compressed JSON, hence the `.json.gz` extension. The Go
/// `helm-values-schema` tool stores `gob` records under `.gob.gz`; those
/// caches are not read here and the two can share a directory untouched.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default location: the user's cache directory.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("helm-values-schema").join("httpcache"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the record for `url`.
    ///
    /// Every path segment is kept as is when it is a safe file name. `.` and
    /// `..` become `_dot` and `_dotdot`, and any other unsafe segment is
    /// stored as `_b32_` plus its base32 form. An empty path or a trailing
    /// slash ends in an `_index` leaf, so `/dir/` and `/dir` stay apart. With
    /// a query the leaf is `_q32_<last segment>_<query>`, both parts base32.
    pub fn path_for(&self, url: &Url) -> PathBuf {
        let mut path = self.root.join(encode_segment(url.scheme()));
        path.push(match url.host_str() {
            Some(host) => encode_segment(host),
            None => "_nohost".to_string(),
        });
        if let Some(port) = url.port() {
            path.push(port.to_string());
        }

        let mut segments: Vec<String> = url
            .path_segments()
            .map(|segments| {
                segments
                    .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        let last = segments.pop().unwrap_or_default();
        for segment in &segments {
            path.push(encode_segment(segment));
        }

        let file = match url.query() {
            Some(query) => format!("_q32_{}_{}", base32(&last), base32(query)),
            None if last.is_empty() => "_index".to_string(),
            None => encode_segment(&last),
        };
        path.push(format!("{file}{CACHE_FILE_EXT}"));
        path
    }

    fn read(&self, path: &Path) -> Result<Option<CachedResponse>, CacheError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let reader = BufReader::new(GzDecoder::new(file));
        let entry = serde_json::from_reader(reader).map_err(|source| CacheError::Encoding {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(entry))
    }

    fn write(&self, path: &Path, entry: &CachedResponse) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let file = fs::File::create(&tmp).map_err(io_err)?;
            let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
            serde_json::to_writer(&mut encoder, entry).map_err(|source| CacheError::Encoding {
                path: path.to_path_buf(),
                source,
            })?;
            encoder
                .finish()
                .and_then(|mut writer| writer.flush())
                .map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }
}

impl HttpCache for DiskCache {
    fn load_cache(&self, url: &Url) -> Result<Option<CachedResponse>, CacheError> {
        self.read(&self.path_for(url))
    }

    fn store_cache(&self, url: &Url, entry: &CachedResponse) -> Result<(), CacheError> {
        self.write(&self.path_for(url), entry)
    }
}

const MAX_SEGMENT_LEN: usize = 200;

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && !segment.starts_with('_')
        && segment != "."
        && segment != ".."
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"._~+=,@-".contains(&b))
}

fn encode_segment(segment: &str) -> String {
    match segment {
        "." => "_dot".to_string(),
        ".." => "_dotdot".to_string(),
        s if is_safe_segment(s) => s.to_string(),
        s => format!("_b32_{}", base32(s)),
    }
}

fn base32(s: &str) -> String {
    BASE32_NOPAD.encode(s.as_bytes()).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::TempDir;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(*value));
        }
        map
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn max_age_directives() {
        assert_eq!(
            max_age(&headers(&[("cache-control", "public, max-age=100")])),
            Some(Duration::from_secs(100))
        );
        assert_eq!(max_age(&headers(&[("cache-control", "no-store")])), None);
        assert_eq!(
            max_age(&headers(&[("cache-control", "max-age=100, no-cache")])),
            None
        );
        assert_eq!(max_age(&headers(&[("cache-control", "public")])), None);
        assert_eq!(max_age(&headers(&[])), None);
    }

    #[test]
    fn freshness_window() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let entry = CachedResponse::from_response(
            &headers(&[("cache-control", "max-age=100"), ("etag", "\"v1\"")]),
            b"{}",
            now,
        )
        .unwrap();

        assert_eq!(entry.etag.as_deref(), Some("\"v1\""));
        assert!(entry.is_fresh(now + Duration::from_secs(99)));
        assert!(!entry.is_fresh(now + Duration::from_secs(100)));
    }

    #[test]
    fn save_cache_skips_uncacheable_responses() {
        let cache = MemoryCache::new();
        let saved = cache
            .save_cache(
                &url("https://example.com/a.json"),
                &headers(&[("cache-control", "no-store")]),
                b"{}",
                SystemTime::now(),
            )
            .unwrap();
        assert!(saved.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn memory_cache_ignores_fragment() {
        let cache = MemoryCache::new();
        let saved = cache
            .save_cache(
                &url("https://example.com/a.json#/x"),
                &headers(&[("cache-control", "max-age=5")]),
                b"{}",
                SystemTime::now(),
            )
            .unwrap();
        assert_eq!(
            cache.load_cache(&url("https://example.com/a.json")).unwrap(),
            saved
        );
    }

    #[test]
    fn disk_cache_path_layout() {
        let cache = DiskCache::new("/cache");
        let cases = [
            (
                "https://example.com/schemas/foo.json",
                "/cache/https/example.com/schemas/foo.json.json.gz",
            ),
            (
                "http://localhost:8080/a/b.yaml",
                "/cache/http/localhost/8080/a/b.yaml.json.gz",
            ),
            ("https://example.com/", "/cache/https/example.com/_index.json.gz"),
            ("https://example.com", "/cache/https/example.com/_index.json.gz"),
            (
                "https://example.com/dir/",
                "/cache/https/example.com/dir/_index.json.gz",
            ),
            ("https://example.com/dir", "/cache/https/example.com/dir.json.gz"),
            (
                "https://example.com/?schema=a",
                "/cache/https/example.com/_q32__onrwqzlnme6wc.json.gz",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(cache.path_for(&url(input)), PathBuf::from(expected), "{input}");
        }

        let distinct = [
            ("https://example.com/?schema=a", "https://example.com/?schema=b"),
            ("https://example.com/?schema=a", "https://example.com/"),
            ("https://example.com/dir/", "https://example.com/dir"),
            ("https://example.com/_index", "https://example.com/"),
            ("https://example.com/a?b", "https://example.com/a%3Fb"),
            ("https://example.com/a//b", "https://example.com/a/b"),
        ];
        for (a, b) in distinct {
            assert_ne!(cache.path_for(&url(a)), cache.path_for(&url(b)), "{a} vs {b}");
        }
    }

    #[test]
    fn disk_cache_encodes_unsafe_segments() {
        let cache = DiskCache::new("/cache");
        let path = cache.path_for(&url("https://example.com/a%20b/_x/c:d"));
        let segments: Vec<String> = path
            .iter()
            .skip(4)
            .map(|s| s.to_string_lossy().into_owned())
            .collect();

        assert_eq!(segments[0], format!("_b32_{}", BASE32_NOPAD.encode(b"a b").to_ascii_lowercase()));
        assert_eq!(segments[1], format!("_b32_{}", BASE32_NOPAD.encode(b"_x").to_ascii_lowercase()));
        assert_eq!(
            segments[2],
            format!("_b32_{}{CACHE_FILE_EXT}", BASE32_NOPAD.encode(b"c:d").to_ascii_lowercase())
        );
    }

    #[test]
    fn reserved_segment_names() {
        assert_eq!(encode_segment("."), "_dot");
        assert_eq!(encode_segment(".."), "_dotdot");
        assert_eq!(encode_segment("schema.json"), "schema.json");
        assert!(encode_segment(&"x".repeat(MAX_SEGMENT_LEN + 1)).starts_with("_b32_"));
    }

    #[test]
    fn disk_cache_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let target = url("https://example.com/schemas/values.schema.json");

        assert_eq!(cache.load_cache(&target).unwrap(), None);

        let entry = CachedResponse {
            body: br#"{"type":"object"}"#.to_vec(),
            content_type: Some("application/schema+json".into()),
            cached_at: SystemTime::UNIX_EPOCH + Duration::from_secs(42),
            max_age: Duration::from_secs(100),
            etag: Some("\"abc\"".into()),
        };
        cache.store_cache(&target, &entry).unwrap();

        assert!(cache.path_for(&target).is_file());
        assert_eq!(cache.load_cache(&target).unwrap(), Some(entry));
    }

    #[test]
    fn disk_cache_reports_corrupt_records() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path());
        let target = url("https://example.com/a.json");
        let path = cache.path_for(&target);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not gzip").unwrap();

        assert!(cache.load_cache(&target).is_err());
    }
}
