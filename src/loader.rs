//! Loading referenced schema documents.
//!
//! Everything the bundler fetches goes through the [`Loader`] trait.
//! Implementations here cover the local filesystem ([`FileLoader`]),
//! dispatch by URL scheme ([`SchemeLoader`]) and memoisation
//! ([`CacheLoader`]). The HTTP implementation lives in [`crate::http`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

use crate::error::{DecodeError, LoadError};
use crate::referrer::{clean_path, split_fragment};
use crate::schema::Schema;

/// Per-call options passed down to loaders.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    /// Id of the document that holds the reference, if known. The HTTP
    /// loader advertises it in a `Link: <...>; rel="describedby"` header.
    pub referrer: Option<String>,
    /// Give up on network requests that cannot finish before this instant.
    pub deadline: Option<Instant>,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// Fetches the schema document a reference points to.
///
/// `reference` is a resolved location: an absolute URL or a path. Any
/// fragment is ignored; the whole document is returned.
pub trait Loader {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError>;
}

impl<L: Loader + ?Sized> Loader for &L {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        (**self).load(ctx, reference)
    }
}

impl<L: Loader + ?Sized> Loader for Box<L> {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        (**self).load(ctx, reference)
    }
}

impl<L: Loader + ?Sized> Loader for Arc<L> {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        (**self).load(ctx, reference)
    }
}

/// Document syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// `.yml`/`.yaml` files are YAML, everything else is JSON.
    pub fn from_path(path: &str) -> Self {
        let extension = Utf8Path::new(path)
            .extension()
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("yml" | "yaml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

/// Decode a schema document, naming `reference` in the error.
pub fn decode_document(reference: &str, bytes: &[u8], format: Format) -> Result<Schema, LoadError> {
    let decoded = match format {
        Format::Json => serde_json::from_slice(bytes).map_err(DecodeError::from),
        Format::Yaml => serde_yaml::from_slice(bytes).map_err(DecodeError::from),
    };
    decoded.map_err(|source| LoadError::Decode {
        reference: reference.to_string(),
        source,
    })
}

/// Loads files from below a sandbox root.
///
/// Relative paths resolve against `root/base`. A path that ends up outside
/// `root`, lexically or by following symlinks, fails with
/// [`LoadError::PathEscape`].
#[derive(Debug, Clone)]
pub struct FileLoader {
    root: Utf8PathBuf,
    base: Utf8PathBuf,
}

impl FileLoader {
    pub fn new(root: impl Into<Utf8PathBuf>, base: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: base.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn resolve_path(&self, reference: &str) -> Result<Utf8PathBuf, LoadError> {
        let (location, _) = split_fragment(reference);
        let path = match Url::parse(location) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .ok()
                .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
                .ok_or_else(|| LoadError::Io {
                    path: location.into(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a local UTF-8 file path",
                    ),
                })?,
            _ => Utf8PathBuf::from(location),
        };

        let root = self
            .root
            .canonicalize_utf8()
            .map_err(|source| LoadError::Io {
                path: self.root.clone().into(),
                source,
            })?;

        let joined = if path.is_absolute() {
            path
        } else {
            root.join(&self.base).join(path)
        };
        let cleaned = clean_path(&joined);
        if !cleaned.starts_with(&root) {
            return Err(LoadError::PathEscape {
                path: cleaned.into(),
                root: root.into(),
            });
        }

        // A symlink inside the root may still point outside of it.
        if let Ok(canonical) = cleaned.canonicalize_utf8() {
            if !canonical.starts_with(&root) {
                return Err(LoadError::PathEscape {
                    path: canonical.into(),
                    root: root.into(),
                });
            }
            return Ok(canonical);
        }
        Ok(cleaned)
    }
}

impl Loader for FileLoader {
    fn load(&self, _ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        let path = self.resolve_path(reference)?;
        tracing::debug!(reference, path = %path, "loading schema file");

        let bytes = std::fs::read(&path).map_err(|source| LoadError::Io {
            path: path.clone().into(),
            source,
        })?;
        let schema = decode_document(reference, &bytes, Format::from_path(path.as_str()))?;
        Ok(Arc::new(schema))
    }
}

/// Dispatches to a loader by URL scheme.
///
/// References without a scheme (plain paths) use the loader registered for
/// the empty scheme `""`.
#[derive(Default)]
pub struct SchemeLoader {
    loaders: BTreeMap<String, Box<dyn Loader>>,
}

impl SchemeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, scheme: impl Into<String>, loader: impl Loader + 'static) -> Self {
        self.insert(scheme, loader);
        self
    }

    pub fn insert(&mut self, scheme: impl Into<String>, loader: impl Loader + 'static) {
        self.loaders.insert(scheme.into(), Box::new(loader));
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.loaders.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for SchemeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemeLoader")
            .field("schemes", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn scheme_of(reference: &str) -> String {
    let (location, _) = split_fragment(reference);
    Url::parse(location)
        .map(|url| url.scheme().to_string())
        .unwrap_or_default()
}

impl Loader for SchemeLoader {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        let scheme = scheme_of(reference);
        match self.loaders.get(&scheme) {
            Some(loader) => loader.load(ctx, reference),
            None => Err(LoadError::UnsupportedScheme {
                scheme,
                supported: self
                    .schemes()
                    .filter(|scheme| !scheme.is_empty())
                    .map(str::to_string)
                    .collect(),
            }),
        }
    }
}

/// Memoises another loader.
///
/// After the first successful load of a location, every later load of the
/// same location returns the very same [`Arc`] without calling the wrapped
/// loader. Failures are not cached.
#[derive(Debug)]
pub struct CacheLoader<L> {
    inner: L,
    cache: Mutex<HashMap<String, Arc<Schema>>>,
}

impl<L: Loader> CacheLoader<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }
}

fn cache_key(reference: &str) -> String {
    let (location, _) = split_fragment(reference);
    match Url::parse(location) {
        Ok(url) => url.into(),
        Err(_) => clean_path(Utf8Path::new(location)).into_string(),
    }
}

impl<L: Loader> Loader for CacheLoader<L> {
    fn load(&self, ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
        let key = cache_key(reference);
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(schema) = cached {
            tracing::trace!(reference = %key, "schema served from memory");
            return Ok(schema);
        }

        let schema = self.inner.load(ctx, reference)?;
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&schema));
        Ok(schema)
    }
}

/// The standard loader stack: memoised, with files for plain paths and
/// `file://` URLs, and HTTP for `http(s)://` URLs.
#[cfg(feature = "remote")]
pub fn default_loader(
    files: FileLoader,
    http: crate::http::HttpLoader,
) -> CacheLoader<SchemeLoader> {
    CacheLoader::new(
        SchemeLoader::new()
            .with("", files.clone())
            .with("file", files)
            .with("http", http.clone())
            .with("https", http),
    )
}

/// The standard loader stack without network access.
#[cfg(not(feature = "remote"))]
pub fn default_loader(files: FileLoader) -> CacheLoader<SchemeLoader> {
    CacheLoader::new(
        SchemeLoader::new()
            .with("", files.clone())
            .with("file", files),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn file_loader(dir: &TempDir, base: &str) -> FileLoader {
        FileLoader::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
            base,
        )
    }

    #[test]
    fn format_from_path() {
        assert_eq!(Format::from_path("values.yaml"), Format::Yaml);
        assert_eq!(Format::from_path("values.YML"), Format::Yaml);
        assert_eq!(Format::from_path("schema.json"), Format::Json);
        assert_eq!(Format::from_path("schema"), Format::Json);
    }

    #[test]
    fn file_loader_decodes_json_and_yaml() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.json", r#"{"type": "string"}"#);
        write(&dir, "b.yaml", "type: integer\n");

        let loader = file_loader(&dir, "");
        let ctx = LoadContext::new();
        assert_eq!(
            loader.load(&ctx, "a.json").unwrap().r#type,
            Some(serde_json::json!("string"))
        );
        assert_eq!(
            loader.load(&ctx, "b.yaml#/ignored").unwrap().r#type,
            Some(serde_json::json!("integer"))
        );
    }

    #[test]
    fn file_loader_resolves_against_base() {
        let dir = TempDir::new().unwrap();
        write(&dir, "charts/app/schema.json", r#"{"title": "app"}"#);

        let loader = file_loader(&dir, "charts/app");
        let schema = loader.load(&LoadContext::new(), "schema.json").unwrap();
        assert_eq!(schema.title, "app");
    }

    #[test]
    fn file_loader_accepts_file_urls_inside_root() {
        let dir = TempDir::new().unwrap();
        write(&dir, "a.json", r#"{"title": "a"}"#);

        let loader = file_loader(&dir, "");
        let url = Url::from_file_path(dir.path().canonicalize().unwrap().join("a.json")).unwrap();
        let schema = loader.load(&LoadContext::new(), url.as_str()).unwrap();
        assert_eq!(schema.title, "a");
    }

    #[test]
    fn file_loader_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        write(&dir, "sandbox/inner.json", "{}");
        write(&dir, "outside.json", "{}");

        let root = Utf8PathBuf::from_path_buf(dir.path().join("sandbox")).unwrap();
        let loader = FileLoader::new(root, "");
        let ctx = LoadContext::new();

        assert!(loader.load(&ctx, "inner.json").is_ok());
        assert!(matches!(
            loader.load(&ctx, "../outside.json"),
            Err(LoadError::PathEscape { .. })
        ));
        let absolute = dir.path().join("outside.json");
        assert!(matches!(
            loader.load(&ctx, absolute.to_str().unwrap()),
            Err(LoadError::PathEscape { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn file_loader_rejects_symlinks_out_of_root() {
        let dir = TempDir::new().unwrap();
        write(&dir, "sandbox/keep.json", "{}");
        write(&dir, "secret.json", "{}");
        std::os::unix::fs::symlink(
            dir.path().join("secret.json"),
            dir.path().join("sandbox/link.json"),
        )
        .unwrap();

        let root = Utf8PathBuf::from_path_buf(dir.path().join("sandbox")).unwrap();
        let loader = FileLoader::new(root, "");
        assert!(matches!(
            loader.load(&LoadContext::new(), "link.json"),
            Err(LoadError::PathEscape { .. })
        ));
    }

    #[test]
    fn file_loader_wraps_decode_errors_with_reference() {
        let dir = TempDir::new().unwrap();
        write(&dir, "broken.json", "{ not json");

        let err = file_loader(&dir, "")
            .load(&LoadContext::new(), "broken.json")
            .unwrap_err();
        assert!(matches!(&err, LoadError::Decode { reference, .. } if reference == "broken.json"));
        assert!(err.to_string().starts_with("decode broken.json: invalid JSON"));
    }

    #[test]
    fn file_loader_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = file_loader(&dir, "")
            .load(&LoadContext::new(), "missing.json")
            .unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    impl Loader for CountingLoader {
        fn load(&self, _ctx: &LoadContext, reference: &str) -> Result<Arc<Schema>, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut schema = Schema::new();
            schema.title = reference.to_string();
            Ok(Arc::new(schema))
        }
    }

    #[test]
    fn scheme_loader_dispatches_by_scheme() {
        let loader = SchemeLoader::new()
            .with("", CountingLoader { calls: AtomicUsize::new(0) })
            .with("https", CountingLoader { calls: AtomicUsize::new(0) });
        let ctx = LoadContext::new();

        assert!(loader.load(&ctx, "foo.json").is_ok());
        assert!(loader.load(&ctx, "https://example.com/foo.json").is_ok());

        let err = loader.load(&ctx, "ftp://example.com/foo.json").unwrap_err();
        match err {
            LoadError::UnsupportedScheme { scheme, supported } => {
                assert_eq!(scheme, "ftp");
                assert_eq!(supported, ["https"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cache_loader_returns_same_instance() {
        let loader = CacheLoader::new(CountingLoader {
            calls: AtomicUsize::new(0),
        });
        let ctx = LoadContext::new();

        let first = loader.load(&ctx, "https://example.com/a.json").unwrap();
        let second = loader.load(&ctx, "https://example.com/a.json#/$defs/x").unwrap();
        let other = loader.load(&ctx, "https://example.com/b.json").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(loader.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_loader_normalises_paths() {
        let loader = CacheLoader::new(CountingLoader {
            calls: AtomicUsize::new(0),
        });
        let ctx = LoadContext::new();

        let first = loader.load(&ctx, "schemas/a.json").unwrap();
        let second = loader.load(&ctx, "./schemas/../schemas/a.json").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
