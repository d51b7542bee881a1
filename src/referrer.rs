//! Where a `$ref` came from, and how to turn it into a canonical id.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use url::Url;

/// Base location a relative `$ref` is resolved against.
///
/// [`Referrer::None`] leaves relative references untouched so they resolve
/// against whatever the loader considers its working location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Referrer {
    #[default]
    None,
    /// A directory, for refs found in files.
    Dir(Utf8PathBuf),
    /// A URL, for refs found in documents fetched over the network.
    Url(Url),
}

impl Referrer {
    pub fn dir(path: impl Into<Utf8PathBuf>) -> Self {
        Referrer::Dir(path.into())
    }

    pub fn url(url: Url) -> Self {
        Referrer::Url(url)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Referrer::None)
    }

    /// The referrer for references inside the document identified by `id`.
    ///
    /// URL ids resolve against the URL itself; path ids against their parent
    /// directory.
    pub fn for_document(id: &str) -> Self {
        let (id, _) = split_fragment(id);
        match Url::parse(id) {
            Ok(url) => Referrer::Url(url),
            Err(_) => Referrer::Dir(
                Utf8Path::new(id)
                    .parent()
                    .map(Utf8Path::to_path_buf)
                    .unwrap_or_default(),
            ),
        }
    }

    /// Resolve `reference` against this referrer, dropping any fragment.
    ///
    /// The result is the canonical id used to recognise documents that were
    /// already bundled.
    pub fn resolve(&self, reference: &str) -> Result<String, url::ParseError> {
        let (location, _) = split_fragment(reference);
        if let Ok(mut url) = Url::parse(location) {
            url.set_fragment(None);
            return Ok(url.into());
        }
        match self {
            Referrer::None => Ok(clean_path(Utf8Path::new(location)).into_string()),
            Referrer::Dir(dir) => {
                let path = Utf8Path::new(location);
                let joined = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    dir.join(path)
                };
                Ok(clean_path(&joined).into_string())
            }
            Referrer::Url(base) => {
                let mut url = base.join(location)?;
                url.set_fragment(None);
                Ok(url.into())
            }
        }
    }
}

/// Split `reference` at the first `#` into location and fragment (without
/// the `#`).
pub fn split_fragment(reference: &str) -> (&str, &str) {
    match reference.split_once('#') {
        Some((location, fragment)) => (location, fragment),
        None => (reference, ""),
    }
}

/// A reference into the current document (`#...`).
pub fn is_local_ref(reference: &str) -> bool {
    reference.starts_with('#')
}

/// Lexically normalise a path: drop `.` components and fold `..` into its
/// parent where one is available.
pub fn clean_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut parts: Vec<Utf8Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match parts.last() {
                Some(Utf8Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}
