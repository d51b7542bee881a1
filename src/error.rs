//! Error types for loading and bundling schemas.

use std::path::PathBuf;
use thiserror::Error;

use crate::ptr::Ptr;

/// Errors decoding a schema document.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors loading a referenced document.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid reference {reference:?}: {source}")]
    InvalidReference {
        reference: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported operation: cannot load scheme {scheme:?}, supported schemes: {}", supported.join(", "))]
    UnsupportedScheme {
        scheme: String,
        supported: Vec<String>,
    },

    #[error("path escapes parent: {path} is outside of {root}")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decode {reference}: {source}")]
    Decode {
        reference: String,
        #[source]
        source: DecodeError,
    },

    #[error("request {url}: deadline exceeded")]
    DeadlineExceeded { url: String },

    #[cfg(feature = "remote")]
    #[error("request {url}: {source}")]
    HttpTransport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request {url}: unexpected status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("request {url}: aborted after reading more than {limit} bytes")]
    SizeLimitExceeded { url: String, limit: u64 },

    #[error("request {url}: unsupported content encoding {encoding:?}")]
    UnsupportedContentEncoding { url: String, encoding: String },

    #[error("request {url}: unsupported charset {charset:?}")]
    UnsupportedCharset { url: String, charset: String },

    #[error("request {url}: read body: {source}")]
    ReadBody {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoadError::Io { .. }
            | LoadError::DeadlineExceeded { .. }
            | LoadError::HttpStatus { .. }
            | LoadError::SizeLimitExceeded { .. }
            | LoadError::ReadBody { .. } => 3,
            #[cfg(feature = "remote")]
            LoadError::HttpTransport { .. } => 3,
            _ => 2,
        }
    }
}

/// Errors from the HTTP cache store. `HttpLoader` never surfaces these.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache record {path}: {source}")]
    Encoding {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors during bundling. Each names the node being processed.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("{ptr}: {source}")]
    Load {
        ptr: Ptr,
        #[source]
        source: LoadError,
    },

    #[error("{ptr}: invalid $ref {reference:?}: {source}")]
    InvalidReference {
        ptr: Ptr,
        reference: String,
        #[source]
        source: url::ParseError,
    },

    #[error("{ptr}: $ref {reference:?} does not match any bundled definition")]
    DanglingReference { ptr: Ptr, reference: String },
}

impl BundleError {
    /// Location of the node that failed.
    pub fn ptr(&self) -> &Ptr {
        match self {
            BundleError::Load { ptr, .. }
            | BundleError::InvalidReference { ptr, .. }
            | BundleError::DanglingReference { ptr, .. } => ptr,
        }
    }

    /// Returns the exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            BundleError::Load { source, .. } => source.exit_code(),
            _ => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_error_exit_codes() {
        let err = LoadError::Io {
            path: PathBuf::from("values.schema.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.exit_code(), 3);

        let err = LoadError::PathEscape {
            path: PathBuf::from("/etc/passwd"),
            root: PathBuf::from("/charts"),
        };
        assert_eq!(err.exit_code(), 2);

        let err = LoadError::HttpStatus {
            url: "https://example.com/a.json".into(),
            status: 404,
        };
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn bundle_error_carries_location() {
        let err = BundleError::DanglingReference {
            ptr: Ptr::from_tokens(["properties", "image"]),
            reference: "image.json".into(),
        };
        assert_eq!(err.ptr().to_string(), "/properties/image");
        assert_eq!(
            err.to_string(),
            r#"/properties/image: $ref "image.json" does not match any bundled definition"#
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unsupported_scheme_lists_supported() {
        let err = LoadError::UnsupportedScheme {
            scheme: "ftp".into(),
            supported: vec!["file".into(), "http".into()],
        };
        assert_eq!(
            err.to_string(),
            r#"unsupported operation: cannot load scheme "ftp", supported schemes: file, http"#
        );
    }
}
