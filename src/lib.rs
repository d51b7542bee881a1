//! Helm Values Schema Bundler
//!
//! Resolves external `$ref`s of a JSON Schema and inlines the referenced
//! documents into the root schema's `$defs`, so a chart's
//! `values.schema.json` is self-contained.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use helm_values_schema::{
//!     bundle_remove_ids, bundle_schema, remove_unused_defs, LoadContext, LoadError, Loader, Schema,
//! };
//!
//! struct Fixed;
//!
//! impl Loader for Fixed {
//!     fn load(&self, _ctx: &LoadContext, _reference: &str) -> Result<Arc<Schema>, LoadError> {
//!         Ok(Arc::new(serde_json::from_str(r#"{"type": "number"}"#).unwrap()))
//!     }
//! }
//!
//! let mut root: Schema = serde_json::from_str(r#"{"items": {"$ref": "foo.json"}}"#).unwrap();
//! bundle_schema(&LoadContext::new(), &Fixed, &mut root).unwrap();
//! bundle_remove_ids(&mut root).unwrap();
//! remove_unused_defs(&mut root);
//!
//! assert_eq!(
//!     serde_json::to_value(&root).unwrap(),
//!     serde_json::json!({
//!         "items": {"$ref": "#/$defs/foo.json"},
//!         "$defs": {"foo.json": {"type": "number"}}
//!     })
//! );
//! ```
//!
//! # Passes
//!
//! | Function | Effect |
//! |----------|--------|
//! | [`bundle_schema`] | Load referenced documents into `$defs`, keyed by canonical `$id` |
//! | [`bundle_remove_ids`] | Rewrite external `$ref`s to `#/$defs/...`, drop bundled `$id`s |
//! | [`remove_unused_defs`] | Prune unreferenced `$defs`/`definitions`, to a fixpoint |
//!
//! # Loaders
//!
//! Documents are fetched through the [`Loader`] trait. [`default_loader`]
//! stacks a [`CacheLoader`] over a [`SchemeLoader`] that sends plain paths and
//! `file://` URLs to a sandboxed [`FileLoader`] and, with the `remote`
//! feature, `http(s)://` URLs to an `HttpLoader` backed by an HTTP cache.

mod bundle;
mod error;
mod keyword;
mod loader;
mod ptr;
mod referrer;
mod schema;

#[cfg(feature = "remote")]
mod http;
#[cfg(feature = "remote")]
mod httpcache;

pub use bundle::{bundle_remove_ids, bundle_schema, remove_unused_defs};
pub use error::{BundleError, CacheError, DecodeError, LoadError};
pub use keyword::{Children, ChildrenMut, Keyword, Slot, SlotMut};
pub use loader::{
    decode_document, default_loader, CacheLoader, FileLoader, Format, LoadContext, Loader,
    SchemeLoader,
};
pub use ptr::Ptr;
pub use referrer::{clean_path, is_local_ref, split_fragment, Referrer};
pub use schema::{Schema, SchemaKind, SchemaMap};

#[cfg(feature = "remote")]
pub use http::{HttpLoader, ACCEPT_SCHEMA, DEFAULT_SIZE_LIMIT, HTTP_TIMEOUT};
#[cfg(feature = "remote")]
pub use httpcache::{
    max_age, CachedResponse, Clock, DiskCache, HttpCache, MemoryCache, SystemClock,
    CACHE_FILE_EXT,
};
