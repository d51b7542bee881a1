//! Helm Values Schema CLI
//!
//! Command-line interface for bundling `values.schema.json` files.

use std::path::PathBuf;
use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use helm_values_schema::{
    bundle_remove_ids, bundle_schema, decode_document, default_loader, remove_unused_defs,
    FileLoader, Format, LoadContext, Ptr, Referrer, Schema,
};
#[cfg(feature = "remote")]
use helm_values_schema::{DiskCache, HttpLoader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "helm-values-schema")]
#[command(about = "Bundle external $ref targets of a JSON Schema into $defs")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inline every externally referenced schema into $defs
    Bundle {
        /// Root schema file (JSON or YAML)
        schema: Utf8PathBuf,

        /// Directory files may be loaded from (default: current directory)
        #[arg(long)]
        bundle_root: Option<Utf8PathBuf>,

        /// Rewrite $refs to local pointers and drop $id from bundled definitions
        #[arg(long)]
        without_id: bool,

        /// Keep $defs and definitions that nothing refers to
        #[arg(long)]
        keep_unused_defs: bool,

        /// HTTP cache directory
        #[arg(long, conflicts_with = "no_http_cache")]
        http_cache: Option<PathBuf>,

        /// Always fetch over the network
        #[arg(long)]
        no_http_cache: bool,

        /// Output file (stdout if not specified)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Pretty-print JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Show which nodes a JSON Pointer passes through
    Pointer {
        /// Schema file (JSON or YAML)
        schema: Utf8PathBuf,

        /// JSON Pointer, e.g. "/properties/image" or "#/$defs/foo"
        pointer: String,
    },
}

struct BundleArgs {
    schema: Utf8PathBuf,
    bundle_root: Option<Utf8PathBuf>,
    without_id: bool,
    keep_unused_defs: bool,
    http_cache: Option<PathBuf>,
    no_http_cache: bool,
    output: Option<PathBuf>,
    pretty: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.log_level);

    let result = match cli.command {
        Commands::Bundle {
            schema,
            bundle_root,
            without_id,
            keep_unused_defs,
            http_cache,
            no_http_cache,
            output,
            pretty,
        } => run_bundle(BundleArgs {
            schema,
            bundle_root,
            without_id,
            keep_unused_defs,
            http_cache,
            no_http_cache,
            output,
            pretty,
        }),
        Commands::Pointer { schema, pointer } => run_pointer(&schema, &pointer),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

fn setup_logging(level: tracing::Level) {
    let env_filter = match EnvFilter::builder()
        .with_default_directive(level.into())
        .try_from_env()
    {
        Ok(filter) => filter,
        Err(err) => {
            if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
                eprintln!("invalid log filter: {err}");
                eprintln!("falling back to default logging");
            }
            EnvFilter::new(level.to_string().to_ascii_lowercase())
        }
    };
    let _ = tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_schema(path: &Utf8Path) -> Result<Schema, u8> {
    let bytes = std::fs::read(path).map_err(|e| {
        eprintln!("Error reading {}: {}", path, e);
        3u8
    })?;
    let mut schema = decode_document(path.as_str(), &bytes, Format::from_path(path.as_str()))
        .map_err(|e| {
            eprintln!("Error: {}", e);
            e.exit_code() as u8
        })?;
    let dir = path.parent().map(Utf8Path::to_path_buf).unwrap_or_default();
    schema.set_referrer(&Referrer::dir(dir));
    Ok(schema)
}

fn current_dir() -> Result<Utf8PathBuf, u8> {
    std::env::current_dir()
        .ok()
        .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
        .ok_or_else(|| {
            eprintln!("Error: current directory is not accessible as UTF-8 path");
            3u8
        })
}

#[cfg(feature = "remote")]
fn build_loader(files: FileLoader, args: &BundleArgs) -> Result<impl helm_values_schema::Loader, u8> {
    let mut http = HttpLoader::new().map_err(|e| {
        eprintln!("Error: {}", e);
        e.exit_code() as u8
    })?;
    if !args.no_http_cache {
        match args.http_cache.clone().or_else(DiskCache::default_dir) {
            Some(dir) => {
                tracing::debug!(dir = %dir.display(), "using HTTP cache");
                http = http.with_cache(std::sync::Arc::new(DiskCache::new(dir)));
            }
            None => tracing::warn!("no cache directory available, HTTP cache disabled"),
        }
    }
    Ok(default_loader(files, http))
}

#[cfg(not(feature = "remote"))]
fn build_loader(files: FileLoader, _args: &BundleArgs) -> Result<impl helm_values_schema::Loader, u8> {
    Ok(default_loader(files))
}

fn run_bundle(args: BundleArgs) -> Result<(), u8> {
    let mut schema = read_schema(&args.schema)?;

    let cwd = current_dir()?;
    let bundle_root = args.bundle_root.clone().unwrap_or_else(|| cwd.clone());
    // Relative ids are relative to the working directory, not the root.
    let files = FileLoader::new(bundle_root, cwd);
    let loader = build_loader(files, &args)?;

    bundle_schema(&LoadContext::new(), &loader, &mut schema).map_err(|e| {
        eprintln!("Error bundling refs: {}", e);
        e.exit_code() as u8
    })?;

    if args.without_id {
        bundle_remove_ids(&mut schema).map_err(|e| {
            eprintln!("Error: {}", e);
            e.exit_code() as u8
        })?;
    }
    if !args.keep_unused_defs {
        let removed = remove_unused_defs(&mut schema);
        tracing::info!(removed, "removed unused definitions");
    }

    let json_output = if args.pretty {
        serde_json::to_string_pretty(&schema)
    } else {
        serde_json::to_string(&schema)
    }
    .map_err(|e| {
        eprintln!("Error serializing output: {}", e);
        2u8
    })?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &json_output).map_err(|e| {
                eprintln!("Error writing to {}: {}", path.display(), e);
                3u8
            })?;
        }
        None => {
            println!("{}", json_output);
        }
    }

    Ok(())
}

fn run_pointer(path: &Utf8Path, pointer: &str) -> Result<(), u8> {
    let schema = read_schema(path)?;
    let ptr = Ptr::parse(pointer);
    let trail = ptr.resolve(&schema);

    let Some((reached, node)) = trail.last() else {
        return Err(2);
    };
    if reached.len() != ptr.len() {
        eprintln!("Error: {} does not resolve, stopped at {}", ptr, reached);
        return Err(2);
    }

    let output = serde_json::json!({
        "trail": trail.iter().map(|(p, _)| p.to_string()).collect::<Vec<_>>(),
        "node": node,
    });
    let json_output = serde_json::to_string_pretty(&output).map_err(|e| {
        eprintln!("Error serializing output: {}", e);
        2u8
    })?;
    println!("{}", json_output);
    Ok(())
}
