// src/lib.rs
// Public library surface for the `ingest` binary and integration tests.

pub mod catalog;
pub mod error;
pub mod index;
pub mod ingest;
pub mod metrics;

// ---- Re-exports for stable public API ----
pub use crate::catalog::{load_catalog, Catalog, DatasetDescriptor};
pub use crate::error::{CatalogError, DatasetError};
pub use crate::ingest::report::{Outcome, RunReport};
pub use crate::ingest::{run, run_datasets};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const ENV_LOG_FORMAT: &str = "INGEST_LOG_FORMAT";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise pipeline targets log at info and the rest at warn.
/// `INGEST_LOG_FORMAT=json` switches to one JSON object per line (for CI log shipping).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ingest=info,fetch=info,writer=info,warn"));

    let json = std::env::var(ENV_LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Logs go to stderr so the report on stdout stays machine-readable.
    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = res {
        eprintln!("tracing already initialized: {e}");
    }
}
