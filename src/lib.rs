pub mod collector;
pub mod config;
pub mod container;
pub mod error;
pub mod inspect;
pub mod merger;
pub mod partition;
pub mod registry;
pub mod transport;
pub mod worker;
pub mod workload;

pub use error::*;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(service: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true),
        )
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("[{}] tracing initialised", service);
    }
}
