//! podctl - session manager for ephemeral GPU pods
//!
//! Deploys pods from a tier catalog, keeps an SSH control connection to each,
//! forwards the tier's service ports, follows remote logs, samples GPU and
//! cost telemetry, syncs outputs back, and makes sure nothing keeps billing
//! once it is terminated.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod forwarding;
pub mod manager;
pub mod monitor;
pub mod provider;
pub mod retry;
pub mod session;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use error::{Classify, ErrorClass, PodError};
pub use events::{EventBus, PodEvent};
pub use manager::{DeployOptions, DeployOutcome, PodManager, PushReport, Wallet};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
