//! Tracing subscriber setup shared by the CLI and embedding hosts.

use crate::defaults::ENV_LOG;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Install the global `tracing` subscriber once.
///
/// The filter is read from `STRAND_LOG`, then `RUST_LOG`; without either,
/// `default_level` applies. Later calls are no-ops.
pub fn init(default_level: Level) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(ENV_LOG)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::default().add_directive(default_level.into()));
        let installed = SubscriberBuilder::default()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
        if installed.is_err() {
            // another subscriber owns the global slot; keep it
            return;
        }
        tracing::debug!("tracing initialised");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(Level::WARN);
        init(Level::DEBUG);
        assert!(INIT.get().is_some());
    }
}
