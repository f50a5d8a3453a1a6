//! Observability infrastructure: structured tracing for diagnostics.
//!
//! Operator-facing output (tables, prompts, summaries) is printed by the CLI;
//! everything emitted here is diagnostic and filtered by `RUST_LOG`.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log verbosity.
///
/// The CLI reports progress itself, so library `info!` events only show up
/// in verbose mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Warnings and errors.
    #[default]
    Normal,
    /// Include info, per-device and per-step debug events.
    Verbose,
}

impl Verbosity {
    fn directive(self) -> LevelFilter {
        match self {
            Self::Quiet => LevelFilter::ERROR,
            Self::Normal => LevelFilter::WARN,
            Self::Verbose => LevelFilter::DEBUG,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` directives are honoured on top of the verbosity default.
/// Calling this more than once is harmless; only the first call installs a subscriber.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::from_default_env().add_directive(verbosity.directive().into());

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(verbosity == Verbosity::Verbose)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init();

    if result.is_ok() {
        tracing::debug!(?verbosity, "Observability initialized");
    }
}
