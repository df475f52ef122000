//! Tracing configuration and initialization.

use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable consulted first for the log filter.
pub const LOG_ENV_VAR: &str = "RFS_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrcMode {
    /// Compact single-line output without timestamps, for interactive use.
    Compact,
    /// Plain verbose output including span enter/close events.
    Verbose,
}

/// Subscriber builder for binaries embedding the client.
#[derive(Debug)]
pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env(LOG_ENV_VAR).or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // An explicit filter means someone is debugging; give them the spans.
            Ok(env_filter) => Self {
                mode: TrcMode::Verbose,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Compact,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// Force the plain verbose format regardless of the environment.
    #[must_use]
    pub fn verbose(mut self) -> Self {
        self.mode = TrcMode::Verbose;
        self
    }

    /// Replace the filter directive, e.g. `"rfs_client=debug"`.
    #[must_use]
    pub fn with_filter(mut self, directive: &str) -> Self {
        self.env_filter = EnvFilter::new(directive);
        self
    }

    /// Installs the global subscriber.
    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Verbose => tracing_subscriber::registry()
                .with(self.env_filter)
                .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE))
                .try_init(),
            TrcMode::Compact => tracing_subscriber::registry()
                .with(self.env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .without_time()
                        .compact(),
                )
                .try_init(),
        }
    }
}
