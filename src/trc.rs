//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

enum TrcMode {
    /// Plain output, for users who asked for a specific filter.
    Plain,
    /// Compact output routed through indicatif.
    Pretty,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let maybe_env_filter =
            EnvFilter::try_from_env("DEEPFS_LOG").or_else(|_| EnvFilter::try_from_default_env());

        match maybe_env_filter {
            // Someone who sets a filter wants the raw output.
            Ok(env_filter) => Self {
                mode: TrcMode::Plain,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Plain => tracing_subscriber::fmt()
                .with_env_filter(self.env_filter)
                .with_writer(std::io::stderr)
                .finish()
                .try_init(),
            TrcMode::Pretty => {
                let indicatif_layer = IndicatifLayer::new();
                tracing_subscriber::registry()
                    .with(self.env_filter)
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(indicatif_layer.get_stderr_writer())
                            .with_target(false)
                            .without_time()
                            .compact(),
                    )
                    .with(indicatif_layer)
                    .try_init()
            }
        }
    }
}
