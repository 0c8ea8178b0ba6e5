//! `tracing`/`tracing-subscriber` bring-up with a runtime-reloadable
//! `EnvFilter`, grounded on the teacher's
//! `tracing_subscriber_config_utils::init_logging` and its
//! `tracing_subscriber::reload::Layer`. Here the reload is driven by
//! `SIGUSR1`/`SIGUSR2` stepping through [`crate::signals::VERBOSITY_LADDER`]
//! rather than an HTTP endpoint.

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

pub struct LoggingHandle {
    reload_handle: reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl LoggingHandle {
    pub fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::builder()
            .parse(level)
            .with_context(|| format!("invalid log level {level:?}"))?;
        self.reload_handle
            .reload(filter)
            .context("failed to reload log filter")
    }
}

/// `-d <level>` plus `RUST_LOG` as a default-directive fallback, matching
/// the CLI surface in spec.md §6.
pub fn init_logging(default_level: &str, json: bool) -> anyhow::Result<LoggingHandle> {
    let initial = EnvFilter::builder()
        .with_default_directive(default_level.parse().context("bad default log level")?)
        .from_env()
        .context("invalid RUST_LOG value")?;

    let (filter_layer, reload_handle) = reload::Layer::new(initial);

    let fmt_layer: Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync> =
        if json {
            Box::new(fmt::layer().json())
        } else {
            Box::new(fmt::layer())
        };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter_layer))
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(LoggingHandle { reload_handle })
}
