//! Tracing subscriber setup for binaries and tests embedding the orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// What the orchestrator and its pool log, and in which format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level applied to every target without an override.
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-target levels, keyed by crate name (`chainbatch-core`) or module path.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// One JSON object per event, for log shippers.
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `EnvFilter` directive string, e.g. `"info,chainbatch_core=debug"`.
    /// Hyphenated crate names are rewritten to their target form.
    pub fn directives(&self) -> String {
        std::iter::once(self.level.clone())
            .chain(
                self.components
                    .iter()
                    .map(|(target, level)| format!("{}={level}", target.replace('-', "_"))),
            )
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Install the process-wide subscriber. An unparsable directive string falls
/// back to `info`; a second call returns the error from `try_init`.
pub fn init_tracing(config: &LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(config.directives()).unwrap_or_else(|_| EnvFilter::new("info"));
    let (json, text) = if config.json {
        (Some(fmt::layer().json()), None)
    } else {
        (None, Some(fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init()
}
