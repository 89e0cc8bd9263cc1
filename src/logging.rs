//! Logging initialisation.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` read from
//! `SFB_LOG` (falling back to the given default directive) and either a
//! human-readable or a JSON formatter.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the filter directive, e.g. `sfb_sftp=debug`.
pub const LOG_ENV: &str = "SFB_LOG";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber. Returns `false` when one was already
/// installed, in which case nothing changes.
pub fn init(format: LogFormat, default_directive: &str) -> bool {
    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(format = ?format, "logging initialised");
    }
    installed
}
