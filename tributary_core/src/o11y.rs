//! Logging setup shared by every Tributary binary.

use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("TRIBUTARY_LOG_FORMAT").as_deref() {
            Ok("pretty") | Ok("text") => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Install the global subscriber using `RUST_LOG` (default `info`) and `TRIBUTARY_LOG_FORMAT`.
pub fn init_global_from_env() -> Result<()> {
    init_global(LogFormat::from_env())
}

pub fn init_global(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let res = match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };
    res.map_err(|e| Error::Conflict(format!("tracing subscriber already installed: {e}")))
}
