use crate::error::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes a `tracing` subscriber with the given filter directive.
///
/// Intended for binaries and tests embedding the store; libraries should
/// leave subscriber installation to their host.
pub fn init(filter: &str) -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter)
                .map_err(|e| Error::Other(format!("invalid log filter: {e}")))?,
        )
        .with_target(true)
        .try_init()
        .map_err(|_| Error::Other("logging already initialized".into()))
}
