use tracing_subscriber::{fmt, EnvFilter};

use crate::util::env::env_flag;

/// Pipeline logs at info; sqlx and the actix accept loop only when something is wrong.
pub const DEFAULT_FILTER: &str = "info,igdb=info,sqlx=warn,actix_server=warn";

/// Install the process-wide subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. `LOG_ANSI=0` turns colours off for log
/// shippers that do not strip escape codes.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| anyhow::anyhow!("invalid log filter '{default_filter}': {e}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_ansi(env_flag("LOG_ANSI", true))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_valid() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
