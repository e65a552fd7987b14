use tracing_subscriber::EnvFilter;

use super::config::Config;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Verbose diagnostics go to
/// `debug`, user errors to `error` with target `user`.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
