use labctl::clienv;
use std::io::IsTerminal;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default level for one-shot commands; their stdout is operator output.
pub(crate) const CLI_LOG_LEVEL: &str = "warn";
/// Default level for the supervisor and the subprocesses it launches.
pub(crate) const SERVICE_LOG_LEVEL: &str = "info";

/// Install the global subscriber. `LAB_LOG` wins over `RUST_LOG`. Output
/// redirected to a log file stays plain so its timestamps lead each line.
pub(crate) fn initialize_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env(clienv::ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .init();
}
