use std::io::IsTerminal;

use clap_verbosity_flag::{InfoLevel, Verbosity};
use color_eyre::Result;

/// Init the tracing subscriber and error report hooks.
///
/// Diagnostics go to stderr; stdout is reserved for command output.
/// The default level comes from the `-v`/`-q` flags and can still be
/// overridden per target through `RUST_LOG`.
pub fn setup_logging(verbosity: &Verbosity<InfoLevel>) -> Result<()> {
    color_eyre::install()?;

    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, registry};

    let output = std::io::stderr;

    let fmt_layer = fmt::layer()
        .with_writer(output)
        .with_ansi(output().is_terminal())
        .without_time();

    let env_layer = EnvFilter::builder()
        .with_default_directive(
            verbosity.tracing_level_filter().into(),
        )
        .from_env_lossy();

    registry().with(fmt_layer).with(env_layer).init();

    Ok(())
}
