//! Warren CLI entry point.

use color_eyre::eyre::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use warren::cli::Cli;

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments, or pick the profile from argv[0]
    let cli = Cli::from_env();

    // Initialize tracing; stdout is reserved for command output
    let directive = match cli.verbosity() {
        0 => "warren=info",
        1 => "warren=debug",
        _ => "warren=trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    // Execute command
    cli.execute()
}
