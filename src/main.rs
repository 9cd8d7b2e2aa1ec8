use clap::Parser;
use tracing_subscriber::EnvFilter;

use skycam_calib::cli::{Cli, Commands};
use skycam_calib::commands::{inspect, process_image};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Process {
            fits,
            reference,
            config,
            options,
            preview,
            format,
        } => {
            process_image(
                &fits,
                &reference,
                config.as_deref(),
                &options,
                preview,
                &format,
            )?;
        }
        Commands::Inspect {
            path,
            all_keywords,
            format,
        } => {
            inspect(&path, all_keywords, &format)?;
        }
    }

    Ok(())
}
