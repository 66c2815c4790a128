mod cmd;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "husk")]
#[command(about = "Analyze whether a container image is rootless, shell-less, and distroless — without running it")]
#[command(version)]
struct Cli {
    /// Override runtime selection (docker, podman)
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Output as JSON (optionally to a file)
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "-")]
    json: Option<String>,

    /// Keep the scratch directory (exported archive included) instead of deleting it
    #[arg(long, global = true)]
    keep: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Image reference or tar archive path (shorthand for `husk analyze <image>`)
    image: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a container image
    Analyze {
        /// Image reference or path to a tar archive
        image: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Resolve: `husk <image>` is shorthand for `husk analyze <image>`
    let image = match &cli.command {
        Some(Commands::Analyze { image }) => Some(image.clone()),
        None => cli.image.clone(),
    };

    let Some(image) = image else {
        Cli::parse_from(["husk", "--help"]);
        return Ok(());
    };

    cmd::analyze::run(&image, cli.runtime.as_deref(), cli.json.as_deref(), cli.keep)
}
