use clap::{ArgAction, Parser, Subcommand};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "timebox",
    version,
    author,
    about = "Screenshot OCR scheduling and search indexing service"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the scheduler loop until interrupted.
    Run,
    /// Print work-store statistics and exit.
    Status,
}
