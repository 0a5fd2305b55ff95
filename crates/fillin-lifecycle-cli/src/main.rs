use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    fillin_lifecycle_cli::init_tracing();
    let cli = fillin_lifecycle_cli::Cli::parse();
    fillin_lifecycle_cli::run_cli(cli)
}
