use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = migration_kernel_cli::Cli::parse();
    migration_kernel_cli::run_cli(cli)
}
