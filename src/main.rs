use clap::Parser;
use spanner_gateway_shim::cli;

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    cli.run()
}
