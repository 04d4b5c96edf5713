use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = eval_calibration_cli::Cli::parse();
    eval_calibration_cli::run_cli(cli)
}
