//! Sandbox controller CLI - run programs behind a filesystem broker

mod cli;
mod commands;
mod logging;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use commands::check_requirements;
use console::style;
use runner::run_sandbox;

fn main() {
    let cli = Cli::parse();

    logging::init_logger(cli.verbose);

    match cli.command {
        Commands::Check => check_requirements(),
        Commands::Run(args) => match run_sandbox(args) {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                eprintln!("{} {}", style("error:").red().bold(), e);
                std::process::exit(1);
            }
        },
    }
}
