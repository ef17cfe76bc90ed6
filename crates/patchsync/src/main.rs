#![doc = include_str!("../README.md")]

/// CLI module - command-line interface for patchsync
mod cli;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    cli::run_cli();
}
