use anyhow::Result;
use clap::Parser;
use env_logger::{Builder, Env};
use log::error;

mod cli;
mod cmd_profile;
mod cmd_simulate;

fn init_logger() {
    // Уровень берём из RUST_LOG, иначе дефолт — info.
    // Пример: RUST_LOG=debug ./quivergc simulate ...
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = cli::Cli::parse();
    match cli.cmd {
        cli::Cmd::Simulate {
            files,
            file_length,
            record_size,
            delete_percent,
            min_utilization,
            exclusive,
            full,
            seed,
            save_profile,
            timeout_ms,
            json,
        } => cmd_simulate::exec(cmd_simulate::SimulateArgs {
            files,
            file_length,
            record_size,
            delete_percent,
            min_utilization,
            exclusive,
            full,
            seed,
            save_profile,
            timeout_ms,
            json,
        }),

        cli::Cmd::Profile { path, json } => cmd_profile::exec(path, json),
    }
}
