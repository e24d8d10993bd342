use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI для QuiverGC: симуляция сборки мусора и просмотр профиля утилизации
#[derive(Parser, Debug)]
#[command(name = "quivergc", version, about = "QuiverGC CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Build an in-memory log, delete a share of records and run the GC to convergence
    Simulate {
        /// Number of fully written files before deletion
        #[arg(long, default_value_t = 64)]
        files: u64,
        #[arg(long, default_value_t = 4096)]
        file_length: u64,
        /// On-log size of one record (header included)
        #[arg(long, default_value_t = 128)]
        record_size: u64,
        /// Share of records to delete, percent
        #[arg(long, default_value_t = 60)]
        delete_percent: u64,
        #[arg(long, default_value_t = 50)]
        min_utilization: u64,
        /// Use exclusive GC transactions (many files per transaction)
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        exclusive: bool,
        /// Full compaction instead of background passes
        #[arg(long)]
        full: bool,
        /// Seed for choosing deleted records
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
        /// Save the resulting utilization profile into this file
        #[arg(long)]
        save_profile: Option<PathBuf>,
        /// Give up waiting for convergence after this many ms
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
        #[arg(long)]
        json: bool,
    },
    /// Print a persisted utilization profile (binary store file or JSON dump)
    Profile {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
}
