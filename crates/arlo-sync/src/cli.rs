//! Clap derive structures for the `arlo-sync` binary.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// arlo-sync -- mirror an Arlo account's devices locally
#[derive(Debug, Parser)]
#[command(
    name = "arlo-sync",
    version,
    about = "Keep a local mirror of an Arlo account's devices in sync",
    long_about = "Logs in to the Arlo cloud, enumerates the account's devices, follows the\n\
        push channel and runs periodic refreshes until interrupted. State is saved\n\
        to the profile's storage directory on exit."
)]
pub struct Cli {
    /// Account profile to use
    #[arg(long, short = 'p', env = "ARLO_PROFILE")]
    pub profile: Option<String>,

    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the profile's storage directory
    #[arg(long, value_name = "DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Append every push packet to the dump file
    #[arg(long)]
    pub dump_packets: bool,

    /// Return as soon as connect() does instead of waiting for the initial refresh
    #[arg(long)]
    pub no_wait: bool,

    /// Log format
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
