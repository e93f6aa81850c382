//! tufrepo - create and modify a TUF repository from the command line.
//!
//! Flags can be combined; they run in a fixed order: init, clean, add,
//! remove, trust, sign, key, delegate, revoke.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;
mod files;
mod keygen;
mod prompt;

/// Create and modify TUF repositories.
#[derive(Parser, Debug)]
#[command(name = "tufrepo")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Repository root holding tufrepo/, tufkeystore/ and tufclient/
    #[arg(long, default_value = ".")]
    pub path: PathBuf,

    /// Repository settings file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log verbosity: 0 trace, 1 debug, 2 info, 3 warn, 4-5 error
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=5))]
    pub verbose: u8,

    /// Create a repository with freshly generated top-level keys
    #[arg(long)]
    pub init: bool,

    /// With --init: do not generate or load top-level keys
    #[arg(long, requires = "init")]
    pub bare: bool,

    /// With --init: write consistent snapshots
    #[arg(long, requires = "init")]
    pub consistent_snapshot: bool,

    /// Delete the repository, client and keystore directories
    #[arg(long)]
    pub clean: bool,

    /// Copy these files (or directories) into the repository and claim them
    #[arg(long, num_args = 1..)]
    pub add: Vec<PathBuf>,

    /// With --add: descend into directories
    #[arg(long)]
    pub recursive: bool,

    /// Drop every claimed target path matching these globs
    #[arg(long, num_args = 1..)]
    pub remove: Vec<String>,

    /// Trust --pubkeys for the top-level --role
    #[arg(long, requires = "pubkeys")]
    pub trust: bool,

    /// Public key files (key metadata JSON)
    #[arg(long, num_args = 1..)]
    pub pubkeys: Vec<PathBuf>,

    /// Sign --role with a private key file ("." for the role's keystore key)
    #[arg(long, num_args = 0..=1, default_missing_value = ".")]
    pub sign: Option<PathBuf>,

    /// Generate a key pair of the given type
    #[arg(long, num_args = 0..=1, default_missing_value = "ecdsa", value_parser = ["ecdsa", "ed25519", "rsa"])]
    pub key: Option<String>,

    /// With --key: file stem to write the key pair to
    #[arg(long)]
    pub filename: Option<PathBuf>,

    /// Delegate these path globs from --role to --delegatee
    #[arg(long, num_args = 1.., requires_all = ["delegatee", "pubkeys"])]
    pub delegate: Vec<String>,

    /// Name of the delegated role for --delegate / --revoke
    #[arg(long)]
    pub delegatee: Option<String>,

    /// With --delegate: stop path resolution at this delegation
    #[arg(long)]
    pub terminating: bool,

    /// With --delegate: signatures required from the delegatee's keys
    #[arg(long, default_value_t = 1)]
    pub threshold: u32,

    /// Revoke --delegatee from --role
    #[arg(long, requires = "delegatee")]
    pub revoke: bool,

    /// Role operated on
    #[arg(long, default_value = "targets")]
    pub role: String,

    /// Password for --role's key (flag without a value prompts)
    #[arg(long, num_args = 0..=1, default_value = "pw", default_missing_value = "")]
    pub pw: String,

    #[arg(long, num_args = 0..=1, default_value = "pw", default_missing_value = "")]
    pub root_pw: String,

    #[arg(long, num_args = 0..=1, default_value = "pw", default_missing_value = "")]
    pub targets_pw: String,

    #[arg(long, num_args = 0..=1, default_value = "pw", default_missing_value = "")]
    pub snapshot_pw: String,

    #[arg(long, num_args = 0..=1, default_value = "pw", default_missing_value = "")]
    pub timestamp_pw: String,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        _ => "error",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    commands::Session::new(cli)?.run()
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
