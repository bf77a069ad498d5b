use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ConfigLoader;
use crate::storage;

pub mod commands;

use self::commands::{AddArgs, EditArgs, IdArgs, ListArgs};

#[derive(Parser, Debug)]
#[command(
    name = "vocab",
    version,
    about = "Personal vocabulary list with time-grouped history and random review"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over VOCAB_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over VOCAB_DATA)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print entries grouped by when they were added (default)
    List(ListArgs),
    /// Add a new entry
    Add(AddArgs),
    /// Change the text or translation of an entry
    Edit(EditArgs),
    /// Delete an entry
    Delete(IdArgs),
    /// Toggle the learned flag of an entry
    Learn(IdArgs),
    /// Show a random entry to review
    Next,
    /// Print entry counters
    Stats,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var("VOCAB_CONFIG", path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var("VOCAB_DATA", path);
    }

    let loader = ConfigLoader::discover()?;
    loader.paths().ensure_directories()?;
    let paths = loader.paths().clone();
    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let config = loader.load_or_init()?;
    let storage = storage::init(&paths, &config.storage)?;

    let mut engine = commands::open_engine(&config, storage)?;
    let command = cli.command.unwrap_or(Commands::List(ListArgs::default()));
    let output = match command {
        Commands::List(args) => commands::list_entries(&mut engine, &args),
        Commands::Add(args) => commands::add_entry(&mut engine, args),
        Commands::Edit(args) => commands::edit_entry(&mut engine, args),
        Commands::Delete(args) => commands::delete_entry(&mut engine, &args),
        Commands::Learn(args) => commands::toggle_learned(&mut engine, &args),
        Commands::Next => commands::next_random(&mut engine),
        Commands::Stats => commands::show_stats(&mut engine),
    };
    engine.shutdown();
    print!("{}", output?);
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
