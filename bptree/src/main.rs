#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::io::Write;
use std::path::PathBuf;

use bptree::{BPlusTree, TreeConfig, TreeError};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "bptree",
    version,
    about = "Inspect a B+Tree file",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "FILE")]
    path: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    #[command(about = "Print every floor of the tree (the default)")]
    Dump,

    #[command(about = "Print the value stored under a key")]
    Get {
        #[arg(value_name = "KEY")]
        key: u64,
    },

    #[command(about = "Print file and free-list statistics")]
    Stats,
}

fn run(tree: &BPlusTree, command: &Command, out: &mut impl Write) -> Result<(), TreeError> {
    match command {
        Command::Dump => tree.debug_print(out),
        Command::Get { key } => {
            let value = tree.find(*key)?;
            match std::str::from_utf8(&value) {
                Ok(text) => writeln!(out, "{text}")?,
                Err(_) => writeln!(out, "{value:?}")?,
            }
            Ok(())
        }
        Command::Stats => {
            let stats = tree.stats()?;
            writeln!(out, "file size:        {}", stats.file_size)?;
            writeln!(out, "height:           {}", stats.height)?;
            writeln!(out, "root offset:      {:#x}", stats.root)?;
            writeln!(out, "free index pages: {}", stats.free_index_pages)?;
            writeln!(out, "free data pages:  {}", stats.free_data_pages)?;
            writeln!(out, "entries:          {}", tree.len()?)?;
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bptree=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Dump);

    // Load configuration from environment variables
    let config = match TreeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let tree = match BPlusTree::open_with_config(&cli.path, &config) {
        Ok(tree) => tree,
        Err(e) => {
            tracing::error!("Failed to open {}: {e}", cli.path.display());
            std::process::exit(1);
        }
    };

    let mut stdout = std::io::stdout().lock();
    let result = run(&tree, &command, &mut stdout).and_then(|()| tree.close());
    if let Err(e) = result {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
