mod commands;

use crate::commands::{Cli, Commands};
use anyhow::{Context, Result};
use autobackup::{logging, sysexits};
use clap::Parser;
use std::process;
use tokio::runtime::Builder;

/// Entry point for the autobackup CLI application.
/// Parses command-line arguments and dispatches to the appropriate command handler.
fn main() -> Result<()> {
    let cli = Cli::parse();
    let commands = match cli.commands {
        Some(commands) => commands,
        None => {
            eprintln!(
                "autobackup requires a command to execute. See 'autobackup --help' for usage."
            );
            process::exit(sysexits::EX_USAGE);
        }
    };

    logging::init(cli.log_level.as_deref())?;

    let (job, restore) = match commands {
        Commands::Config => {
            commands::config();
            return Ok(());
        }
        Commands::Backup(run) => (commands::load(cli.config, run.once, None), false),
        Commands::Restore { run, file } => (commands::load(cli.config, run.once, file), true),
    };

    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    let result = rt.block_on(async move {
        if restore {
            commands::restore(job).await
        } else {
            commands::backup(job).await
        }
    });

    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(sysexits::exit_code(&e));
    }
    Ok(())
}
