//! Storage management command

use clap::{Args, Subcommand};
use console::style;

use provena_core::config::load_config_or_default;
use provena_pipeline::DirStorage;

use crate::cli::{Cli, OutputFormat};

/// Persistent storage management
#[derive(Debug, Args)]
pub struct StorageCommand {
    #[command(subcommand)]
    pub action: StorageAction,
}

/// Storage subcommands
#[derive(Debug, Subcommand)]
pub enum StorageAction {
    /// Show storage statistics
    Status(StorageStatusCommand),
    /// Remove every stored entry
    Clear(StorageClearCommand),
}

/// Show storage statistics
#[derive(Debug, Args)]
pub struct StorageStatusCommand;

/// Remove every stored entry
#[derive(Debug, Args)]
pub struct StorageClearCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl StorageCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        match &self.action {
            StorageAction::Status(cmd) => cmd.execute(cli),
            StorageAction::Clear(cmd) => cmd.execute(cli),
        }
    }
}

fn open_storage() -> anyhow::Result<DirStorage> {
    let cwd = std::env::current_dir()?;
    let (config, _) = load_config_or_default(&cwd);
    Ok(DirStorage::from_config(&config.storage, &cwd))
}

impl StorageStatusCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let storage = open_storage()?;
        let stats = storage.status()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "entries": stats.entries,
                "total_size": stats.total_size,
                "total_size_formatted": stats.formatted_size(),
                "root": storage.root().display().to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", style("Storage Status").bold());
            println!();
            println!("  Location: {}", style(storage.root().display()).cyan());
            println!("  Entries:  {}", stats.entries);
            println!("  Size:     {}", style(stats.formatted_size()).yellow());
        }

        Ok(())
    }
}

impl StorageClearCommand {
    fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let storage = open_storage()?;
        let root = storage.root().to_path_buf();

        if !root.exists() {
            if !cli.quiet {
                println!("{} Storage directory does not exist.", style("✓").green());
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!("Remove all stored entries at {}?", root.display()))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{} Aborted.", style("✗").red());
                return Ok(());
            }
        }

        let stats = storage.clear()?;

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "removed": stats.entries,
                "freed": stats.total_size,
                "freed_formatted": stats.formatted_size(),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "{} Removed {} entries ({})",
                style("✓").green(),
                stats.entries,
                stats.formatted_size()
            );
        }

        Ok(())
    }
}
