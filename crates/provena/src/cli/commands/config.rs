//! Config command

use clap::Args;
use console::style;

use provena_core::config::load_config_or_default;

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Show the effective configuration and where it came from
#[derive(Debug, Args)]
pub struct ConfigCommand {
    /// Also show the resolved concurrency cap
    #[arg(long)]
    pub resolved: bool,
}

impl ConfigCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (config, source) = load_config_or_default(&cwd);
        let max_running_tasks = config.scheduler.resolved_max_running_tasks();

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "source": source.as_ref().map(|path| path.display().to_string()),
                "config": config,
                "resolved_max_running_tasks": max_running_tasks,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }

        if cli.quiet {
            return Ok(());
        }

        match &source {
            Some(path) => output::info(&format!(
                "Loaded {}",
                output::path_style().apply_to(path.display())
            )),
            None => output::warning("No configuration file found, showing defaults"),
        }
        println!();
        println!("{}", toml::to_string_pretty(&config)?.trim_end());

        if self.resolved || cli.verbose {
            println!();
            println!("{}", style("Resolved").bold());
            println!(
                "{}",
                output::key_value("max_running_tasks", &max_running_tasks.to_string())
            );
        }

        Ok(())
    }
}
