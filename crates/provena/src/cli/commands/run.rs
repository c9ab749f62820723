//! Run command

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::Args;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use provena_core::config::load_config_or_default;
use provena_core::{Config, Priority, TaskClass};
use provena_pipeline::storage::checksum as sha256;
use provena_pipeline::{
    BlobData, Data, DataType, DirStorage, ExecutionContext, Filter, FilterKernel, Input,
    StorageContext,
};
use provena_tasks::{Runnable, Scheduler, TaskEvent, TaskId, TaskReporter, TaskReporterRegistry};

use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Data type every demo filter produces on output 0
const RASTER: &str = "Raster";

/// Base of the deterministic filter uuids, so a later run can find stored data
const CHAIN_NAMESPACE: u128 = 0x7072_6f76_656e_6100_0000_0000_0000_0000;

/// Run a chain of demonstration filters through the scheduler
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Number of filters in the chain (one seed followed by smoothing passes)
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
    pub filters: u32,

    /// Size of the generated raster in bytes
    #[arg(long, default_value_t = 4096)]
    pub size: usize,

    /// Priority of the filter tasks
    #[arg(long, default_value = "normal", value_parser = parse_priority)]
    pub priority: Priority,

    /// Schedule the filters as urgent tasks
    #[arg(long)]
    pub urgent: bool,

    /// Store every filter's outputs after the run
    #[arg(long)]
    pub snapshot: bool,

    /// Fetch outputs from storage instead of recomputing them
    #[arg(long)]
    pub restore: bool,
}

fn parse_priority(s: &str) -> Result<Priority, String> {
    Priority::parse(s).ok_or_else(|| {
        format!(
            "unknown priority '{}' (expected very_low, low, normal, high or very_high)",
            s
        )
    })
}

/// Outcome of one filter, as printed after the run
#[derive(Debug, Serialize)]
struct FilterSummary {
    name: String,
    task: u64,
    executions: usize,
    valid: bool,
    memory: usize,
    checksum: Option<String>,
}

impl RunCommand {
    /// Execute the run command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let (config, source) = load_config_or_default(&cwd);
        match &source {
            Some(path) => info!("using configuration from {}", path.display()),
            None => info!("no configuration file found, using defaults"),
        }

        let storage = (self.snapshot || self.restore).then(|| storage_context(&config, &cwd));

        let mut registry = TaskReporterRegistry::new();
        let progress = (cli.format == OutputFormat::Text && !cli.quiet)
            .then(|| Arc::new(ProgressReporter::new()));
        if let Some(progress) = &progress {
            registry.register_shared(progress.clone());
        }

        let scheduler = Scheduler::new(&config.scheduler, Arc::new(registry));
        scheduler
            .start()
            .context("failed to start the scheduling loop")?;

        let chain = self.build_chain(Some(&scheduler), &config.storage.category);

        if self.restore {
            if let Some(context) = &storage {
                for filter in &chain {
                    filter.set_fetch_context(context.clone())?;
                    filter.restore_outputs()?;
                }
            }
        }

        let started = Instant::now();
        let result = self.run_chain(&chain, config.scheduler.period());
        scheduler.abort();
        result?;

        if let Some(progress) = &progress {
            progress.clear();
        }

        if self.snapshot {
            if let Some(context) = &storage {
                for filter in &chain {
                    filter.snapshot(context)?;
                }
            }
        }

        let summaries = chain
            .iter()
            .map(|filter| summarize(filter))
            .collect::<anyhow::Result<Vec<_>>>()?;

        if cli.format == OutputFormat::Json {
            let json = serde_json::json!({
                "filters": summaries,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "snapshot": self.snapshot,
                "restored": self.restore,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        } else if !cli.quiet {
            print_summaries(&summaries, started.elapsed(), cli.verbose);
            if self.snapshot {
                output::success(&format!(
                    "Stored {} filters under {}",
                    chain.len(),
                    output::path_style()
                        .apply_to(config.storage.root.display())
                ));
            }
        }

        Ok(())
    }

    /// Build a seed filter followed by smoothing filters, each reading output
    /// 0 of its predecessor
    fn build_chain(&self, scheduler: Option<&Scheduler>, category: &str) -> Vec<Arc<Filter>> {
        let class = if self.urgent {
            TaskClass::Urgent
        } else {
            TaskClass::Normal
        };

        let mut chain: Vec<Arc<Filter>> = Vec::with_capacity(self.filters as usize);
        for index in 0..self.filters {
            let builder = match chain.last() {
                None => Filter::builder(Seed {
                    size: self.size,
                    seed: 0x2545_f491_4f6c_dd1d,
                }),
                Some(previous) => {
                    Filter::builder(Smooth).with_input(Input::new(Arc::clone(previous), 0))
                }
            };
            let filter = builder
                .with_uuid(chain_uuid(index))
                .with_category(category)
                .with_description(format!("{} #{}", if index == 0 { "seed" } else { "smooth" }, index))
                .with_priority(self.priority)
                .with_class(class)
                .build(scheduler);
            chain.push(filter);
        }
        chain
    }

    /// Submit every filter and resolve the end of the chain
    fn run_chain(&self, chain: &[Arc<Filter>], period: Duration) -> anyhow::Result<()> {
        for filter in chain {
            filter.submit()?;
        }

        while !chain.iter().all(|filter| filter.task().has_finished()) {
            thread::sleep(period.min(Duration::from_millis(20)));
        }

        let last = chain.last().ok_or_else(|| anyhow!("empty filter chain"))?;
        if !last.output(0)?.update()? {
            bail!("'{}' produced no valid output", last.task().description());
        }
        Ok(())
    }
}

fn chain_uuid(index: u32) -> Uuid {
    Uuid::from_u128(CHAIN_NAMESPACE | u128::from(index))
}

fn storage_context(config: &Config, cwd: &Path) -> StorageContext {
    let storage = DirStorage::from_config(&config.storage, cwd);
    StorageContext::new(Arc::new(storage), "")
        .with_checksum_verification(config.storage.verify_checksums)
}

fn summarize(filter: &Filter) -> anyhow::Result<FilterSummary> {
    let output = filter.output(0)?;
    let raster = DataType::from(RASTER);
    let checksum = output
        .read_data::<BlobData, _>(&raster, |blob| blob.bytes().map(sha256))
        .flatten();

    Ok(FilterSummary {
        name: filter.task().description(),
        task: filter.task().id().0,
        executions: filter.execution_count(),
        valid: output.is_valid(),
        memory: output.memory_usage(),
        checksum,
    })
}

fn print_summaries(summaries: &[FilterSummary], elapsed: Duration, verbose: bool) {
    println!("{}", output::header("Filter chain"));
    println!();

    for summary in summaries {
        let decision = match (summary.valid, summary.executions) {
            (false, _) => style("invalid").red(),
            (true, 0) => style("restored").cyan(),
            (true, 1) => style("computed").green(),
            (true, _) => style("recomputed").yellow(),
        };
        println!(
            "  {:<12} {:<10} {}",
            summary.name,
            decision,
            style(format!("{} executions", summary.executions)).dim()
        );
        if verbose {
            println!("{}", output::key_value("task", &format!("#{}", summary.task)));
            println!("{}", output::key_value("memory", &format!("{} B", summary.memory)));
            if let Some(checksum) = &summary.checksum {
                println!("{}", output::key_value("sha256", checksum));
            }
        }
    }

    println!();
    output::info(&format!("Finished in {:.2}s", elapsed.as_secs_f64()));
}

/// Generates a deterministic pseudo-random raster
struct Seed {
    size: usize,
    seed: u64,
}

impl FilterKernel for Seed {
    fn type_name(&self) -> &str {
        "Seed"
    }

    fn execute(&self, context: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
        let mut state = self.seed;
        let mut bytes = Vec::with_capacity(self.size);
        for chunk in chunks(self.size) {
            if !context.can_execute() {
                bail!("seed generation interrupted");
            }
            for _ in chunk.clone() {
                // xorshift64
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                bytes.push((state >> 56) as u8);
            }
            context.report_progress(percent(chunk.end, self.size));
        }
        context.set_output_data(0, BlobData::new(RASTER, bytes));
        Ok(())
    }

    fn create_data(&self, data_type: &DataType) -> Option<Box<dyn Data>> {
        Some(Box::new(BlobData::empty(data_type.clone())))
    }
}

/// Three-tap moving average over the raster of input 0
struct Smooth;

impl FilterKernel for Smooth {
    fn type_name(&self) -> &str {
        "Smooth"
    }

    fn execute(&self, context: &mut ExecutionContext<'_>) -> anyhow::Result<()> {
        let raster = DataType::from(RASTER);
        let input = context
            .input(0)?
            .read_data::<BlobData, _>(&raster, |blob| blob.bytes().map(<[u8]>::to_vec))
            .flatten()
            .ok_or_else(|| anyhow!("input raster unavailable"))?;

        let mut smoothed = Vec::with_capacity(input.len());
        for chunk in chunks(input.len()) {
            if !context.can_execute() {
                bail!("smoothing interrupted");
            }
            smoothed.extend(chunk.clone().map(|i| moving_average(&input, i)));
            context.report_progress(percent(chunk.end, input.len()));
        }
        context.set_output_data(0, BlobData::new(RASTER, smoothed));
        Ok(())
    }

    fn create_data(&self, data_type: &DataType) -> Option<Box<dyn Data>> {
        Some(Box::new(BlobData::empty(data_type.clone())))
    }
}

/// Split `0..len` into ten checkpoint ranges
fn chunks(len: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let step = (len / 10).max(1);
    (0..len).step_by(step).map(move |start| start..(start + step).min(len))
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        (done * 100 / total) as u8
    }
}

fn moving_average(values: &[u8], index: usize) -> u8 {
    let start = index.saturating_sub(1);
    let end = (index + 2).min(values.len());
    let window = &values[start..end];
    let sum: usize = window.iter().map(|&v| usize::from(v)).sum();
    (sum / window.len()) as u8
}

/// Draws one progress bar per visible task
struct ProgressReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
    style: ProgressStyle,
}

impl ProgressReporter {
    fn new() -> Self {
        let style = ProgressStyle::with_template(
            "{spinner:.green} {prefix:<12} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");

        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            style,
        }
    }

    fn clear(&self) {
        let _ = self.multi.clear();
    }

    fn with_bar(&self, id: TaskId, f: impl FnOnce(&ProgressBar)) {
        if let Some(bar) = self.bars.lock().get(&id) {
            f(bar);
        }
    }
}

impl TaskReporter for ProgressReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Added {
                id,
                description,
                hidden: false,
            } => {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.set_prefix(description.clone());
                bar.set_message("queued");
                self.bars.lock().insert(*id, bar);
            }
            TaskEvent::Started { id } => self.with_bar(*id, |bar| bar.set_message("running")),
            TaskEvent::Progress { id, progress } => {
                self.with_bar(*id, |bar| bar.set_position(u64::from(*progress)))
            }
            TaskEvent::Paused { id } => self.with_bar(*id, |bar| bar.set_message("paused")),
            TaskEvent::Resumed { id } => self.with_bar(*id, |bar| bar.set_message("running")),
            TaskEvent::Finished { id, aborted } => self.with_bar(*id, |bar| {
                bar.finish_with_message(if *aborted { "aborted" } else { "done" })
            }),
            _ => {}
        }
    }
}
