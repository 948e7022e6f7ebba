//! sc - drive state cells from the command line

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;

use statecell::cli::{Cli, Command};
use statecell::{CellError, CellOptions, Config, SpawnMode, StateCell};

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Counter {
            callers,
            ops,
            cast,
            thread,
        } => cmd_counter(&config, callers, ops, cast, thread).await,
        Command::Queue { items } => cmd_queue(&config, items).await,
        Command::Config { write } => cmd_config(&config, write.as_deref()),
    }
}

/// Hammer one counter from `callers` tasks and report the final count
async fn cmd_counter(config: &Config, callers: usize, ops: usize, cast: bool, thread: bool) -> Result<()> {
    let mut options = CellOptions::from_config(config).name("counter");
    if thread {
        options = options.spawn_mode(SpawnMode::Thread);
    }

    let cell = StateCell::start(|| 0u64, options)
        .await
        .context("Failed to start counter cell")?;
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(callers);
    for _ in 0..callers {
        let cell = cell.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..ops {
                if cast {
                    cell.cast(|n| n + 1);
                } else {
                    cell.update(|n| n + 1).await?;
                }
            }
            Ok::<(), CellError>(())
        }));
    }

    for task in tasks {
        task.await.context("Caller task panicked")??;
    }

    let total = cell.get(|n| *n).await?;
    let elapsed = started.elapsed();
    cell.stop().await?;

    println!("{} {} callers x {} {}", "✓".green(), callers, ops, if cast { "casts" } else { "updates" });
    println!("total: {}", total);
    println!("{}", format!("elapsed: {:?}", elapsed).dimmed());
    Ok(())
}

/// Cast pushes into a queue cell and drain it with get_and_update
async fn cmd_queue(config: &Config, items: usize) -> Result<()> {
    let cell = StateCell::start(VecDeque::<String>::new, CellOptions::from_config(config).name("queue"))
        .await
        .context("Failed to start queue cell")?;

    for i in 0..items {
        let item = format!("item-{}", i + 1);
        cell.cast(move |mut queue| {
            queue.push_back(item);
            queue
        });
    }

    while let Some(item) = cell
        .get_and_update(|mut queue| {
            let item = queue.pop_front();
            (item, queue)
        })
        .await?
    {
        println!("{} {}", "popped".cyan(), item);
    }

    cell.stop().await?;
    Ok(())
}

fn cmd_config(config: &Config, write: Option<&Path>) -> Result<()> {
    if let Some(path) = write {
        config
            .save(path)
            .context(format!("Failed to write config to {}", path.display()))?;
        println!("{} wrote {}", "✓".green(), path.display());
        return Ok(());
    }

    let yaml = serde_yaml::to_string(config).context("Failed to render configuration")?;
    print!("{}", yaml);
    Ok(())
}
