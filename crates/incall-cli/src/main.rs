//! incall - drive the call lifecycle registry from the command line
//!
//! `incall replay scenario.json` feeds a scripted sequence of telephony
//! notifications to a registry and prints every call-list event it emits as
//! one JSON line on stdout. Logs go to stderr.

mod scenario;

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use incall_core::{
    CallListEvent, CallRegistry, LoggingConfig, RegistryConfig, RegistryDriver, parse_log_level,
    setup_logging,
};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{info, warn};

use crate::scenario::Scenario;

#[derive(Parser, Debug)]
#[command(author, version, about = "Call lifecycle registry scenario runner", long_about = None)]
struct Cli {
    /// Registry configuration file (TOML)
    #[arg(short, long, global = true, env = "INCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Log level for the registry itself (defaults to --log-level)
    #[arg(long, global = true)]
    registry_log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a scenario file and print the resulting call-list events
    Replay {
        /// Scenario file (JSON)
        scenario: PathBuf,

        /// Skip the spam lookup for incoming calls
        #[arg(long)]
        no_spam_check: bool,

        /// Skip the block-list lookup for incoming calls
        #[arg(long)]
        no_block_check: bool,
    },
    /// Print the effective registry configuration as TOML
    Config,
}

impl Cli {
    fn registry_config(&self) -> Result<RegistryConfig> {
        let config = match &self.config {
            Some(path) => RegistryConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RegistryConfig::default(),
        };
        Ok(config)
    }

    async fn execute(self) -> Result<()> {
        let mut logging = LoggingConfig::new(parse_log_level(&self.log_level)?);
        if let Some(level) = &self.registry_log_level {
            logging = logging.with_registry_level(parse_log_level(level)?);
        }
        if self.json_logs {
            logging = logging.with_json();
        }
        setup_logging(logging)?;

        let config = self.registry_config()?;
        match self.command {
            Command::Config => {
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
            Command::Replay {
                scenario,
                no_spam_check,
                no_block_check,
            } => {
                let spam_check = config.spam_check_enabled && !no_spam_check;
                let block_check = config.block_check_enabled && !no_block_check;
                let config = config
                    .with_spam_check(spam_check)
                    .with_block_check(block_check);
                replay(config, Scenario::from_file(&scenario)?, std::io::stdout()).await?;
                Ok(())
            }
        }
    }
}

/// Run `scenario` and write every emitted event to `out`, one JSON line each
async fn replay<W>(config: RegistryConfig, scenario: Scenario, out: W) -> Result<W>
where
    W: Write + Send + 'static,
{
    let lists = scenario.number_lists();
    let registry = CallRegistry::builder(config)
        .with_spam_checker(lists.clone())
        .with_blocked_number_checker(lists)
        .build()?;
    let (handle, task) = RegistryDriver::spawn(registry);

    let events = BroadcastStream::new(handle.subscribe());
    let printer = tokio::spawn(print_events(events, out));

    let outcome = scenario.replay(&handle).await;

    handle.shutdown().await?;
    let registry = task.await.context("registry task panicked")?;
    info!("Replay finished with {} call(s) still tracked", registry.len());
    drop(registry);
    drop(handle);

    let (out, printed) = printer.await.context("event printer panicked")?;
    info!("Printed {} event(s)", printed);
    outcome.map(|()| out)
}

async fn print_events<W: Write>(mut events: BroadcastStream<CallListEvent>, mut out: W) -> (W, usize) {
    let mut printed = 0;
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => match writeln!(out, "{}", line) {
                    Ok(()) => printed += 1,
                    Err(e) => warn!("Failed to write event: {}", e),
                },
                Err(e) => warn!("Failed to encode event: {}", e),
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Event printer lagged; {} event(s) skipped", skipped);
            }
        }
    }
    if let Err(e) = out.flush() {
        warn!("Failed to flush event output: {}", e);
    }
    (out, printed)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = cli.execute().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
