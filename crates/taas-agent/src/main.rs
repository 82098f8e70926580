//! TaaS Agent Entry Point

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use taas_agent::{AgentConfig, Outcome, TaasAgent, DEFAULT_CONFIG_PATH};
use taas_common::intent::Intent;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Tap-as-a-Service host agent
#[derive(Parser, Debug)]
#[command(name = "taas-agent")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Newline-delimited JSON intents to apply; `-` reads stdin
    #[arg(short = 'i', long)]
    intents: Option<String>,

    /// Do not create or reset the mirror bridges at startup
    #[arg(long)]
    skip_bridge_setup: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    match run(args).await {
        Ok(failed) if failed == 0 => ExitCode::SUCCESS,
        Ok(failed) => {
            warn!(failed, "Some intents failed");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("taas-agent: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns the number of failed intents.
async fn run(args: Args) -> anyhow::Result<usize> {
    let config = AgentConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate().context("validating configuration")?;

    info!(
        host = %config.agent.host,
        access_bridge = %config.ovs.access_bridge,
        collection_bridge = %config.ovs.collection_bridge,
        sriov = config.sriov.enabled,
        "Starting taas-agent"
    );

    let agent = TaasAgent::from_config(&config);
    if !args.skip_bridge_setup {
        agent.start().await.context("setting up mirror bridges")?;
    }

    let Some(source) = args.intents else {
        info!("No intent source given, bridges ready");
        return Ok(0);
    };

    let reader: Box<dyn BufRead> = if source == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = std::fs::File::open(&source)
            .with_context(|| format!("opening intents file {}", source))?;
        Box::new(BufReader::new(file))
    };

    let mut failed = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("reading intents")?;
        if line.trim().is_empty() {
            continue;
        }
        let intent: Intent = match serde_json::from_str(&line) {
            Ok(intent) => intent,
            Err(e) => {
                error!(line = index + 1, error = %e, "Malformed intent");
                failed += 1;
                continue;
            }
        };
        match agent.handle(&intent).await {
            Ok(Outcome::Rejected) | Err(_) => failed += 1,
            Ok(_) => {}
        }
    }

    info!(failed, "Intents processed");
    Ok(failed)
}
