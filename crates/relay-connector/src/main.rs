//! Relay Connector - run and inspect relay agents from the command line.

mod config;
mod demo;
mod serve;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_protocol::DEFAULT_PRIORITY;
use relay_state::{FileStateStore, StateStore};

use crate::config::ConnectorConfig;
use crate::demo::{DemoOptions, ECHO_TASK_TYPE};
use crate::serve::SendOptions;

#[derive(Parser, Debug)]
#[command(name = "relay-connector", version, about = "Reliable task delegation between agents")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "relay_delegation=debug". Overrides RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Log service url, e.g. "redis://127.0.0.1:6379/0". Overrides the
    /// config file and environment.
    #[arg(long)]
    transport_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Delegate one task to a built-in echo delegate and print the responses.
    Demo {
        #[arg(long, default_value = "bear")]
        target: String,

        #[arg(long, default_value = "Echo this description back")]
        description: String,

        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i32,
    },

    /// Run a delegate with the echo handler until interrupted.
    Serve {
        /// Agent name to receive tasks as.
        #[arg(long)]
        agent: String,
    },

    /// Delegate one task as the configured agent and print its responses.
    Send {
        #[arg(long)]
        target: String,

        #[arg(long)]
        description: String,

        #[arg(long, default_value = ECHO_TASK_TYPE)]
        task_type: String,

        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i32,

        /// Seconds to wait for the final response.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Print the effective configuration.
    Config,

    /// Print the persisted state of an agent.
    State {
        #[arg(long)]
        agent: String,
    },
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_responses(responses: &[relay_protocol::TaskResponse]) -> anyhow::Result<()> {
    for response in responses {
        let detail = match (&response.results, &response.error) {
            (Some(results), _) => serde_json::to_string(results)?,
            (_, Some(error)) => format!("{}: {}", error.error_code, error.error_message),
            _ => String::new(),
        };
        println!(
            "  {:<12} {} {}",
            response.status.as_str(),
            response.message,
            detail
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let mut config = ConnectorConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.transport_url {
        config.communication.transport_url = url;
    }

    match cli.command {
        Command::Demo {
            target,
            description,
            priority,
        } => {
            let options = DemoOptions {
                target,
                description,
                priority,
            };
            let report = demo::run(&config, &options).await?;
            println!("task {} finished as {}", report.task_id, report.final_status);
            print_responses(&report.responses)?;
        }
        Command::Serve { agent } => {
            let context = serve::connect(&config).await?;
            serve::serve(&config, context.clone(), &agent, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for interrupt");
                }
            })
            .await?;
            context.close().await?;
        }
        Command::Send {
            target,
            description,
            task_type,
            priority,
            timeout,
        } => {
            let options = SendOptions {
                target,
                task_type,
                description,
                priority,
                timeout: Duration::from_secs(timeout),
            };
            let context = serve::connect(&config).await?;
            let report = serve::send(&config, context.clone(), &options).await;
            context.close().await?;
            let report = report?;
            println!("task {}", report.task_id);
            print_responses(&report.responses)?;
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::State { agent } => {
            let store = FileStateStore::new(&config.state.dir, &agent)?;
            let snapshot = store
                .load_snapshot()
                .await
                .with_context(|| format!("reading state of agent '{agent}'"))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
