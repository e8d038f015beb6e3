#![allow(clippy::print_stdout, clippy::print_stderr, clippy::exit)]

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use interpreter_relay::config::Config;
use interpreter_relay::config_store::ConfigStore;
use interpreter_relay::provisioner::AssistantProvisioner;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "relay-ops")]
#[command(about = "Operator commands for the interpreter relay's assistant record")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether the stored assistant id resolves and how it is configured.
    #[command(name = "assistant:check")]
    AssistantCheck(StoreArgs),
    /// Create a fresh assistant and overwrite the stored id.
    #[command(name = "assistant:recreate")]
    AssistantRecreate(RecreateArgs),
}

#[derive(Args)]
struct StoreArgs {
    /// Overrides RELAY_CONFIG_STORE_URL.
    #[arg(long)]
    store_url: Option<String>,
    /// Overrides RELAY_CONFIG_STORE_COLLECTION.
    #[arg(long)]
    collection: Option<String>,
}

#[derive(Args)]
struct RecreateArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Overrides RELAY_ASSISTANT_MODEL for the new assistant.
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::AssistantCheck(args) => run_assistant_check(args).await,
        Commands::AssistantRecreate(args) => run_assistant_recreate(args).await,
    }
}

async fn run_assistant_check(args: StoreArgs) -> Result<()> {
    let config = load_config(&args, None)?;
    let (provisioner, store) = open_provisioner(&config).await?;

    let report = provisioner.check().await.context("assistant check failed")?;
    store.close().await?;
    print_json(&report)?;

    if report.stored_id.is_none() {
        bail!("no assistant id stored under '{}'", report.record_key);
    }
    if !report.resolves {
        bail!("stored assistant id does not resolve upstream");
    }
    Ok(())
}

async fn run_assistant_recreate(args: RecreateArgs) -> Result<()> {
    let config = load_config(&args.store, args.model)?;
    let (provisioner, store) = open_provisioner(&config).await?;

    let provisioned = provisioner
        .recreate()
        .await
        .context("assistant recreation failed")?;
    store.close().await?;
    print_json(&provisioned)
}

fn load_config(args: &StoreArgs, model: Option<String>) -> Result<Config> {
    let mut config = Config::from_env().context("invalid relay configuration")?;
    if let Some(store_url) = non_empty(args.store_url.as_deref()) {
        config.config_store_url = store_url;
    }
    if let Some(collection) = non_empty(args.collection.as_deref()) {
        config.config_store_collection = collection;
    }
    if let Some(model) = non_empty(model.as_deref()) {
        config.assistant_model = model;
    }
    Ok(config)
}

async fn open_provisioner(
    config: &Config,
) -> Result<(AssistantProvisioner, std::sync::Arc<dyn ConfigStore>)> {
    let store = interpreter_relay::connect_store(config).await?;
    let api = interpreter_relay::build_upstream(config)?;
    let provisioner = AssistantProvisioner::new(
        api,
        store.clone(),
        config.assistant_spec(),
        config.retry_policy(),
    );
    Ok((provisioner, store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
