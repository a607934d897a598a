//! Demo agent.
//!
//! ```text
//! agentwire-demo -r http://router:8080 --identity rs-agent-1-1 request /foo/bar -p '{"k":"v"}'
//! agentwire-demo -c agent.toml serve --routing-key a:b=c
//! ```

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{info, warn};

use agentwire_client::{AgentContext, RetryableConfig, RetryableOutcome, SendOptions};
use agentwire_protocol::{Envelope, Event, Target};
use agentwire_server::{
    Actor, ActorRegistry, AgentConfig, DispatchedCache, Dispatcher, FunctionHandler,
};

use crate::cli::{Cli, Command, SendArgs};

const DEFAULT_IDENTITY: &str = "rs-demo-1-1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _guard = config.logging.init()?;

    let context = build_context(&config)?;
    if let Some(router) = context.router()
        && !router.init().await
    {
        warn!("Router not reachable yet, continuing to retry in the background");
    }

    let result = match cli.command {
        Command::Request(args) => request(&context, &args).await,
        Command::Push(args) => push(&context, &args).await,
        Command::Retry { send, timeout } => retry(&context, &send, timeout).await,
        Command::Serve {
            routing_keys,
            long_poll: _,
        } => serve(&context, &config, routing_keys).await,
    };

    let (unanswered, _) = context.terminate();
    if unanswered > 0 {
        warn!("{} requests left unanswered", unanswered);
    }
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if let Some(identity) = &cli.identity {
        config.identity = identity.clone();
    }
    if config.identity.is_empty() {
        config.identity = DEFAULT_IDENTITY.to_string();
    }
    if !cli.routers.is_empty() {
        config.router_urls = cli.routers.clone();
    }
    if config.client.api_version.is_none() {
        config.client.api_version = Some(cli.api_version.clone());
    }
    if let Command::Serve {
        long_poll: true, ..
    } = cli.command
    {
        config.router.long_polling_only = true;
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    config.validate()?;
    Ok(config)
}

fn build_context(config: &AgentConfig) -> anyhow::Result<AgentContext> {
    let auth = Arc::new(config.static_auth()?);
    Ok(AgentContext::http(
        auth,
        config.client.clone(),
        config.router.clone(),
        config.sender.clone(),
    )?)
}

fn parse_send(args: &SendArgs) -> anyhow::Result<(Value, Option<Target>, SendOptions)> {
    let payload: Value = serde_json::from_str(&args.payload).context("payload is not JSON")?;
    let target = args.target.as_deref().map(Target::from);
    let mut options = SendOptions::default();
    if let Some(ttl) = args.ttl {
        options = options.with_time_to_live(Duration::from_secs(ttl));
    }
    Ok((payload, target, options))
}

async fn request(context: &AgentContext, args: &SendArgs) -> anyhow::Result<()> {
    let (payload, target, options) = parse_send(args)?;
    let reply = context
        .sender()
        .request(&args.type_, payload, target, options)
        .await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn push(context: &AgentContext, args: &SendArgs) -> anyhow::Result<()> {
    let (payload, target, options) = parse_send(args)?;
    context
        .sender()
        .send_push(&args.type_, payload, target, options, None)
        .await?;
    info!("Pushed {}", args.type_);
    Ok(())
}

async fn retry(context: &AgentContext, args: &SendArgs, timeout: u64) -> anyhow::Result<()> {
    let (payload, _, _) = parse_send(args)?;
    let config = RetryableConfig {
        timeout: Some(Duration::from_secs(timeout)),
        targets: args.target.iter().cloned().collect(),
        ..RetryableConfig::default()
    };
    let request = context.retryable(&args.type_, payload, config)?;
    request.run().await;
    match request.wait().await {
        RetryableOutcome::Succeeded(content) => {
            println!("{}", serde_json::to_string_pretty(&content)?);
            Ok(())
        }
        RetryableOutcome::Failed(reason) => anyhow::bail!("{} failed: {}", args.type_, reason),
    }
}

async fn serve(
    context: &AgentContext,
    config: &AgentConfig,
    routing_keys: Vec<String>,
) -> anyhow::Result<()> {
    let router = context
        .router()
        .context("serving requires a router connection")?;
    let dispatcher = Dispatcher::new(
        context.identity(),
        Arc::new(demo_registry()),
        config
            .dedup
            .as_ref()
            .map(|dedup| DispatchedCache::new(context.identity(), dedup)),
        context.clock().clone(),
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let keys = (!routing_keys.is_empty()).then_some(routing_keys);
    router.listen(keys, move |event| {
        tx.send(event)?;
        Ok(())
    })?;
    info!("Listening as {}", context.identity());

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                let envelope = Envelope::push(event.path.clone(), event.data, event.from)
                    .with_token(event.uuid);
                if let Err(e) = dispatcher.dispatch(envelope).await {
                    warn!("Dropped event {}: {}", event.path, e);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    info!("Dispatched {:?}", dispatcher.dispatch_counts());
    Ok(())
}

fn demo_registry() -> ActorRegistry {
    let counter = Arc::new(AtomicU64::new(0));
    let registry = ActorRegistry::new();
    registry.register(
        Actor::new("demo")
            .idempotent(FunctionHandler::new("echo", |payload| async move {
                info!("echo {}", payload);
                Ok(payload)
            }))
            .non_idempotent(FunctionHandler::new("count", move |_| {
                let counter = counter.clone();
                async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
            })),
        None,
    );
    registry
}
