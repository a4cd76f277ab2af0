//! CLI commands for agentry using clap.

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::agent::{Agent, AgentContext, MessageHandler};
use crate::config::{load_config, load_config_or_default, RuntimeConfig};
use crate::manager::{resolve, AgentManager};
use crate::protocol::{payload, Message, Payload};

/// Agentry - in-process runtime for message-driven agents.
#[derive(Parser)]
#[command(name = "agentry")]
#[command(version)]
#[command(about = "Agentry - bus, lifecycle and orchestration for in-process agents", long_about = None)]
pub struct Commands {
    /// Configuration file (JSON). Defaults to the platform config directory.
    #[arg(long, global = true, env = "AGENTRY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the configuration and print the resolved startup order
    Check,

    /// Print the effective configuration as JSON
    Config,

    /// Start a chain of echo agents, exchange a few messages and shut down
    Demo {
        /// Number of agents in the dependency chain
        #[arg(long, default_value_t = 3)]
        agents: usize,
    },
}

impl Commands {
    /// Load the configuration named by `--config`, or the default file when
    /// present, or the defaults.
    pub fn load_config(&self) -> Result<RuntimeConfig> {
        match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("Failed to load config from {}", path.display())),
            None => load_config_or_default(None).context("Failed to load configuration"),
        }
    }

    /// Run the command.
    pub async fn run(&self, config: RuntimeConfig) -> Result<()> {
        match &self.command {
            Command::Check => cmd_check(&config),
            Command::Config => cmd_config(&config),
            Command::Demo { agents } => cmd_demo(config, *agents).await,
        }
    }
}

// Command implementations

fn cmd_check(config: &RuntimeConfig) -> Result<()> {
    config.validate()?;

    let plan = resolve(
        config
            .agents
            .iter()
            .map(|(id, agent)| (id.as_str(), agent.dependencies.as_slice())),
    );

    println!("Configuration OK");
    println!("  Agents configured: {}", config.agents.len());
    println!("  Health check interval: {:?}", config.manager.health_check_interval);
    println!("  Cleanup interval: {:?}", config.context.cleanup_interval);
    println!("  Queue capacity: {}", config.bus.queue_capacity);

    if !plan.order.is_empty() {
        println!();
        println!("Startup order:");
        for (i, id) in plan.order.iter().enumerate() {
            let marker = if plan.is_cyclic(id) { " (cycle)" } else { "" };
            let enabled = config.agents.get(id).map(|a| a.enabled).unwrap_or(true);
            let disabled = if enabled { "" } else { " (disabled)" };
            println!("  {}. {}{}{}", i + 1, id, marker, disabled);
        }
    }

    for (agent, dependency) in &plan.missing {
        println!("Warning: {} depends on {}, which is not configured", agent, dependency);
    }

    if plan.has_cycle() {
        bail!("Dependency cycle among agents: {}", plan.cyclic.join(", "));
    }
    Ok(())
}

fn cmd_config(config: &RuntimeConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Echoes every message back in its result and answers requests.
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, message: &Message, ctx: &AgentContext) -> anyhow::Result<Payload> {
        tracing::info!(
            "{} received {} from {}",
            ctx.agent_id(),
            message.message_type(),
            message.sender()
        );
        let data = payload([
            ("echo", message.message_type().into()),
            ("agent", ctx.agent_id().into()),
        ]);
        if message.correlation_id().is_some() {
            ctx.reply(message, "echo", data.clone());
        }
        Ok(data)
    }
}

async fn cmd_demo(config: RuntimeConfig, count: usize) -> Result<()> {
    if count == 0 {
        bail!("--agents must be at least 1");
    }

    let manager = AgentManager::from_config(&config);
    let ids: Vec<String> = (1..=count).map(|i| format!("echo-{}", i)).collect();

    let mut agents = Vec::with_capacity(count);
    for (i, id) in ids.iter().enumerate() {
        let dependencies = if i == 0 { Vec::new() } else { vec![ids[i - 1].clone()] };
        let agent = Agent::builder(id.clone(), Echo)
            .capabilities(["echo"])
            .dependencies(dependencies)
            .build();
        agents.push(manager.register_default(agent).await);
    }

    manager.start().await?;
    println!("Startup order: {}", manager.startup_order().join(" -> "));

    for id in &ids {
        manager.send_to(id, "ping", payload([("from", "demo".into())]));
    }
    manager.broadcast("announce", Payload::new());

    if let Some(last) = ids.last() {
        let request = Message::new("demo", last.as_str(), "ping", Payload::new());
        match manager.bus().send_with_reply(request, Duration::from_secs(5)).await {
            Some(reply) => println!(
                "Reply from {}: {}",
                reply.sender(),
                serde_json::to_string(reply.data())?
            ),
            None => println!("No reply from {}", last),
        }
    }

    // Every agent sees its ping and the broadcast; the last one also the request.
    let settled = tokio::time::timeout(Duration::from_secs(5), async {
        while agents.iter().any(|a| a.metrics().messages_processed < 2) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if settled.is_err() {
        tracing::warn!("Demo agents did not process every message in time");
    }

    println!("{}", serde_json::to_string_pretty(&manager.framework_status())?);
    manager.stop().await?;
    Ok(())
}
