use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tiller_config::{ConfigLoader, TillerConfig};
use tiller_core::{
    InferenceTier, Result, RoutingRequest, Tier, TierConstraints, TierResponse, TokenUsage,
};
use tiller_runtime::Orchestrator;

/// Tiller — offline-first inference orchestration core
#[derive(Parser)]
#[command(name = "tiller", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to tiller.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: scheduler loop, durable jobs, maintenance
    Run {
        /// Register the built-in offline echo backend (smoke testing)
        #[arg(long)]
        echo: bool,
    },
    /// Route a single prompt and print the result
    Route {
        /// The prompt to route
        prompt: String,

        /// Conversation to charge the spend against (new one if omitted)
        #[arg(long)]
        conversation: Option<Uuid>,

        /// Bypass the cache and force a fresh tier call
        #[arg(long)]
        fresh: bool,

        /// Response verbosity, 1 (terse) to 5 (exhaustive)
        #[arg(short, long, default_value = "3")]
        verbosity: u8,

        /// Budget override token for non-trivial spend
        #[arg(long)]
        override_token: Option<String>,

        /// Register the built-in offline echo backend (smoke testing)
        #[arg(long)]
        echo: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show system status: jobs, budget, cache, audit
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recent audit log entries
    Logs {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write a default tiller.toml
    Init {
        /// Create in the current directory instead of ~/.tiller/
        #[arg(long)]
        local: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        let log_level = self
            .log_level
            .as_deref()
            .unwrap_or(&config.logging.level)
            .to_string();
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
            )
            .with_target(false)
            .init();

        match self.command {
            Commands::Run { echo } => Self::cmd_run(config, echo).await,
            Commands::Route {
                prompt,
                conversation,
                fresh,
                verbosity,
                override_token,
                echo,
                json,
            } => {
                Self::cmd_route(config, prompt, conversation, fresh, verbosity, override_token, echo, json)
                    .await
            }
            Commands::Status { json } => Self::cmd_status(config, json),
            Commands::Logs { limit, json } => Self::cmd_logs(config, limit, json),
            Commands::Config { json } => Self::cmd_config(config, json),
            Commands::Init { local } => Self::cmd_init(local),
        }
    }

    async fn cmd_run(config: TillerConfig, echo: bool) -> Result<()> {
        println!("tiller v{}", env!("CARGO_PKG_VERSION"));
        println!("   Database: {}", config.store.db_path.display());
        println!(
            "   Budgets: ${:.2}/conversation, ${:.2}/day",
            config.budget.conversation_ceiling_usd, config.budget.daily_ceiling_usd
        );
        println!("   Jobs: {}", config.scheduler.jobs.len());
        println!();

        let mut builder = Orchestrator::builder(config);
        if echo {
            builder = builder.backend(Arc::new(EchoTier));
        } else {
            eprintln!("note: no inference backends registered — routing will fail until a host wires one in");
        }
        let orchestrator = builder.build()?;

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_token.cancel();
            }
        });

        orchestrator.run(shutdown).await;
        println!("shut down cleanly");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn cmd_route(
        config: TillerConfig,
        prompt: String,
        conversation: Option<Uuid>,
        fresh: bool,
        verbosity: u8,
        override_token: Option<String>,
        echo: bool,
        json: bool,
    ) -> Result<()> {
        let mut builder = Orchestrator::builder(config);
        if echo {
            builder = builder.backend(Arc::new(EchoTier));
        }
        let orchestrator = builder.build()?;

        let mut request = RoutingRequest::new(conversation.unwrap_or_else(Uuid::new_v4), prompt);
        request.freshness_required = fresh;
        request.verbosity = verbosity.clamp(1, 5);
        request.budget_override_token = override_token;

        let result = orchestrator.route(&request).await?;

        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("{}", result.output);
            println!();
            println!(
                "-- tier: {} | confidence: {:.2} | cost: ${:.4} | {}ms{}",
                result.tier,
                result.confidence,
                result.cost_usd,
                result.latency_ms,
                if result.cached { " | cached" } else { "" }
            );
        }
        Ok(())
    }

    fn cmd_status(config: TillerConfig, json: bool) -> Result<()> {
        let orchestrator = Orchestrator::builder(config).build()?;
        let status = orchestrator.status()?;

        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        println!(
            "Daily budget: ${:.4} spent of ${:.2}",
            status.day_budget.accumulated_usd, status.day_budget.ceiling_usd
        );
        println!("Cache entries: {}", status.cache_entries);
        println!("Audit records: {}", status.audit_records);
        println!("Tools: {}", status.registered_tools.join(", "));
        println!();
        if status.jobs.is_empty() {
            println!("No scheduled jobs.");
        } else {
            println!("Jobs:");
            for job in &status.jobs {
                println!(
                    "  {:<24} {:<16} next {} last {:?}{}",
                    job.name,
                    job.schedule_spec,
                    job.next_run_at.format("%Y-%m-%d %H:%M:%S"),
                    job.last_status,
                    if job.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Ok(())
    }

    fn cmd_logs(config: TillerConfig, limit: usize, json: bool) -> Result<()> {
        let orchestrator = Orchestrator::builder(config).build()?;
        let records = orchestrator.store().audit.recent(limit)?;

        if json {
            println!("{}", serde_json::to_string_pretty(&records)?);
            return Ok(());
        }
        for record in records {
            println!(
                "{} [{}] {} {}",
                record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                record.kind.as_str(),
                record.subject,
                record.detail
            );
        }
        Ok(())
    }

    fn cmd_config(config: TillerConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(&config)?);
        } else {
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| tiller_core::TillerError::Config(e.to_string()))?;
            println!("{rendered}");
        }
        Ok(())
    }

    fn cmd_init(local: bool) -> Result<()> {
        let path = if local {
            PathBuf::from("tiller.toml")
        } else {
            let dir = dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".tiller");
            std::fs::create_dir_all(&dir)?;
            dir.join("tiller.toml")
        };

        if path.exists() {
            return Err(tiller_core::TillerError::Config(format!(
                "{} already exists",
                path.display()
            )));
        }

        let rendered = toml::to_string_pretty(&TillerConfig::default())
            .map_err(|e| tiller_core::TillerError::Config(e.to_string()))?;
        std::fs::write(&path, rendered)?;
        println!("wrote {}", path.display());
        Ok(())
    }
}

/// Deterministic offline backend for smoke tests: repeats the prompt back
/// with a confident finish so the full route/cache/audit path can be
/// exercised with no model attached.
struct EchoTier;

#[async_trait]
impl InferenceTier for EchoTier {
    fn name(&self) -> &str {
        "echo"
    }

    fn tier(&self) -> Tier {
        Tier::Local
    }

    async fn generate(&self, prompt: &str, _constraints: &TierConstraints) -> Result<TierResponse> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("confidence".into(), serde_json::json!(0.9));
        metadata.insert("finish_reason".into(), serde_json::json!("stop"));
        Ok(TierResponse {
            text: format!("echo: {prompt}"),
            usage: TokenUsage {
                input_tokens: (prompt.len() / 4) as u32,
                output_tokens: (prompt.len() / 4) as u32,
            },
            metadata,
        })
    }
}
