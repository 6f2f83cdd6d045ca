use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use mcphub::config::{ConfigManager, ConfigValidator, GatewayConfig};
use mcphub::core::{AdapterFactory, InMemoryStore, Router};
use mcphub::utils::{init_logging, ShutdownCoordinator};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mcphub")]
#[command(about = "Multi-protocol MCP gateway")]
#[command(version)]
enum Cli {
    /// Connect the configured backends and supervise them until interrupted
    Serve(ServeArgs),
    /// List the namespaced tools reachable through an endpoint
    Tools(ToolsArgs),
    /// Route one tool call and print the result
    Call(CallArgs),
    /// Validate a configuration file
    Validate { config: String },
    /// Print the configuration JSON Schema
    Schema,
}

#[derive(Parser)]
struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, env = "MCPHUB_CONFIG", default_value = "~/.config/mcphub/gateway.yaml")]
    config: String,
    /// Log level, overrides the configured one
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Parser)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Connect every active server at startup instead of on first use
    #[arg(long)]
    eager: bool,
}

#[derive(Parser)]
struct ToolsArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Endpoint id
    endpoint: String,
}

#[derive(Parser)]
struct CallArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Endpoint or group id
    endpoint: String,
    /// Tool name, optionally prefixed with a namespace (`ns__tool`)
    tool: String,
    /// Tool arguments as a JSON object
    #[arg(short, long, default_value = "{}")]
    args: String,
    /// Print chunks as they arrive
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::Serve(args) => {
            let config = load_config(&args.config)?;
            let (factory, router) = build_gateway(&config);

            info!(
                "Starting gateway with {} servers (load balancer {})",
                config.servers.len(),
                if config.load_balancer.enabled { "enabled" } else { "disabled" }
            );

            if args.eager {
                for server in config.servers.iter().filter(|s| s.is_active()) {
                    let result = match server.backend_config() {
                        Ok(backend) => factory.ensure_adapter(&server.id, backend).await,
                        Err(e) => Err(e),
                    };
                    match result {
                        Ok(id) => info!("Connected {} as adapter {}", server.id, id),
                        Err(e) => warn!("Failed to connect {}: {}", server.id, e),
                    }
                }
            }

            factory.start_health_monitor();
            ShutdownCoordinator::wait_for_os_signal().await;

            info!("Shutting down");
            let stats = factory.statistics().await;
            info!(
                "Served {} requests with {} errors across {} adapters",
                stats.total_requests, stats.total_errors, stats.total
            );
            drop(router);
            let report = factory.shutdown().await;
            for (id, e) in &report.failures {
                error!("Adapter {} failed to stop: {}", id, e);
            }
            info!("Stopped {} adapters", report.stopped);
        }
        Cli::Tools(args) => {
            let config = load_config(&args.config)?;
            let (factory, router) = build_gateway(&config);

            let result = router.get_available_tools(&args.endpoint).await;
            factory.shutdown().await;
            let tools = result?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        Cli::Call(args) => {
            let config = load_config(&args.config)?;
            let params: Value = serde_json::from_str(&args.args).context("--args must be valid JSON")?;
            let (factory, router) = build_gateway(&config);

            let result = if args.stream {
                stream_call(&router, &args.endpoint, &args.tool, params).await
            } else {
                match router.route_tool_call(&args.endpoint, &args.tool, params).await {
                    Ok(value) => serde_json::to_string_pretty(&value)
                        .map(|out| println!("{}", out))
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                }
            };
            factory.shutdown().await;
            result?;
        }
        Cli::Validate { config } => {
            let validator = ConfigValidator::new();
            match validator.validate_file(&config) {
                Ok(parsed) => println!(
                    "{} is valid: {} servers, {} groups, {} endpoints",
                    config,
                    parsed.servers.len(),
                    parsed.groups.len(),
                    parsed.endpoints.len()
                ),
                Err(errors) => {
                    for e in &errors {
                        eprintln!("  {}", e);
                    }
                    anyhow::bail!("{} has {} validation errors", config, errors.len());
                }
            }
        }
        Cli::Schema => {
            println!("{}", ConfigValidator::new().export_schema());
        }
    }

    Ok(())
}

fn load_config(args: &ConfigArgs) -> anyhow::Result<GatewayConfig> {
    let manager = ConfigManager::new(&args.config)?;
    let mut config = manager.get_config();
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging);
    info!("Config file: {}", manager.path().display());

    if let Err(errors) = ConfigValidator::new().validate(&config) {
        for e in &errors {
            error!("{}", e);
        }
        anyhow::bail!("invalid configuration: {} errors", errors.len());
    }
    Ok(config)
}

fn build_gateway(config: &GatewayConfig) -> (AdapterFactory, Router) {
    let store = Arc::new(InMemoryStore::from_records(
        config.servers.clone(),
        config.groups.clone(),
        config.endpoints.clone(),
    ));
    let factory = AdapterFactory::new(config.factory.clone(), config.adapters.clone());
    let router = Router::new(store, factory.clone(), &config.load_balancer);
    (factory, router)
}

async fn stream_call(router: &Router, endpoint: &str, tool: &str, params: Value) -> anyhow::Result<()> {
    let mut stream = router.stream_tool_call(endpoint, tool, params).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        println!("{}", serde_json::to_string(&chunk.data)?);
        if chunk.done {
            break;
        }
    }
    Ok(())
}
