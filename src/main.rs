use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use router_config::RouterConfig;
use router_core::{Request, RouterError, ServerInfo};
use router_discovery::{DiscoveryService, FnFallback, LocalRegistryClient, RegistryClient};
use router_registry::ServerRegistry;
use router_transport::{Transport, TransportRouter};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mcp-router")]
#[command(about = "Discover, health-check and route requests to MCP servers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $MCP_ROUTER_CONFIG or router.yaml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register configured servers, run one health sweep and list them
    Servers,

    /// Show which server would be selected for a request
    Select {
        /// Required capability (repeatable)
        #[arg(short = 'C', long = "capability")]
        capabilities: Vec<String>,

        /// Preferred server id
        #[arg(short, long)]
        prefer: Option<String>,
    },

    /// Route a JSON-RPC call, falling back when no server can serve it
    Call {
        /// Required capability (repeatable)
        #[arg(short = 'C', long = "capability")]
        capabilities: Vec<String>,

        /// JSON-RPC method, e.g. tools/list or tools/call
        #[arg(short, long)]
        method: String,

        /// JSON params
        #[arg(long)]
        params: Option<String>,

        /// Preferred server id
        #[arg(short, long)]
        prefer: Option<String>,
    },

    /// Run the health check loop until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json)?;

    let path = cli.config.unwrap_or_else(RouterConfig::default_config_path);
    let config = if path.exists() {
        info!("Loading configuration from: {:?}", path);
        RouterConfig::from_yaml(&path)?
    } else {
        info!("No configuration at {:?}, using defaults", path);
        RouterConfig::default()
    };

    let transport: Arc<dyn Transport> = Arc::new(TransportRouter::from_settings(
        &config.transport,
        config.retry.clone(),
    )?);
    let registry = Arc::new(ServerRegistry::from_settings(transport.clone(), &config.registry));
    let registered = registry.register_configured(&config.servers).await;
    info!("Registered {} of {} configured server(s)", registered, config.servers.len());

    let outcome = match cli.command {
        Commands::Servers => list_servers(&registry).await,
        Commands::Select { capabilities, prefer } => select(&registry, capabilities, prefer).await,
        Commands::Call {
            capabilities,
            method,
            params,
            prefer,
        } => {
            call(
                &config,
                registry.clone(),
                transport.clone(),
                capabilities,
                method,
                params,
                prefer,
            )
            .await
        }
        Commands::Watch => watch(&registry).await,
    };

    transport.cleanup().await;
    outcome
}

fn build_request(method: &str, capabilities: Vec<String>, prefer: Option<String>) -> Request {
    let request = Request::new("cli", method).with_capabilities(capabilities);
    match prefer {
        Some(id) => request.with_preferred_server(id),
        None => request,
    }
}

fn print_server(server: &ServerInfo) {
    let endpoint = server
        .endpoint_url
        .clone()
        .or_else(|| server.metadata_str("command").map(|c| format!("stdio: {}", c)))
        .unwrap_or_default();
    let capabilities: Vec<&str> = server.capabilities.iter().map(String::as_str).collect();

    println!("\n📦 {} [{}]", server.server_id, server.status);
    println!("   endpoint:     {}", endpoint);
    println!("   capabilities: {}", capabilities.join(", "));
    println!("   last seen:    {}", server.last_seen.format("%Y-%m-%d %H:%M:%S UTC"));
}

async fn list_servers(registry: &ServerRegistry) -> Result<()> {
    registry.run_health_checks().await;
    let servers = registry.discover_servers().await;

    println!("\n🛰️  MCP Servers ({}, strategy: {})", servers.len(), registry.strategy_name());
    println!("═══════════════════════════════════════");
    for server in &servers {
        print_server(server);
    }
    println!();
    Ok(())
}

async fn select(
    registry: &ServerRegistry,
    capabilities: Vec<String>,
    prefer: Option<String>,
) -> Result<()> {
    let request = build_request("select", capabilities, prefer);
    match registry.select_server(&request).await {
        Some(server) => {
            println!("\n✅ Selected server");
            print_server(&server);
            registry.request_completed(&server.server_id);
        }
        None => println!(
            "\n❌ No server available for capabilities [{}]",
            request.capability_key()
        ),
    }
    println!();
    Ok(())
}

async fn call(
    config: &RouterConfig,
    registry: Arc<ServerRegistry>,
    transport: Arc<dyn Transport>,
    capabilities: Vec<String>,
    method: String,
    params: Option<String>,
    prefer: Option<String>,
) -> Result<()> {
    let mut request = build_request(&method, capabilities, prefer);
    if let Some(raw) = params {
        let params: Value = serde_json::from_str(&raw).context("--params must be valid JSON")?;
        request = request.with_params(params);
    }

    let client: Arc<dyn RegistryClient> = Arc::new(LocalRegistryClient::new(registry, transport));
    let service = DiscoveryService::from_config(Some(client), config);
    let fallback = FnFallback::new(|request: Request| async move {
        Ok::<_, RouterError>(json!({
            "error": format!(
                "No MCP server could serve {} with capabilities [{}]",
                request.method,
                request.capability_key()
            )
        }))
    });

    let (result, used_mcp) = service.send_request_with_fallback(&request, &fallback).await?;

    println!("\n📋 Result ({})", if used_mcp { "served by MCP" } else { "served by fallback" });
    println!("═══════════════════════════════════════");
    println!("{}", serde_json::to_string_pretty(&result)?);

    let summary = service.metrics().get_summary();
    println!(
        "\n📊 Attempts: {} | Success rate: {:.1}% | Avg latency: {:.0}ms",
        summary.mcp_attempts, summary.attempt_success_rate, summary.average_latency_ms
    );
    Ok(())
}

async fn watch(registry: &Arc<ServerRegistry>) -> Result<()> {
    registry.start().await;
    println!("Watching {} server(s), press Ctrl-C to stop", registry.len().await);

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping health checks");
    registry.stop().await;

    for server in registry.discover_servers().await {
        print_server(&server);
    }
    println!();
    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
