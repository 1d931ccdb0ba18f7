//! toolrelay - multi-service MCP tool client.
//!
//! Inspect service health, list the merged tool catalog, and call or
//! stream tools across every configured service.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use serde_json::Value;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use toolrelay::mcp::{
    ExecuteOptions, HealthAlert, HealthStatus, StreamingOptions, StreamingRequest,
};
use toolrelay::{Config, ServiceRegistry, StreamingWrapper};

/// Multi-service MCP tool client
#[derive(Parser)]
#[command(name = "toolrelay")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to .toolrelay.toml, then the user config dir)
    #[arg(short, long, global = true, env = "TOOLRELAY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every service once and show its health
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,
    },

    /// List the tools that can be called right now
    Tools {
        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: Format,

        /// Probe services first so DOWN services are left out
        #[arg(long)]
        probe: bool,
    },

    /// Call a tool and print its result
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Call the owning service even if it is disabled or down
        #[arg(long)]
        force: bool,

        /// Skip the result cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Stream a tool call as server-sent events
    Stream {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Do not emit synthesized progress
        #[arg(long)]
        no_progress: bool,
    },

    /// Monitor service health until interrupted
    Watch,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        operation: ConfigOperation,
    },
}

#[derive(Subcommand)]
enum ConfigOperation {
    /// Check the configuration and every service client
    Validate,

    /// Print the effective configuration
    Show,

    /// Print where configuration is read from
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(filter)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Status { format } => cmd_status(&config, format),
        Commands::Tools { format, probe } => cmd_tools(&config, format, probe),
        Commands::Call { tool, args, force, no_cache } => {
            cmd_call(&config, &tool, &args, force, no_cache)
        }
        Commands::Stream { tool, args, no_progress } => {
            cmd_stream(&config, &tool, &args, no_progress)
        }
        Commands::Watch => cmd_watch(&config),
        Commands::Config { operation } => cmd_config(&config, &operation),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let _ = dotenvy::dotenv();
            Config::load_from_file(path)
        }
        None => Config::load(),
    }
}

fn parse_args(raw: &str) -> Result<Value> {
    let args: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
    if !args.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(args)
}

async fn build_registry(config: &Config) -> Result<ServiceRegistry> {
    let builder = config.registry_builder()?;
    let registry = if config.registry.discover_tools {
        builder.build_with_discovery().await?
    } else {
        builder.build()?
    };
    if config.registry.monitor_on_start {
        registry.start_health_monitoring()?;
    }
    Ok(registry)
}

fn print_status_table(statuses: &std::collections::BTreeMap<String, HealthStatus>) {
    println!("{:<24} {:<10} {:>10} {:>9}  LAST ERROR", "SERVICE", "STATUS", "LATENCY", "FAILURES");
    for (name, status) in statuses {
        let latency = status.latency_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
        println!(
            "{:<24} {:<10} {:>10} {:>9}  {}",
            name,
            status.status,
            latency,
            status.consecutive_failures,
            status.last_error.as_deref().unwrap_or("")
        );
    }
}

/// Handle the status command.
fn cmd_status(config: &Config, format: Format) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let registry = build_registry(config).await?;
        let statuses = registry.check_all_services_health().await;

        match format {
            Format::Json => {
                let report = serde_json::json!({
                    "services": statuses,
                    "alerts": registry.get_health_alerts(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Format::Text => {
                print_status_table(&statuses);
                for service in registry.get_services().iter().filter(|s| !s.enabled) {
                    println!("\n{} is disabled", service.name);
                }
            }
        }

        registry.destroy();
        Ok(())
    })
}

/// Handle the tools command.
fn cmd_tools(config: &Config, format: Format, probe: bool) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let registry = build_registry(config).await?;
        if probe {
            registry.check_all_services_health().await;
        }
        let tools = registry.get_available_tools();

        match format {
            Format::Json => println!("{}", serde_json::to_string_pretty(&tools)?),
            Format::Text => {
                if tools.is_empty() {
                    println!("No tools available");
                }
                for tool in &tools {
                    let streaming = if tool.streaming_supported { " [stream]" } else { "" };
                    println!("{:<36} {:<20} {}{}", tool.id, tool.service, tool.category, streaming);
                }
            }
        }

        registry.destroy();
        Ok(())
    })
}

/// Handle the call command.
fn cmd_call(config: &Config, tool: &str, raw_args: &str, force: bool, no_cache: bool) -> Result<()> {
    let args = parse_args(raw_args)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let registry = build_registry(config).await?;
        let options = ExecuteOptions { force, bypass_cache: no_cache, ..Default::default() };
        let result = registry.execute_tool_with(tool, &args, options).await;
        registry.destroy();

        match result {
            Ok(value) => {
                println!("{}", serde_json::to_string_pretty(&value)?);
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, details = ?e.details(), "Tool call failed");
                anyhow::bail!("{} ({})", e.user_message(), e.category())
            }
        }
    })
}

/// Handle the stream command.
fn cmd_stream(config: &Config, tool: &str, raw_args: &str, no_progress: bool) -> Result<()> {
    let args = parse_args(raw_args)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let registry = build_registry(config).await?;
        let wrapper = StreamingWrapper::with_settings(registry.clone(), config.streaming.clone());

        let options = StreamingOptions { enable_progress: !no_progress, ..Default::default() };
        let request = StreamingRequest::new(tool, args).with_options(options);
        let mut response = wrapper.execute_streaming(request).map_err(|e| {
            anyhow::anyhow!("{} ({})", e.user_message(), e.category())
        })?;

        let mut stdout = io::stdout();
        while let Some(event) = response.stream.next().await {
            stdout.write_all(event.to_sse_frame()?.as_bytes())?;
            stdout.flush()?;
            if event.is_terminal() {
                break;
            }
        }

        registry.destroy();
        Ok(())
    })
}

/// Handle the watch command.
fn cmd_watch(config: &Config) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let registry = build_registry(config).await?;
        registry.start_health_monitoring()?;
        println!(
            "Monitoring {} services every {}s. Press Ctrl-C to stop.",
            registry.get_services().len(),
            config.health.interval_secs
        );

        let mut ticker = tokio::time::interval(config.health.interval());
        let mut seen_alerts = HashSet::new();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = ticker.tick() => {
                    let statuses = registry.get_service_status();
                    println!();
                    print_status_table(&statuses);

                    let alerts = registry.get_health_alerts();
                    for alert in new_alerts(&alerts, &mut seen_alerts) {
                        println!("ALERT {} {}", alert.raised_at.format("%H:%M:%S"), alert.message);
                    }
                }
            }
        }

        registry.destroy();
        println!("Stopped.");
        Ok(())
    })
}

/// Alerts not printed yet. `seen` keeps only ids still outstanding.
fn new_alerts<'a>(alerts: &'a [HealthAlert], seen: &mut HashSet<Uuid>) -> Vec<&'a HealthAlert> {
    seen.retain(|id| alerts.iter().any(|a| a.id == *id));
    alerts.iter().filter(|a| seen.insert(a.id)).collect()
}

/// Handle config commands.
fn cmd_config(config: &Config, operation: &ConfigOperation) -> Result<()> {
    match operation {
        ConfigOperation::Validate => {
            let report = config.validate();
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            for error in &report.errors {
                println!("error: {error}");
            }
            if !report.is_valid() {
                anyhow::bail!("configuration has {} error(s)", report.errors.len());
            }
            println!("Configuration is valid ({} services, {} tool manifests)", config.services.len(), config.tools.len());
        }
        ConfigOperation::Show => {
            println!("{}", toml::to_string_pretty(config)?);
        }
        ConfigOperation::Path => {
            println!("local:  .toolrelay.toml");
            match Config::config_dir() {
                Some(dir) => println!("global: {}", dir.join("config.toml").display()),
                None => println!("global: (no config directory on this platform)"),
            }
        }
    }
    Ok(())
}
