//! flowtap - local traffic redirector
//!
//! Starts the redirector with logging handlers so intercepted flows can be
//! inspected from a terminal.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flowtap::{handler_fn, HandlerResult, LocalRedirector, ProcfsProcessSource, Stream};
use flowtap_core::{ConfigLoader, FlowtapConfig, ProcessSource};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Bytes of a TCP request shown in the log
const PREVIEW_LEN: usize = 200;

/// Processes listed by `status`
const STATUS_PROCESS_LIMIT: usize = 5;

#[derive(Parser)]
#[command(name = "flowtap")]
#[command(version)]
#[command(about = "Redirect per-process traffic to local handlers", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format (text, json)
    #[arg(long, default_value = "text", global = true)]
    log_format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "FLOWTAP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the redirector and log intercepted flows until Ctrl+C
    Run {
        /// Initial intercept spec (e.g. "all", "process:curl", "!pid:1")
        #[arg(short, long)]
        intercept: Option<String>,

        /// Helper program to launch
        #[arg(long)]
        helper: Option<PathBuf>,

        /// Argument passed to the helper; `{socket}` is replaced by the socket path
        #[arg(long = "helper-arg")]
        helper_args: Vec<String>,

        /// Directory for the tunnel socket
        #[arg(long)]
        socket_dir: Option<PathBuf>,

        /// Spec to switch to after --switch-after seconds
        #[arg(long, requires = "switch_after")]
        switch_to: Option<String>,

        /// Seconds before switching to --switch-to
        #[arg(long, requires = "switch_to")]
        switch_after: Option<u64>,
    },

    /// Describe an intercept spec without starting anything
    Describe {
        /// Intercept spec text
        spec: String,
    },

    /// Show whether local redirect mode is available
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.clone());
    init_logging(cli.verbose, &config.redirector.log_level, &cli.log_format)?;

    match cli.command {
        Commands::Run {
            intercept,
            helper,
            helper_args,
            socket_dir,
            switch_to,
            switch_after,
        } => {
            // CLI args take precedence over the config file
            if let Some(intercept) = intercept {
                config.redirector.intercept = intercept;
            }
            if let Some(helper) = helper {
                config.helper.program = Some(helper.to_string_lossy().into_owned());
            }
            if !helper_args.is_empty() {
                config.helper.args = helper_args;
            }
            if let Some(dir) = socket_dir {
                config.helper.socket_dir = Some(dir.to_string_lossy().into_owned());
            }
            ConfigLoader::new()
                .validate(&config)
                .context("Invalid configuration")?;

            let switch = switch_to.zip(switch_after.map(Duration::from_secs));
            run_command(config, switch).await
        }
        Commands::Describe { spec } => describe_command(&spec),
        Commands::Status => status_command(&config),
    }
}

fn load_config(cli_path: Option<PathBuf>) -> FlowtapConfig {
    let loader = ConfigLoader::new().with_cli_path(cli_path);
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Failed to load configuration: {}, using defaults", e);
            FlowtapConfig::default()
        }
    }
}

/// Verbose flag wins over RUST_LOG, which wins over the config file.
fn init_logging(verbose: u8, config_level: &str, format: &str) -> anyhow::Result<()> {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config_level.to_lowercase())),
        1 => EnvFilter::new(Level::INFO.as_str()),
        2 => EnvFilter::new(Level::DEBUG.as_str()),
        _ => EnvFilter::new(Level::TRACE.as_str()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => tracing::subscriber::set_global_default(builder.json().finish())?,
        "text" => tracing::subscriber::set_global_default(builder.finish())?,
        other => anyhow::bail!("Unknown log format: {} (expected text or json)", other),
    }
    Ok(())
}

async fn run_command(
    config: FlowtapConfig,
    switch: Option<(String, Duration)>,
) -> anyhow::Result<()> {
    let redirector = LocalRedirector::from_config(&config);
    if let Some(reason) = redirector.capability_check() {
        println!("Local redirect unavailable: {}", reason);
        return Ok(());
    }

    let handle = redirector
        .start(handler_fn(handle_tcp_stream, handle_udp_stream))
        .await
        .context("Failed to start redirector")?;
    println!(
        "{}",
        LocalRedirector::describe_spec(&config.redirector.intercept)?
    );
    println!("Press Ctrl+C to stop...");

    if let Some((spec, after)) = switch {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            match handle.set_intercept(&spec).await {
                Ok(()) => info!("Switched intercept spec: {}", handle.intercept().describe()),
                Err(e) => warn!("Failed to switch intercept spec: {}", e),
            }
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down");
            handle.close();
        }
        _ = handle.wait_closed() => {}
    }

    let outcome = handle.wait_closed().await;
    info!(
        "Session stats: {}",
        serde_json::to_string(&handle.stats()).unwrap_or_default()
    );

    if let Err(e) = &outcome {
        error!("Redirector stopped: {}", e);
    }
    outcome.map_err(Into::into)
}

async fn handle_tcp_stream(stream: Stream) -> HandlerResult {
    info!("TCP connection intercepted: {}", stream);

    let mut total = 0;
    loop {
        let data = stream.read(4096).await?;
        if data.is_empty() {
            break;
        }
        if total == 0 {
            let preview = &data[..data.len().min(PREVIEW_LEN)];
            info!(flow = %stream.key(), "Request: {}", String::from_utf8_lossy(preview));
        }
        total += data.len();
    }

    info!(flow = %stream.key(), bytes = total, "TCP connection finished");
    Ok(())
}

async fn handle_udp_stream(stream: Stream) -> HandlerResult {
    info!("UDP flow intercepted: {}", stream);

    let mut datagrams = 0;
    loop {
        let data = stream.read(65535).await?;
        if data.is_empty() {
            break;
        }
        datagrams += 1;
    }

    info!(flow = %stream.key(), datagrams, "UDP flow finished");
    Ok(())
}

fn describe_command(spec: &str) -> anyhow::Result<()> {
    println!("{}", LocalRedirector::describe_spec(spec)?);
    Ok(())
}

fn status_command(config: &FlowtapConfig) -> anyhow::Result<()> {
    println!();
    println!("flowtap v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let redirector = LocalRedirector::from_config(config);
    match redirector.capability_check() {
        None => println!("Local redirect mode: available"),
        Some(reason) => println!("Local redirect mode: unavailable ({})", reason),
    }
    println!(
        "Intercept spec: {}",
        LocalRedirector::describe_spec(&config.redirector.intercept)?
    );

    println!();
    println!("Running processes:");
    let visible: Vec<_> = ProcfsProcessSource::new()
        .list_active()
        .into_iter()
        .filter(|p| p.is_visible && !p.is_system)
        .collect();
    if visible.is_empty() {
        println!("  (none visible)");
    }
    for (i, process) in visible.iter().take(STATUS_PROCESS_LIMIT).enumerate() {
        println!("  {}. {} [{}]", i + 1, process.display_name, process.pid);
    }
    if visible.len() > STATUS_PROCESS_LIMIT {
        println!("  ... and {} more", visible.len() - STATUS_PROCESS_LIMIT);
    }

    Ok(())
}
