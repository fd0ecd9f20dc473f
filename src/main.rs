use anyhow::{Context, Result};
use clap::Parser;
use scanlog::{ScanlogApp, ScanlogConfig};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

#[derive(Parser, Debug)]
#[command(name = "scanlog")]
#[command(about = "Offline-first card-scan attendance logger")]
#[command(version)]
#[command(long_about = "Records every card scan to a durable local queue first and \
delivers queued records to the attendance backend when it is reachable, either one \
by one as they arrive or in periodic batches.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scanlog.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the service")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - initialize but don't start components
    #[arg(long, help = "Perform dry run - initialize components but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Loaded before logging so the file layer can be configured from it
    let config = ScanlogConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    let log_guard = init_logging(&args, &config)?;

    info!("Starting scanlog v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let mut app = ScanlogApp::new(config).await.map_err(|e| {
        error!("Failed to create service: {}", e);
        e
    })?;

    app.initialize().await.map_err(|e| {
        error!("Failed to initialize service: {}", e);
        e
    })?;

    if args.dry_run {
        info!("Dry run mode - components initialized but not started");
        println!("✓ Dry run completed successfully - all components initialized");
        return Ok(());
    }

    if let Err(e) = app.start().await {
        error!("Failed to start service: {}", e);
        let _ = app.shutdown().await;
        return Err(e.into());
    }

    let exit_code = app.run().await.map_err(|e| {
        error!("Service error during execution: {}", e);
        e
    })?;

    info!("Scanlog exited with code: {}", exit_code);

    // Flush the file log before exiting
    drop(log_guard);
    std::process::exit(exit_code);
}

fn init_logging(args: &Args, config: &ScanlogConfig) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("scanlog={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    let (file_layer, guard) = match config.logging.directory.as_deref() {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory {}", directory))?;
            let appender =
                tracing_appender::rolling::daily(directory, &config.logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Scanlog Configuration File");
    println!("# Every option with its default value. Environment variables override");
    println!("# file values, e.g. SCANLOG__SYNC__BATCH_SIZE=20");
    println!();

    let rendered = toml::to_string_pretty(&ScanlogConfig::default())
        .context("Failed to render default configuration")?;
    print!("{}", rendered);
    Ok(())
}
