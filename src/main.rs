//! strip-proxy: local forward proxy with HTTPS CONNECT interception.
//!
//! This is the main entry point for the strip-proxy binary. It handles CLI
//! argument parsing, configuration loading, root CA setup and runs the proxy
//! until Ctrl-C.
//!
//! # Logging
//!
//! - **Audit logging**: interception outcomes go to syslog when enabled
//! - **Debug logging**: `tracing` to stderr, controlled by `-v` or `RUST_LOG`

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Instant;
use strip_proxy::{
    ca::{CertificateAuthority, RootCa},
    cli::{Cli, Commands},
    config::{Config, ConfigLoader},
    proxy::{
        DirectFilter, Handler, HandlerConfig, InterceptConfig, InterceptFilter, Listener,
        PushableListener, TcpProxyListener,
    },
    telemetry::{AuditEvent, AuditLogger},
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    init_tracing(cli.verbose)?;

    debug!("Parsed CLI arguments: {:?}", cli);

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    debug!("Loaded configuration: {:?}", config);

    match cli.command {
        Some(Commands::CaCert { ref out }) => export_ca_cert(&config, out.as_deref()),
        None => run_proxy(&config).await,
    }
}

/// Print or write the persistent root certificate.
fn export_ca_cert(config: &Config, out: Option<&std::path::Path>) -> Result<()> {
    let Some(dir) = config.ca.dir() else {
        anyhow::bail!("No CA directory configured; pass --ca-dir or set [ca] dir");
    };
    let ca = RootCa::load_or_generate(dir).context("Failed to load root CA")?;

    match out {
        Some(path) => {
            std::fs::write(path, ca.cert_pem())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote root certificate to {}", path.display());
        }
        None => print!("{}", ca.cert_pem()),
    }
    Ok(())
}

/// Run the proxy until Ctrl-C.
async fn run_proxy(config: &Config) -> Result<()> {
    let started = Instant::now();
    let addr = config.listen.addr()?;
    let push = config.listen.push();
    let intercept = config.intercept.enabled();

    let audit = Arc::new(init_audit(config));

    let listener: Arc<dyn Listener> = if push {
        Arc::new(
            PushableListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?,
        )
    } else {
        Arc::new(
            TcpProxyListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?,
        )
    };

    let mut builder = Handler::builder()
        .listener(listener)
        .config(HandlerConfig {
            max_head_bytes: config.intercept.max_head_bytes(),
            relay_idle_timeout: config.intercept.relay_idle_timeout(),
            push,
        })
        .audit(Arc::clone(&audit));

    if intercept {
        let ca: Arc<dyn CertificateAuthority> = Arc::new(load_root_ca(config)?);
        let intercept_config = InterceptConfig {
            handshake_timeout: config.intercept.handshake_timeout(),
            ..InterceptConfig::default()
        };
        builder = builder.filter(Arc::new(InterceptFilter::new(ca).with_config(intercept_config)));
    } else {
        info!("CONNECT interception disabled");
    }
    builder = builder.filter(Arc::new(DirectFilter::new()));

    let handler = Arc::new(builder.build().context("Failed to build proxy handler")?);
    let local_addr = handler.local_addr()?;

    audit.log(AuditEvent::ProxyStart {
        addr: local_addr.to_string(),
        push,
        intercept,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        let _ = shutdown_tx.send(true);
    });

    let result = handler.serve(shutdown_rx).await;

    audit.log(AuditEvent::ProxyStop {
        duration_sec: started.elapsed().as_secs(),
    });

    result.context("Proxy failed")
}

/// Persistent root CA when a directory is configured, ephemeral otherwise.
fn load_root_ca(config: &Config) -> Result<RootCa> {
    match config.ca.dir() {
        Some(dir) => {
            info!("Using root CA from {}", dir.display());
            RootCa::load_or_generate(dir).context("Failed to load root CA")
        }
        None => {
            warn!("No CA directory configured; using an ephemeral root CA");
            RootCa::generate().context("Failed to generate root CA")
        }
    }
}

/// Syslog audit logger when enabled, falling back to a null logger.
fn init_audit(config: &Config) -> AuditLogger {
    if !config.telemetry.syslog() {
        return AuditLogger::new_null();
    }
    match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("Syslog unavailable, audit events disabled: {}", e);
            AuditLogger::new_null()
        }
    }
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
