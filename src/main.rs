//! VibeMQ core - MQTT v3.1/v3.1.1 broker
//!
//! Usage:
//!   vibemq-core [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          Bind address (default: 0.0.0.0:1883)
//!   -p, --persistence <DIR>    Enable persistence under DIR
//!   -l, --log-level            Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq_core::acl::AclProvider;
use vibemq_core::auth::AuthProvider;
use vibemq_core::broker::{Broker, BrokerConfig};
use vibemq_core::config::{BackendType, Config};
use vibemq_core::hooks::CompositeHooks;
use vibemq_core::persistence::{
    FjallBackend, MemoryBackend, PersistenceManager, StorageBackend,
};
use vibemq_core::transport;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// VibeMQ core - MQTT v3.1/v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "vibemq-core")]
#[command(author = "VibeMQ Contributors")]
#[command(version)]
#[command(about = "MQTT v3.1/v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Persist sessions under this directory (enables persistence)
    #[arg(short, long)]
    persistence: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Some(path) = args.persistence {
        file_config.persistence.enabled = true;
        file_config.persistence.backend = BackendType::Fjall;
        file_config.persistence.path = path;
    }
    let bind_addr = args.bind.unwrap_or(file_config.server.bind);
    let broker_config = BrokerConfig::from(&file_config);

    info!("Starting VibeMQ core");
    info!("  Bind address: {}", bind_addr);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max in-flight: {}", broker_config.max_inflight);
    info!("  Max QoS: {:?}", broker_config.max_qos);

    if file_config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            file_config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if file_config.acl.enabled {
        info!(
            "  ACL: enabled ({} roles configured)",
            file_config.acl.roles.len()
        );
    } else {
        info!("  ACL: disabled");
    }

    // Auth first, then ACL
    let auth_provider = Arc::new(AuthProvider::new(&file_config.auth));
    let acl_provider = AclProvider::new(&file_config.acl, auth_provider.clone());
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider).with(acl_provider));

    let persistence = if file_config.persistence.enabled {
        let settings = &file_config.persistence;
        let backend: Arc<dyn StorageBackend> = match settings.backend {
            BackendType::Fjall => Arc::new(FjallBackend::open(&settings.path)?),
            BackendType::Memory => Arc::new(MemoryBackend::new()),
        };
        info!(
            "  Persistence: {:?} at {:?}",
            settings.backend, settings.path
        );
        Some(Arc::new(PersistenceManager::new(
            backend,
            settings.flush_interval,
            settings.max_batch_size,
        )))
    } else {
        info!("  Persistence: disabled");
        None
    };

    let broker = Arc::new(match persistence {
        Some(ref pm) => Broker::with_persistence(broker_config, hooks, Arc::clone(pm)),
        None => Broker::with_hooks(broker_config, hooks),
    });
    broker.restore().await?;

    let listener = TcpListener::bind(bind_addr).await?;
    let server = tokio::spawn(transport::serve(listener, Arc::clone(&broker)));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    broker.shutdown();

    match server.await {
        Ok(Err(e)) => error!("Accept loop failed: {}", e),
        Err(e) => error!("Accept loop panicked: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(pm) = persistence {
        pm.shutdown().await?;
    }

    Ok(())
}
