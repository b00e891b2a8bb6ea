//! Gateway configuration operator.
//!
//! Mirrors gateway resources published to the control-plane etcd into the
//! etcd read by the APISIX data plane.
//!
//! ```text
//!   control-plane etcd                                    data-plane etcd
//!  ┌──────────────────┐                                 ┌──────────────────┐
//!  │ /{prefix}/{ver}/ │  watch   ┌──────────┐           │ /apisix/routes   │
//!  │   gateway/...    │────────▶ │ watcher  │           │ /apisix/services │
//!  │   global/...     │          └────┬─────┘           │ /apisix/ssls     │
//!  └────────┬─────────┘               ▼                 │ /apisix/plugin_  │
//!           │                   ┌──────────┐            │         metadata │
//!           │ list              │ debounce │            └────────▲─────┬───┘
//!           │                   └────┬─────┘                 puts │     │ watch
//!           │                        ▼                     deletes│     ▼
//!           │                   ┌──────────┐  ┌────────┐  ┌──────┴───┐ ┌─────────┐
//!           └─────────────────▶ │ fetcher  │─▶│ differ │─▶│ applier  │ │ replica │
//!                               └──────────┘  └───▲────┘  └──────────┘ └────┬────┘
//!                                                 └──────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use gateway_operator::config::validation::validate_config;
use gateway_operator::config::{load_config, ConfigError, OperatorConfig};
use gateway_operator::leader::StandaloneLeader;
use gateway_operator::lifecycle::{signals, Operator, Shutdown};
use gateway_operator::observability::{logging, metrics};
use gateway_operator::source::JsonObjectValidator;
use gateway_operator::store::EtcdStore;

#[derive(Parser)]
#[command(name = "gateway-operator")]
#[command(about = "Syncs gateway configuration from the control plane into APISIX", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level.
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

fn load(cli: &Cli) -> Result<OperatorConfig, ConfigError> {
    match &cli.config {
        Some(path) => load_config(path),
        None => {
            let config = OperatorConfig::default();
            validate_config(&config).map_err(ConfigError::Validation)?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load(&cli)?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_tracing(log_level);

    if cli.check {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        source_prefix = %config.source.prefix,
        api_version = %config.source.api_version,
        target_prefix = %config.target.prefix,
        "gateway-operator starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let source = EtcdStore::connect(&config.source.etcd).await?;
    let target = EtcdStore::connect(&config.target.etcd).await?;

    let shutdown = Shutdown::new();
    tokio::spawn(signals::shutdown_on_signal(shutdown.clone()));

    let operator = Operator::new(
        config,
        Arc::new(source),
        Arc::new(target),
        Arc::new(JsonObjectValidator),
        Arc::new(StandaloneLeader::new()),
    );
    operator.run(shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
