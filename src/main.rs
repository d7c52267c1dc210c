//! Wallet Kubernetes Operator
//!
//! This operator keeps Wallet custom resources in sync with the wallet
//! keystores of their fullnodes:
//! - generates missing keypairs (secp256k1 or bls) and derives addresses
//! - replicates exported key material into each fullnode's wallet Secret
//! - tracks deployment progress in the Wallet status

mod controller;
mod crd;
mod error;
mod keys;
mod stores;

use axum::{routing::get, Router};
use clap::Parser;
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "wallet-operator")]
#[command(about = "Kubernetes operator for fullnode wallets", long_about = None)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Metrics port
    #[arg(long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(long, default_value = "8081")]
    health_port: u16,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz() -> &'static str {
    "ok"
}

async fn metrics() -> &'static str {
    // TODO: expose prometheus metrics
    ""
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Wallet Operator");
    info!("Log level: {}", args.log_level);
    info!(
        "Namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    // Initialize Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    // The crypto capability is constructed once here and handed to the
    // controller rather than registered through any global state.
    let key_engine: Arc<dyn keys::KeyEngine> = Arc::new(keys::LocalKeyEngine);

    // Health server
    let health_addr = SocketAddr::from(([0, 0, 0, 0], args.health_port));
    let health_app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));
    info!("Health server listening on {}", health_addr);

    // Metrics server
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
    let metrics_app = Router::new().route("/metrics", get(metrics));
    info!("Metrics server listening on {}", metrics_addr);

    // Run controller + servers concurrently
    tokio::select! {
        res = controller::run_wallet_controller(client, args.namespace.clone(), key_engine) => {
            if let Err(e) = res {
                tracing::error!("Wallet controller exited with error: {:?}", e);
            }
        }
        res = axum::serve(
            tokio::net::TcpListener::bind(health_addr).await.unwrap(),
            health_app.into_make_service(),
        ) => {
            if let Err(e) = res {
                tracing::error!("Health server exited with error: {:?}", e);
            }
        }
        res = axum::serve(
            tokio::net::TcpListener::bind(metrics_addr).await.unwrap(),
            metrics_app.into_make_service(),
        ) => {
            if let Err(e) = res {
                tracing::error!("Metrics server exited with error: {:?}", e);
            }
        }
    }

    Ok(())
}
