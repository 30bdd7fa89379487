//! Berth control plane - composition root
//!
//! Constructs every component and hands it to its dependents: store,
//! cluster adapter, engines, broker consumer, and the gRPC-over-QUIC
//! listener. One active replica is assumed; see the deployment notes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use berth_core::cluster::ClusterApi;
use berth_core::store::{AuditStore, InstanceStore, NetworkStore};
use berth_core::{ExecBridge, PortEngine, Reconciler};
use berth_kube::{IngressSettings, KubeCluster};
use berth_proto::resource_service_server::ResourceServiceServer;
use berth_quic::QuicListener;
use berth_server::config::Config;
use berth_server::consumer::{self, BrokerSettings};
use berth_server::service::ResourceServer;
use berth_store::PgStore;

/// Control plane for the Berth container instance platform
#[derive(Parser, Debug)]
#[command(name = "berth-server", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    berth_common::install_crypto_provider();
    berth_common::telemetry::init("berth-server")?;

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // Store
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.data.database.source)
        .await
        .context("connecting to database")?;
    berth_store::migrations::run(&pool)
        .await
        .context("running migrations")?;
    let store = Arc::new(PgStore::new(pool));
    info!("database ready");

    // Cluster adapter
    let kubeconfig = config.data.kubernetes.kubeconfig_path();
    let kube_client = berth_kube::create_client(kubeconfig.as_deref())
        .await
        .context("creating kube client")?;
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(
        kube_client,
        IngressSettings {
            namespace: config.data.kubernetes.ingress_nginx_namespace.clone(),
            lb_service: config.data.kubernetes.ingress_nginx_lb_service.clone(),
        },
    ));

    // Engines
    let instances: Arc<dyn InstanceStore> = store.clone();
    let networks: Arc<dyn NetworkStore> = store.clone();
    let audit: Arc<dyn AuditStore> = store.clone();

    let reconciler = Arc::new(Reconciler::new(
        instances.clone(),
        cluster.clone(),
        audit.clone(),
    ));
    let ports = Arc::new(PortEngine::new(
        instances.clone(),
        networks,
        audit,
        cluster.clone(),
        (
            config.data.kubernetes.tcp_udp_port_range_start,
            config.data.kubernetes.tcp_udp_port_range_end,
        ),
        config.data.kubernetes.ingress_domain.clone(),
    ));
    let exec = Arc::new(ExecBridge::new(instances.clone(), cluster));

    let cancel = CancellationToken::new();

    // Broker consumer
    let broker = lapin::Connection::connect(
        &config.data.rabbitmq.url,
        lapin::ConnectionProperties::default(),
    )
    .await
    .context("connecting to broker")?;
    info!("broker connection established");

    let broker_settings = BrokerSettings {
        queue: config.data.rabbitmq.queue.clone(),
        exchange: config.data.rabbitmq.exchange.clone(),
        routing_key: config.data.rabbitmq.routing_key.clone(),
    };
    let consumer_cancel = cancel.clone();
    let consumer_reconciler = reconciler.clone();
    let consumer_task = tokio::spawn(async move {
        consumer::run(
            &broker,
            &broker_settings,
            consumer_reconciler,
            consumer_cancel,
        )
        .await
    });

    // Transport
    let (cert_file, key_file) = config.server.grpc.cert_paths();
    let cert_pem = std::fs::read(&cert_file)
        .with_context(|| format!("reading TLS certificate {}", cert_file.display()))?;
    let key_pem = std::fs::read(&key_file)
        .with_context(|| format!("reading TLS key {}", key_file.display()))?;

    let addr: SocketAddr = config
        .server
        .grpc
        .addr
        .parse()
        .with_context(|| format!("parsing bind address {}", config.server.grpc.addr))?;
    let listener = QuicListener::bind(addr, &cert_pem, &key_pem)?;
    info!(%addr, "serving gRPC over QUIC");

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    let service = ResourceServer::new(instances, ports, exec);
    let shutdown = cancel.clone();
    tonic::transport::Server::builder()
        .add_service(ResourceServiceServer::new(service))
        .serve_with_incoming_shutdown(listener.incoming(), async move {
            shutdown.cancelled().await;
        })
        .await
        .context("gRPC server failed")?;

    // Stop the consumer and wait for it to drain.
    cancel.cancel();
    match consumer_task.await {
        Ok(Ok(())) => info!("broker consumer stopped"),
        Ok(Err(e)) => error!(error = %e, "broker consumer exited with error"),
        Err(e) => error!(error = %e, "broker consumer task failed"),
    }

    Ok(())
}
