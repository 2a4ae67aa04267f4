//! Binary entrypoint, modeled on `cloud-component-service::server`'s
//! `main` / `async_main` split and `cloud-service::grpcapi::start_grpc_server`'s
//! health-reporter + reflection + single-service `Server::builder()`
//! pattern - simplified to the one `WorkerProtocol` stream service this
//! crate serves (spec.md §6: no HTTP façade here).

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use pipeline_orchestrator::bootstrap::Services;
use pipeline_orchestrator::config::{make_config_loader, SafeDisplay};
use pipeline_orchestrator::protocol::proto;
use pipeline_orchestrator::protocol::WorkerProtocolHandler;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const FILE_DESCRIPTOR_SET: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/orchestrator_descriptor.bin"));

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pipeline_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

fn main() -> std::io::Result<()> {
    init_tracing();

    let config = match make_config_loader().load() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!("{}", config.to_safe_string());

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    if let Err(err) = runtime.block_on(async_main(config)) {
        error!(%err, "fatal startup failure");
        std::process::exit(1);
    }
    Ok(())
}

async fn async_main(config: pipeline_orchestrator::OrchestratorConfig) -> anyhow::Result<()> {
    let services = Services::new(&config);
    let addr = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), config.stream_port).into();

    let reaper = tokio::spawn(heartbeat_reaper(services.clone(), config.heartbeat_reaper_interval));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    info!(addr = %addr, "starting worker protocol stream server");
    let server = tokio::spawn(start_grpc_server(addr, services, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, no longer accepting new worker connections");
    let _ = shutdown_tx.send(());

    // Supplemented feature (SPEC_FULL.md §11.1): in-flight sends get
    // `orchestrator_shutdown_grace` to flush, then one more
    // `orchestrator_shutdown_force` before a hard exit.
    let deadline = config.timeouts.orchestrator_shutdown_grace + config.timeouts.orchestrator_shutdown_force;
    match tokio::time::timeout(deadline, server).await {
        Ok(join_result) => join_result??,
        Err(_) => {
            error!("shutdown grace and force periods elapsed, exiting immediately");
            std::process::exit(1);
        }
    }

    reaper.abort();
    Ok(())
}

/// Ties the worker registry's reaper sweep (C3) to the engine's
/// `WORKER_LOST` handling (C8): every evicted worker's active execution,
/// if any, is force-failed with the heartbeat-lapse category rather than
/// the stream-close one (spec.md §4.3, §5).
async fn heartbeat_reaper(services: Services, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let evicted = services
            .worker_registry
            .reap(services.timeouts.heartbeat_timeout, services.timeouts.worker_eviction_grace)
            .await;
        for worker in evicted {
            if let Some(execution_id) = worker.active_execution_id {
                warn!(worker_id = %worker.worker_id, %execution_id, "evicting unresponsive worker");
                services.engine.fail_for_worker_loss(&execution_id).await;
            }
        }
    }
}

async fn start_grpc_server(
    addr: std::net::SocketAddr,
    services: Services,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<proto::worker_protocol_server::WorkerProtocolServer<WorkerProtocolHandler>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build()
        .expect("reflection service descriptor is valid");

    let handler = WorkerProtocolHandler::new(
        services.worker_registry,
        services.executions,
        services.fanout,
        services.connections,
    );

    Server::builder()
        .add_service(reflection_service)
        .add_service(health_service)
        .add_service(proto::worker_protocol_server::WorkerProtocolServer::new(handler))
        .serve_with_shutdown(addr, async {
            let _ = shutdown.await;
        })
        .await?;
    Ok(())
}
