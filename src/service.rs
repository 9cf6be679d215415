use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum_server::Handle;
use tokio::signal;
use tracing::info;

use crate::{
    aggregator::HostAggregator,
    attribution::{ContainerAttributor, DockerRuntime},
    command_resolver::CommandResolver,
    config::ServerConfig,
    fleet::{FleetCoordinator, SshExecutor},
    gpu::NvidiaSmi,
    routes::{create_routes, RouteState},
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub local: Arc<HostAggregator>,
    pub fleet: Arc<FleetCoordinator>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let local = Arc::new(build_host_aggregator(&config)?);
        let fleet = Arc::new(build_fleet_coordinator(&config));
        Ok(Self {
            config,
            local,
            fleet,
        })
    }

    pub async fn start(&self) -> Result<()> {
        let route_state = RouteState {
            fleet: self.fleet.clone(),
            local: self.local.clone(),
        };

        let handle = Handle::new();
        let handle_sh = handle.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {}", self.config.listen_addr))?;
        info!(
            hosts = self.fleet.servers().len(),
            local_host = self.local.host(),
            "server api listening on {}",
            self.config.listen_addr
        );
        axum_server::bind(addr)
            .handle(handle)
            .serve(create_routes(route_state).into_make_service())
            .await?;

        Ok(())
    }
}

/// Wires the local GPU, container and process sources together.
pub fn build_host_aggregator(config: &ServerConfig) -> Result<HostAggregator> {
    let local = &config.local;
    let runtime = DockerRuntime::new(local.docker_address.as_deref(), local.tool_timeout())
        .context("error initializing docker client")?;
    let attributor = ContainerAttributor::new(
        local.proc_root.clone(),
        local.attribution,
        Arc::new(runtime),
        local.tool_timeout(),
    );
    Ok(HostAggregator::new(
        local.host_name(),
        Arc::new(NvidiaSmi::new(local.nvidia_smi.clone(), local.tool_timeout())),
        attributor,
        CommandResolver::new(local.tool_timeout()),
    ))
}

pub fn build_fleet_coordinator(config: &ServerConfig) -> FleetCoordinator {
    let executor = SshExecutor::new(config.fleet.ssh_binary.clone());
    FleetCoordinator::new(&config.fleet, Arc::new(executor))
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    handle.shutdown();
    info!("signal received, shutting down server gracefully");
}
