use actix_server::ServerHandle;
use actix_web::{App, HttpServer, web::Data};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};
use paperdrop_agent::{
    api::Api,
    config::{AgentConfig, AgentMode},
    link::websocket::WebSocketLink,
    services::{
        credential_store::FileCredentialStore,
        network::{NetworkBackend, ShellNetworkProvisioner, SimulatedNetworkProvisioner},
        peripheral::{CommandPeripheral, FilePeripheral, OutputDevice},
        provisioning::CredentialSubmitted,
        status::StatusBoard,
    },
    state_machine::{DeviceStateMachine, MachineConfig},
};
use rustls::crypto::{CryptoProvider, ring::default_provider};
use std::{io::Write, sync::Arc};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

type PortalApi = Api<FileCredentialStore, NetworkBackend>;

#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    initialize()?;

    let config = AgentConfig::load().context("failed to load configuration")?;
    info!("running in {} mode", config.mode);

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let store = Arc::new(FileCredentialStore::new(&config.paths.config_dir));
    let provisioner = Arc::new(network_backend(&config));
    let status = StatusBoard::new();
    // the machine only needs the latest submission
    let (submissions_tx, submissions_rx) = mpsc::channel::<CredentialSubmitted>(1);

    let api = PortalApi {
        store: store.clone(),
        provisioner: provisioner.clone(),
        status: status.clone(),
        submissions: submissions_tx,
        dashboard_url: config.portal.dashboard_url.clone(),
    };
    let (server_handle, server_task) = run_server(api, config.portal.port)?;

    let machine = DeviceStateMachine::new(
        MachineConfig::from(&config),
        store,
        provisioner,
        WebSocketLink::from_config(&config.cloud),
        Arc::new(output_device(&config)),
        status,
        submissions_rx,
    );
    let shutdown = CancellationToken::new();
    let mut machine_task = tokio::spawn(machine.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => debug!("ctrl-c received"),
        _ = sigterm.recv() => debug!("SIGTERM received"),
        result = server_task => match result {
            Ok(Ok(())) => debug!("portal stopped normally"),
            Ok(Err(e)) => error!("portal stopped with error: {e}"),
            Err(e) => error!("portal task panicked: {e}"),
        },
        result = &mut machine_task => if let Err(e) = result {
            error!("state machine task panicked: {e}");
        },
    }

    info!("shutting down");

    shutdown.cancel();
    if !machine_task.is_finished() {
        if let Err(e) = machine_task.await {
            error!("state machine task panicked: {e}");
        }
    }
    server_handle.stop(true).await;

    info!("shutdown complete");
    Ok(())
}

fn initialize() -> Result<()> {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("info"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    info!("module version: {}", env!("CARGO_PKG_VERSION"));

    CryptoProvider::install_default(default_provider())
        .map_err(|_| anyhow::anyhow!("crypto provider already installed"))?;

    Ok(())
}

fn network_backend(config: &AgentConfig) -> NetworkBackend {
    match config.mode {
        AgentMode::Development => NetworkBackend::Simulated(SimulatedNetworkProvisioner),
        AgentMode::Production | AgentMode::Integration => {
            NetworkBackend::Shell(ShellNetworkProvisioner::new(config.network.clone()))
        }
    }
}

fn output_device(config: &AgentConfig) -> OutputDevice {
    match &config.peripheral.renderer {
        Some(renderer) if !config.mode.uses_debug_output() => OutputDevice::Command(
            CommandPeripheral::new(renderer, config.peripheral.render_timeout),
        ),
        _ => {
            info!(
                "print output goes to {}",
                config.peripheral.debug_dir.display()
            );
            OutputDevice::File(FilePeripheral::new(&config.peripheral.debug_dir))
        }
    }
}

fn run_server(
    api: PortalApi,
    port: u16,
) -> Result<(
    ServerHandle,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
)> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(api.clone()))
            .configure(PortalApi::configure)
    })
    .bind(("0.0.0.0", port))
    .context("failed to bind portal")?
    .disable_signals()
    .run();

    info!("portal listening on port {port}");

    Ok((server.handle(), tokio::spawn(server)))
}
