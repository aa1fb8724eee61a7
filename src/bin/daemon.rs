//! `usbip-assignd`: the host-side Device Assignment Daemon.

use clap::Parser;
use tokio::net::TcpListener;

use usbip_assignd::engine::{Engine, EngineHandle};
use usbip_assignd::events::EventBus;
use usbip_assignd::session::{self, SessionEvent};
use usbip_assignd::store::AssignmentStore;
use usbip_assignd::usbip_tool::{SystemUsbipTool, UsbipTool};
use usbip_assignd::watcher::{DeviceEventSource, SysfsUdevEventSource};
use usbip_assignd::{control, BusId};

/// USB/IP device assignment daemon.
#[derive(Parser, Debug)]
#[command(name = "usbip-assignd")]
struct Args {
    /// Host for the control TCP socket.
    #[arg(long, default_value = "0.0.0.0")]
    socket_host: String,

    /// Port for the control TCP socket.
    #[arg(long, default_value_t = 65432)]
    socket_port: u16,

    /// Host for the operator control API.
    #[arg(long, default_value = "0.0.0.0")]
    api_host: String,

    /// Port for the operator control API.
    #[arg(long, default_value_t = 8080)]
    api_port: u16,

    /// Comma-separated list of watched root-hub port prefixes.
    #[arg(long, default_value = "1-1,3-1,1-2,3-2")]
    physical_ports: String,

    /// Path to the persistent assignment file.
    #[arg(long, default_value = "assignments.json")]
    assignments_file: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let port_prefixes: Vec<String> = args.physical_ports.split(',').map(str::to_owned).collect();

    let store = AssignmentStore::load(&args.assignments_file);
    let tool = Box::new(SystemUsbipTool::new());
    if !tool.is_tool_present() {
        log::error!("usbip command not found; device binds will fail until it is installed");
    }
    let bus = EventBus::new();
    let (engine, handle) = Engine::new(store, tool, bus);
    tokio::spawn(engine.run());

    start_port_watcher(port_prefixes, handle.clone());
    start_session_listener(&args.socket_host, args.socket_port, handle.clone()).await?;
    start_control_api(&args.api_host, args.api_port, handle.clone()).await?;

    log::info!(
        "usbip-assignd ready: control socket {}:{}, API {}:{}",
        args.socket_host,
        args.socket_port,
        args.api_host,
        args.api_port
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown requested"),
        Err(e) => log::error!("unable to listen for shutdown signal: {e}"),
    }

    let unbound: Vec<BusId> = handle.shutdown().await;
    log::info!("unbound {} device(s) on shutdown", unbound.len());
    Ok(())
}

fn start_port_watcher(port_prefixes: Vec<String>, handle: EngineHandle) {
    let source = SysfsUdevEventSource::new();
    let existing = source.enumerate_existing(&port_prefixes);
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    source.subscribe(port_prefixes, tx);

    tokio::spawn(async move {
        for bus_id in existing {
            handle
                .device_event(usbip_assignd::watcher::DeviceEvent::Add(bus_id))
                .await;
        }
        while let Some(event) = rx.recv().await {
            handle.device_event(event).await;
        }
    });
}

async fn start_session_listener(host: &str, port: u16, handle: EngineHandle) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    log::info!("control socket listening on {host}:{port}");
    let (tx, mut rx) = tokio::sync::mpsc::channel::<SessionEvent>(256);
    tokio::spawn(session::accept_loop(listener, tx));
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle.session_event(event).await;
        }
    });
    Ok(())
}

async fn start_control_api(host: &str, port: u16, handle: EngineHandle) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    log::info!("control API listening on {host}:{port}");
    let app = control::router(handle);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("control API server stopped: {e}");
        }
    });
    Ok(())
}
