//! Client Agent: connects to the assignment daemon, identifies itself
//! by hostname, and reacts to `bound`/`unbound`/`removed` frames by
//! invoking `usbip attach`/`usbip detach` locally.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::ids::BusId;
use crate::usbip_tool::UsbipTool;

pub struct ClientAgentConfig {
    pub server_host: String,
    pub server_port: u16,
    pub reconnect_delay: Duration,
}

/// One verb parsed out of a control-socket frame. Frames are three
/// whitespace-separated words (`Device <bus_id> <verb>`); the verb is
/// matched by exact token equality, never by substring — `unbound`
/// contains `bound` as a substring and a naive `contains("bound")`
/// check would misfire on it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame {
    Bound(BusId),
    Unbound(BusId),
    Removed(BusId),
}

fn parse_frame(line: &str) -> Option<Frame> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let [_device, bus_id, verb] = tokens[..] else {
        return None;
    };
    let bus_id = BusId::new(bus_id);
    match verb {
        "bound" => Some(Frame::Bound(bus_id)),
        "unbound" => Some(Frame::Unbound(bus_id)),
        "removed" => Some(Frame::Removed(bus_id)),
        _ => None,
    }
}

/// Maintains a TCP connection to the daemon, reconnecting indefinitely
/// on disconnect. Runs forever; callers typically `tokio::spawn` this.
pub async fn run(config: ClientAgentConfig, tool: Arc<dyn UsbipTool>) {
    let client_id = hostname::get()
        .map(|h| h.to_string_lossy().to_lowercase())
        .unwrap_or_else(|_| "unknown".to_owned());
    log::info!("using hostname '{client_id}' as client ID");

    loop {
        match connect_and_serve(&config, &client_id, tool.clone()).await {
            Ok(()) => log::info!("connection to {}:{} closed cleanly", config.server_host, config.server_port),
            Err(e) => log::warn!(
                "connection to {}:{} failed: {e}",
                config.server_host,
                config.server_port
            ),
        }
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn connect_and_serve(
    config: &ClientAgentConfig,
    client_id: &str,
    tool: Arc<dyn UsbipTool>,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect((config.server_host.as_str(), config.server_port)).await?;
    log::info!("connected to {}:{}", config.server_host, config.server_port);
    stream.write_all(format!("CLIENT_ID:{client_id}\n").as_bytes()).await?;

    let (read_half, _write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    while let Some(line) = lines.next_line().await? {
        log::info!("data received: {line}");
        let Some(frame) = parse_frame(&line) else {
            continue;
        };
        handle_frame(frame, &config.server_host, tool.as_ref()).await;
    }
    Ok(())
}

async fn handle_frame(frame: Frame, server_host: &str, tool: &dyn UsbipTool) {
    match frame {
        Frame::Bound(bus_id) => ensure_attached(&bus_id, server_host, tool).await,
        Frame::Unbound(bus_id) | Frame::Removed(bus_id) => ensure_detached(&bus_id, tool).await,
    }
}

async fn ensure_attached(bus_id: &BusId, server_host: &str, tool: &dyn UsbipTool) {
    log::info!("binding {bus_id}...");
    let attached = tool.attached_ports();
    if let Some((port, _)) = attached.iter().find(|(_, b)| b == bus_id) {
        detach_port(port, tool).await;
    }
    match tool.list_remote(server_host) {
        Ok(remote) if remote.contains(bus_id) => {
            log::info!("device available on server. attaching...");
            if let Err(e) = tool.attach(server_host, bus_id) {
                log::error!("attach failed for {bus_id}: {e}");
            }
        }
        Ok(_) => {
            log::warn!("device {bus_id} not available on server or already attached elsewhere");
        }
        Err(e) => log::error!("usbip list failed: {e}"),
    }
}

async fn ensure_detached(bus_id: &BusId, tool: &dyn UsbipTool) {
    log::info!("unbinding {bus_id}...");
    let attached = tool.attached_ports();
    match attached.iter().find(|(_, b)| b == bus_id) {
        Some((port, _)) => detach_port(port, tool).await,
        None => log::info!("device {bus_id} is not attached"),
    }
}

async fn detach_port(port: &str, tool: &dyn UsbipTool) {
    if let Err(e) = tool.detach(port) {
        log::error!("detach failed for port {port}: {e}");
    }
    tokio::time::sleep(crate::usbip_tool::SETTLE_DELAY).await;
}
