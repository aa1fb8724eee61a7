//! `usbip-assign-client`: the Client Agent that attaches/detaches
//! devices locally in response to the daemon's `bound`/`unbound`/
//! `removed` frames.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use usbip_assignd::client_agent::{self, ClientAgentConfig};
use usbip_assignd::usbip_tool::SystemUsbipTool;

/// USB/IP client agent.
#[derive(Parser, Debug)]
#[command(name = "usbip-assign-client")]
struct Args {
    /// Hostname or IP of the assignment daemon.
    #[arg(long)]
    server_host: String,

    /// Control socket port of the assignment daemon.
    #[arg(long, default_value_t = 65432)]
    server_port: u16,

    /// Seconds to wait before reconnecting after a dropped connection.
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = ClientAgentConfig {
        server_host: args.server_host,
        server_port: args.server_port,
        reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
    };
    let tool = Arc::new(SystemUsbipTool::new());
    client_agent::run(config, tool).await;
}
