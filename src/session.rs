//! Client Session Manager: accepts control-plane TCP connections, maps
//! client IDs to write endpoints, frames outbound messages, and detects
//! disconnection.

use std::collections::HashMap;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::ids::ClientId;

/// The sink end of a session's outbound frame channel. A dedicated
/// writer task drains this and writes to the socket; dropping it (or a
/// write failing) tears the session down.
pub type FrameSink = mpsc::UnboundedSender<String>;

/// Events the session layer reports up to whoever owns the canonical
/// session map (the Engine), kept decoupled from the Engine's own type
/// so this module has no dependency on it.
#[derive(Debug)]
pub enum SessionEvent {
    Connected { client_id: ClientId, sink: FrameSink },
    Disconnected { client_id: ClientId },
}

struct Session {
    sink: FrameSink,
    #[allow(dead_code)]
    connected_at: Instant,
}

/// Owns the canonical client_id -> write-endpoint mapping. Not
/// `Send`/`Sync`-shared: the Engine owns one instance on its single
/// reactor lane.
#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<ClientId, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new session for `client_id`. Returns `true` if this
    /// superseded a previous session under the same ID — the caller
    /// must treat that as a disconnect of the old session (its sink is
    /// dropped here, which ends its writer task) before applying any
    /// connect-time effects for the new one.
    pub fn register(&mut self, client_id: ClientId, sink: FrameSink) -> bool {
        self.sessions
            .insert(
                client_id,
                Session {
                    sink,
                    connected_at: Instant::now(),
                },
            )
            .is_some()
    }

    pub fn unregister(&mut self, client_id: &ClientId) {
        self.sessions.remove(client_id);
    }

    pub fn is_connected(&self, client_id: &ClientId) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Sends one frame. Returns `false` (and tears the session down) if
    /// the send fails, e.g. the writer task's socket already closed.
    pub fn send(&mut self, client_id: &ClientId, frame: String) -> bool {
        let Some(session) = self.sessions.get(client_id) else {
            log::info!("client {client_id} not connected (cannot send '{}')", frame.trim_end());
            return false;
        };
        if session.sink.send(frame).is_ok() {
            true
        } else {
            self.sessions.remove(client_id);
            false
        }
    }

    pub fn broadcast(&mut self, frame: &str) {
        let ids: Vec<ClientId> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.send(&id, frame.to_owned());
        }
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.sessions.keys().cloned().collect()
    }
}

/// Accepts connections on `listener` forever, handing each one off as a
/// `SessionEvent` on `events`. Per §4.E: reads the first line (or up to
/// 100 bytes if no newline arrives), derives the client ID, spawns a
/// writer task draining `sink`, and then drains the read half solely to
/// detect disconnection (256-byte read budget, content discarded).
pub async fn accept_loop(listener: TcpListener, events: mpsc::Sender<SessionEvent>) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("control socket accept failed: {e}");
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            handle_connection(socket, peer, events).await;
        });
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: std::net::SocketAddr,
    events: mpsc::Sender<SessionEvent>,
) {
    log::info!("client connected from {peer}");
    let client_id = match read_client_id(&mut socket).await {
        Ok(id) => id,
        Err(e) => {
            log::info!("client {peer} disconnected before identifying: {e}");
            return;
        }
    };

    let (sink, mut rx) = mpsc::unbounded_channel::<String>();
    let (mut read_half, mut write_half) = socket.into_split();

    let writer_client_id = client_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(frame.as_bytes()).await {
                log::warn!("write to {writer_client_id} failed: {e}");
                break;
            }
        }
    });

    if events
        .send(SessionEvent::Connected {
            client_id: client_id.clone(),
            sink,
        })
        .await
        .is_err()
    {
        writer_task.abort();
        return;
    }

    let mut discard = [0u8; 256];
    loop {
        match read_half.read(&mut discard).await {
            Ok(0) => {
                log::info!("client disconnected: {client_id}");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                log::info!("client connection reset: {client_id}: {e}");
                break;
            }
        }
    }
    writer_task.abort();
    let _ = events.send(SessionEvent::Disconnected { client_id }).await;
}

async fn read_client_id(socket: &mut TcpStream) -> std::io::Result<ClientId> {
    let peer = socket.peer_addr()?;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= 100 {
            break;
        }
        match socket.read(&mut byte).await? {
            0 => break,
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                buf.push(byte[0]);
            }
        }
    }
    let raw = String::from_utf8_lossy(&buf).trim().to_owned();
    if let Some(rest) = raw.strip_prefix("CLIENT_ID:") {
        let trimmed = rest.trim();
        if !trimmed.is_empty() {
            return Ok(ClientId::new(trimmed));
        }
    }
    Ok(ClientId::new(format!("{}:{}", peer.ip(), peer.port())))
}
