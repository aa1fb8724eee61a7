//! Assignment Engine: the core reconciliation logic. Joins events from
//! the port watcher, session manager, and operator commands; decides
//! when to notify, force-free, reattach, or auto-assign.
//!
//! Runs as a single task so the Registry, Store, and SessionManager
//! never need a mutex (§5: one logical reactor lane).

use tokio::sync::{mpsc, oneshot};

use crate::events::{Event, EventBus};
use crate::ids::{BusId, ClientId};
use crate::registry::{DeviceSnapshot, Registry};
use crate::session::{FrameSink, SessionEvent, SessionManager};
use crate::store::{AssignmentStore, StoreError};
use crate::usbip_tool::{UsbipTool, SETTLE_DELAY};
use crate::watcher::DeviceEvent;

/// Outcome token returned by each operator-facing operation (§4.H/§6).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Assigned,
    AlreadyInUse,
    Unassigned,
    QueuedForClient,
    Freed,
    Reattached,
    NotExported,
    Cleared,
    AssignedAll(ClientId),
}

/// Logs a warning on persistence failure and reports whether the write
/// succeeded, so callers can both react to the failure and keep serving
/// from memory per §7.
fn log_store_result(result: Result<(), StoreError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::warn!("assignment store update failed: {e}");
            false
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct DebugSnapshot {
    pub device_assignments: Vec<(BusId, ClientId)>,
    pub device_in_use: Vec<(BusId, ClientId)>,
    pub exported: Vec<BusId>,
    pub clients: Vec<ClientId>,
    pub assign_all_client_id: ClientId,
}

enum Message {
    Device(DeviceEvent),
    Session(SessionEvent),
    Assign {
        bus_id: BusId,
        client_id: ClientId,
        reply: oneshot::Sender<Outcome>,
    },
    ForceFree {
        bus_id: BusId,
        reply: oneshot::Sender<Outcome>,
    },
    ForceReattach {
        bus_id: BusId,
        reply: oneshot::Sender<Outcome>,
    },
    AssignAll {
        client_id: ClientId,
        reply: oneshot::Sender<Outcome>,
    },
    ListDevices(oneshot::Sender<Vec<DeviceSnapshot>>),
    ListClients(oneshot::Sender<Vec<ClientId>>),
    Debug(oneshot::Sender<DebugSnapshot>),
    Shutdown(oneshot::Sender<Vec<BusId>>),
}

/// A cheap, cloneable handle used by the TCP accept loop, the port
/// watcher, and the Control API Adapter to talk to the single Engine
/// task. All of its methods send a message and, where a reply is
/// expected, await it.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Message>,
}

impl EngineHandle {
    pub async fn device_event(&self, event: DeviceEvent) {
        let _ = self.tx.send(Message::Device(event)).await;
    }

    pub async fn session_event(&self, event: SessionEvent) {
        let _ = self.tx.send(Message::Session(event)).await;
    }

    pub async fn assign(&self, bus_id: BusId, client_id: ClientId) -> Outcome {
        self.call(|reply| Message::Assign { bus_id, client_id, reply }).await
    }

    pub async fn force_free(&self, bus_id: BusId) -> Outcome {
        self.call(|reply| Message::ForceFree { bus_id, reply }).await
    }

    pub async fn force_reattach(&self, bus_id: BusId) -> Outcome {
        self.call(|reply| Message::ForceReattach { bus_id, reply }).await
    }

    pub async fn assign_all(&self, client_id: ClientId) -> Outcome {
        self.call(|reply| Message::AssignAll { client_id, reply }).await
    }

    pub async fn list_devices(&self) -> Vec<DeviceSnapshot> {
        self.call(Message::ListDevices).await
    }

    pub async fn list_clients(&self) -> Vec<ClientId> {
        self.call(Message::ListClients).await
    }

    pub async fn debug(&self) -> DebugSnapshot {
        self.call(Message::Debug).await
    }

    /// Unbinds every exported device and returns the bus IDs that were
    /// unbound, for the daemon's shutdown sequence (§5).
    pub async fn shutdown(&self) -> Vec<BusId> {
        self.call(Message::Shutdown).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Message) -> T {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(make(reply_tx)).await.is_err() {
            panic!("engine task is gone");
        }
        reply_rx.await.expect("engine task dropped reply channel")
    }
}

pub struct Engine {
    registry: Registry,
    store: AssignmentStore,
    sessions: SessionManager,
    tool: Box<dyn UsbipTool>,
    bus: EventBus,
    rx: mpsc::Receiver<Message>,
}

impl Engine {
    pub fn new(store: AssignmentStore, tool: Box<dyn UsbipTool>, bus: EventBus) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(256);
        let engine = Self {
            registry: Registry::new(),
            store,
            sessions: SessionManager::new(),
            tool,
            bus,
            rx,
        };
        (engine, EngineHandle { tx })
    }

    /// Runs the reactor loop until every `EngineHandle` is dropped. Call
    /// via `tokio::spawn`.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: Message) {
        match msg {
            Message::Device(DeviceEvent::Add(bus_id)) => self.device_added(bus_id).await,
            Message::Device(DeviceEvent::Remove(bus_id)) => self.device_removed(bus_id).await,
            Message::Session(SessionEvent::Connected { client_id, sink }) => {
                self.client_connected(client_id, sink).await
            }
            Message::Session(SessionEvent::Disconnected { client_id }) => {
                self.client_disconnected(client_id).await
            }
            Message::Assign { bus_id, client_id, reply } => {
                let outcome = self.assign(bus_id, client_id).await;
                let _ = reply.send(outcome);
            }
            Message::ForceFree { bus_id, reply } => {
                let outcome = self.force_free(bus_id).await;
                let _ = reply.send(outcome);
            }
            Message::ForceReattach { bus_id, reply } => {
                let outcome = self.force_reattach(bus_id).await;
                let _ = reply.send(outcome);
            }
            Message::AssignAll { client_id, reply } => {
                let outcome = self.assign_all(client_id).await;
                let _ = reply.send(outcome);
            }
            Message::ListDevices(reply) => {
                let _ = reply.send(self.list_devices());
            }
            Message::ListClients(reply) => {
                let _ = reply.send(self.sessions.connected_clients());
            }
            Message::Debug(reply) => {
                let _ = reply.send(self.debug_snapshot());
            }
            Message::Shutdown(reply) => {
                let unbound = self.shutdown_unbind_all();
                let _ = reply.send(unbound);
            }
        }
    }

    // ---- Rule 1: device_added ----
    async fn device_added(&mut self, bus_id: BusId) {
        if !self.registry.is_exported(&bus_id) {
            match self.tool.bind(&bus_id) {
                Ok(()) => {
                    let name = self.tool.device_name(&bus_id);
                    self.registry.mark_exported(bus_id.clone(), name);
                }
                Err(e) => {
                    log::warn!("could not bind {bus_id}: {e}");
                    return;
                }
            }
        }

        let assign_all = self.store.get_assign_all().clone();
        if !assign_all.is_none() && self.sessions.is_connected(&assign_all) {
            if log_store_result(self.store.set(bus_id.clone(), assign_all.clone())) {
                self.push_bound(&bus_id, &assign_all);
            }
        } else if let Some(owner) = self.store.get(&bus_id).cloned() {
            if self.sessions.is_connected(&owner) {
                self.push_bound(&bus_id, &owner);
            }
        }

        self.bus.publish(Event::DeviceAdded(bus_id.clone()));
        self.bus.publish(Event::Updated(bus_id));
    }

    /// Pushes a `bound` frame for `bus_id` to `owner` and marks it in
    /// use only if delivery succeeded.
    fn push_bound(&mut self, bus_id: &BusId, owner: &ClientId) {
        if self.sessions.send(owner, format!("Device {bus_id} bound\n")) {
            self.registry.mark_in_use(bus_id.clone(), owner.clone());
        }
    }

    // ---- Rule 2: device_removed ----
    async fn device_removed(&mut self, bus_id: BusId) {
        self.registry.remove(&bus_id);
        self.sessions.broadcast(&format!("Device {bus_id} removed\n"));
        self.bus.publish(Event::DeviceRemoved(bus_id.clone()));
        self.bus.publish(Event::Updated(bus_id));
    }

    // ---- Rule 3: client_connected ----
    async fn client_connected(&mut self, client_id: ClientId, sink: FrameSink) {
        let superseded = self.sessions.register(client_id.clone(), sink);
        if superseded {
            self.registry.clear_in_use_for_client(&client_id);
        }

        let mut exported: Vec<BusId> = self.registry.exported_bus_ids().cloned().collect();
        exported.sort();

        // 3a: devices this client is already the desired owner of.
        for bus_id in &exported {
            if self.registry.in_use_by(bus_id).is_some() {
                continue;
            }
            if self.store.get(bus_id) == Some(&client_id) {
                self.push_bound(bus_id, &client_id);
            }
        }

        // 3b: assign_all bootstrap — only when no fallback client is set.
        if self.store.get_assign_all().is_none() {
            for bus_id in &exported {
                if self.store.get(bus_id).is_some() {
                    continue;
                }
                if !log_store_result(self.store.set(bus_id.clone(), client_id.clone())) {
                    continue;
                }
                if self.sessions.send(&client_id, format!("Device {bus_id} bound\n")) {
                    self.registry.mark_in_use(bus_id.clone(), client_id.clone());
                } else {
                    // 3c: roll back the desired-owner entry on failed delivery.
                    log_store_result(self.store.remove(bus_id));
                }
            }
        }

        self.bus.publish(Event::ClientConnected(client_id));
    }

    // ---- Rule 4: client_disconnected ----
    async fn client_disconnected(&mut self, client_id: ClientId) {
        self.sessions.unregister(&client_id);
        self.registry.clear_in_use_for_client(&client_id);
        self.bus.publish(Event::ClientDisconnected(client_id));
    }

    // ---- Rule 5: force_free ----
    async fn force_free(&mut self, bus_id: BusId) -> Outcome {
        if !self.registry.is_exported(&bus_id) {
            return Outcome::NotExported;
        }
        self.force_free_inner(&bus_id).await;
        Outcome::Freed
    }

    async fn force_free_inner(&mut self, bus_id: &BusId) {
        if let Some(previous_owner) = self.registry.clear_in_use(bus_id) {
            self.sessions.send(&previous_owner, format!("Device {bus_id} unbound\n"));
            self.bus.publish(Event::ForceFree {
                bus_id: bus_id.clone(),
                previous_owner,
            });
        }
        self.tool.unbind(bus_id);
        tokio::time::sleep(SETTLE_DELAY).await;
        match self.tool.bind(bus_id) {
            Ok(()) => {
                let name = self.tool.device_name(bus_id);
                self.registry.mark_exported(bus_id.clone(), name);
            }
            Err(e) => {
                log::warn!("could not rebind {bus_id} after force-free: {e}");
                self.registry.remove(bus_id);
            }
        }
    }

    // ---- Rule 6: force_reattach ----
    async fn force_reattach(&mut self, bus_id: BusId) -> Outcome {
        if !self.registry.is_exported(&bus_id) {
            return Outcome::NotExported;
        }
        self.force_free_inner(&bus_id).await;
        self.device_added(bus_id).await;
        Outcome::Reattached
    }

    // ---- Rule 7: assign ----
    async fn assign(&mut self, bus_id: BusId, client_id: ClientId) -> Outcome {
        if !self.registry.is_exported(&bus_id) {
            match self.tool.bind(&bus_id) {
                Ok(()) => {
                    let name = self.tool.device_name(&bus_id);
                    self.registry.mark_exported(bus_id.clone(), name);
                }
                // `assign`'s legal outcome set has no `not-exported` token
                // (that's reserved for force_free/force_reattach); a bind
                // failure here just means delivery can't happen yet.
                Err(_) => return Outcome::QueuedForClient,
            }
        }

        let current = self.registry.in_use_by(&bus_id).cloned();
        if current.as_ref() == Some(&client_id) {
            log_store_result(self.store.set(bus_id, client_id));
            return Outcome::AlreadyInUse;
        }
        if current.is_some() {
            self.force_free_inner(&bus_id).await;
        }

        if client_id.is_none() {
            self.registry.clear_in_use(&bus_id);
            log_store_result(self.store.remove(&bus_id));
            return Outcome::Unassigned;
        }

        if !log_store_result(self.store.set(bus_id.clone(), client_id.clone())) {
            return Outcome::QueuedForClient;
        }
        if self.sessions.send(&client_id, format!("Device {bus_id} bound\n")) {
            self.registry.mark_in_use(bus_id, client_id);
            Outcome::Assigned
        } else {
            self.registry.clear_in_use(&bus_id);
            Outcome::QueuedForClient
        }
    }

    // ---- Rule 8: assign_all ----
    async fn assign_all(&mut self, client_id: ClientId) -> Outcome {
        if client_id.is_none() {
            let owned: Vec<BusId> = self.store.iter().map(|(b, _)| b.clone()).collect();
            for bus_id in owned {
                self.force_free_inner(&bus_id).await;
            }
            log_store_result(self.store.clear_all());
            return Outcome::Cleared;
        }

        let exported: Vec<BusId> = self.registry.exported_bus_ids().cloned().collect();
        for bus_id in &exported {
            if self.store.get(bus_id) != Some(&client_id) {
                self.force_free_inner(bus_id).await;
            }
        }
        log_store_result(self.store.set_assign_all(client_id.clone()));
        for bus_id in &exported {
            if !log_store_result(self.store.set(bus_id.clone(), client_id.clone())) {
                continue;
            }
            self.push_bound(bus_id, &client_id);
        }
        Outcome::AssignedAll(client_id)
    }

    fn list_devices(&self) -> Vec<DeviceSnapshot> {
        self.registry
            .exported_bus_ids()
            .map(|bus_id| DeviceSnapshot {
                bus_id: bus_id.clone(),
                name: self.registry.name(bus_id).unwrap_or_default().to_owned(),
                assigned_to: self.store.get(bus_id).cloned(),
                in_use_by: self.registry.in_use_by(bus_id).cloned(),
            })
            .collect()
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            device_assignments: self.store.iter().map(|(b, c)| (b.clone(), c.clone())).collect(),
            device_in_use: self
                .registry
                .exported_bus_ids()
                .filter_map(|b| self.registry.in_use_by(b).map(|c| (b.clone(), c.clone())))
                .collect(),
            exported: self.registry.exported_bus_ids().cloned().collect(),
            clients: self.sessions.connected_clients(),
            assign_all_client_id: self.store.get_assign_all().clone(),
        }
    }

    fn shutdown_unbind_all(&mut self) -> Vec<BusId> {
        let exported: Vec<BusId> = self.registry.exported_bus_ids().cloned().collect();
        for bus_id in &exported {
            self.tool.unbind(bus_id);
        }
        exported
    }
}

