//! Scenario and invariant tests for the Assignment Engine (spec §8),
//! driven directly against `EngineHandle` with a fake `usbip` tool so no
//! real USB hardware or subprocess is needed.

use std::sync::Mutex;

use tokio::sync::mpsc;

use usbip_assignd::engine::{Engine, Outcome};
use usbip_assignd::events::EventBus;
use usbip_assignd::ids::{BusId, ClientId};
use usbip_assignd::session::SessionEvent;
use usbip_assignd::store::AssignmentStore;
use usbip_assignd::usbip_tool::{UsbipTool, UsbipToolError};

/// Binds always succeed unless the bus ID is listed in `refuse_bind`.
#[derive(Default)]
struct FakeUsbipTool {
    refuse_bind: Mutex<Vec<String>>,
}

impl UsbipTool for FakeUsbipTool {
    fn bind(&self, bus_id: &BusId) -> Result<(), UsbipToolError> {
        if self.refuse_bind.lock().unwrap().contains(&bus_id.to_string()) {
            return Err(UsbipToolError::NonZeroExit {
                args: "bind".into(),
                stderr: "refused in test".into(),
            });
        }
        Ok(())
    }

    fn unbind(&self, _bus_id: &BusId) {}

    fn device_name(&self, bus_id: &BusId) -> String {
        bus_id.to_string()
    }

    fn is_tool_present(&self) -> bool {
        true
    }

    fn attach(&self, _host: &str, _bus_id: &BusId) -> Result<(), UsbipToolError> {
        Ok(())
    }

    fn detach(&self, _port: &str) -> Result<(), UsbipToolError> {
        Ok(())
    }

    fn list_remote(&self, _host: &str) -> Result<Vec<BusId>, UsbipToolError> {
        Ok(Vec::new())
    }

    fn attached_ports(&self) -> Vec<(String, BusId)> {
        Vec::new()
    }
}

fn engine_with_store(store: AssignmentStore) -> usbip_assignd::EngineHandle {
    let tool = Box::new(FakeUsbipTool::default());
    let (engine, handle) = Engine::new(store, tool, EventBus::new());
    tokio::spawn(engine.run());
    handle
}

fn empty_store() -> AssignmentStore {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");
    std::mem::forget(dir); // keep the temp dir alive for the test's duration
    AssignmentStore::load(path)
}

async fn connect_client(handle: &usbip_assignd::EngineHandle, client_id: &str) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    handle
        .session_event(SessionEvent::Connected {
            client_id: ClientId::new(client_id),
            sink: tx,
        })
        .await;
    rx
}

async fn disconnect_client(handle: &usbip_assignd::EngineHandle, client_id: &str) {
    handle
        .session_event(SessionEvent::Disconnected {
            client_id: ClientId::new(client_id),
        })
        .await;
}

/// S1 — auto-assign on first connect.
#[tokio::test]
async fn s1_auto_assign_on_first_connect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");
    let store = AssignmentStore::load(&path);
    let handle = engine_with_store(store);

    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    let mut rx = connect_client(&handle, "catc").await;

    let frame = rx.recv().await.expect("bound frame");
    assert_eq!(frame, "Device 1-1 bound\n");

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("1-1")).unwrap();
    assert_eq!(dev.in_use_by, Some(ClientId::new("catc")));
    assert_eq!(dev.assigned_to, Some(ClientId::new("catc")));

    // persistence: reload the store from disk and confirm the desired
    // owner was written through.
    let reloaded = AssignmentStore::load(&path);
    assert_eq!(reloaded.get(&BusId::new("1-1")), Some(&ClientId::new("catc")));
    assert!(reloaded.get_assign_all().is_none());
}

/// S2 — reattach after server restart: a persisted desired owner is
/// honored once both the device and the client show up.
#[tokio::test]
async fn s2_reattach_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assignments.json");
    {
        let mut store = AssignmentStore::load(&path);
        store.set(BusId::new("3-1"), ClientId::new("dogd")).unwrap();
    }
    let store = AssignmentStore::load(&path);
    let handle = engine_with_store(store);

    let mut rx = connect_client(&handle, "dogd").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("3-1")))
        .await;

    let frame = rx.recv().await.expect("bound frame");
    assert_eq!(frame, "Device 3-1 bound\n");
    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("3-1")).unwrap();
    assert_eq!(dev.in_use_by, Some(ClientId::new("dogd")));
}

/// S3 — forced takeover: assigning an in-use device to a new client
/// unbinds/rebinds and notifies both parties in order.
#[tokio::test]
async fn s3_forced_takeover() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut cat_rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-2")))
        .await;
    assert_eq!(cat_rx.recv().await.unwrap(), "Device 1-2 bound\n");

    let mut dog_rx = connect_client(&handle, "dogd").await;

    let outcome = handle.assign(BusId::new("1-2"), ClientId::new("dogd")).await;
    assert_eq!(outcome, Outcome::Assigned);

    assert_eq!(cat_rx.recv().await.unwrap(), "Device 1-2 unbound\n");
    assert_eq!(dog_rx.recv().await.unwrap(), "Device 1-2 bound\n");

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("1-2")).unwrap();
    assert_eq!(dev.in_use_by, Some(ClientId::new("dogd")));
    assert_eq!(dev.assigned_to, Some(ClientId::new("dogd")));
}

/// S4 — client disappears mid-transfer: only its own devices are freed,
/// the desired-owner mapping survives, and nobody else is notified.
#[tokio::test]
async fn s4_client_disconnect_clears_only_its_devices() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut cat_rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("3-2")))
        .await;
    assert_eq!(cat_rx.recv().await.unwrap(), "Device 3-2 bound\n");

    let mut dog_rx = connect_client(&handle, "dogd").await;

    disconnect_client(&handle, "catc").await;

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("3-2")).unwrap();
    assert_eq!(dev.in_use_by, None);
    assert_eq!(dev.assigned_to, Some(ClientId::new("catc")));

    // dogd never sees a frame because of catc's disconnect.
    handle.device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("9-9"))).await;
    tokio::time::timeout(std::time::Duration::from_millis(50), dog_rx.recv())
        .await
        .expect_err("dogd should not have been notified about an unrelated device/disconnect");
}

/// S5 — assign_all then plug: the fallback client becomes desired
/// owner for a newly appearing device and is notified.
#[tokio::test]
async fn s5_assign_all_then_plug() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut dog_rx = connect_client(&handle, "dogd").await;
    let outcome = handle.assign_all(ClientId::new("dogd")).await;
    assert_eq!(outcome, Outcome::AssignedAll(ClientId::new("dogd")));

    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    assert_eq!(dog_rx.recv().await.unwrap(), "Device 1-1 bound\n");

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("1-1")).unwrap();
    assert_eq!(dev.in_use_by, Some(ClientId::new("dogd")));
    assert_eq!(dev.assigned_to, Some(ClientId::new("dogd")));
}

/// S6 — device removed: leaves the exported set, clears in-use, and
/// broadcasts to every connected client, without touching desired
/// ownership.
#[tokio::test]
async fn s6_device_removed_broadcasts_and_retains_desired_owner() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut cat_rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    assert_eq!(cat_rx.recv().await.unwrap(), "Device 1-1 bound\n");
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("3-1")))
        .await;
    assert_eq!(cat_rx.recv().await.unwrap(), "Device 3-1 bound\n");

    let mut dog_rx = connect_client(&handle, "dogd").await;

    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Remove(BusId::new("1-1")))
        .await;

    assert_eq!(cat_rx.recv().await.unwrap(), "Device 1-1 removed\n");
    assert_eq!(dog_rx.recv().await.unwrap(), "Device 1-1 removed\n");

    let devices = handle.list_devices().await;
    assert!(devices.iter().all(|d| d.bus_id != BusId::new("1-1")));
    let debug = handle.debug().await;
    assert!(debug.device_assignments.iter().any(|(b, c)| *b == BusId::new("1-1") && *c == ClientId::new("catc")));
}

/// Invariant: force_free leaves the device exported with no in-use
/// owner.
#[tokio::test]
async fn invariant_force_free_clears_in_use_but_keeps_exported() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    assert_eq!(rx.recv().await.unwrap(), "Device 1-1 bound\n");

    let outcome = handle.force_free(BusId::new("1-1")).await;
    assert_eq!(outcome, Outcome::Freed);

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("1-1")).unwrap();
    assert_eq!(dev.in_use_by, None);
}

/// Invariant: assign(B, "none") clears both in-use and desired owner.
#[tokio::test]
async fn invariant_assign_none_clears_ownership() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    assert_eq!(rx.recv().await.unwrap(), "Device 1-1 bound\n");

    let outcome = handle.assign(BusId::new("1-1"), ClientId::none()).await;
    assert_eq!(outcome, Outcome::Unassigned);

    let devices = handle.list_devices().await;
    let dev = devices.iter().find(|d| d.bus_id == BusId::new("1-1")).unwrap();
    assert_eq!(dev.in_use_by, None);
    assert_eq!(dev.assigned_to, None);
}

/// Invariant: after a client disconnects, no device reports it as
/// in-use.
#[tokio::test]
async fn invariant_disconnect_zeroes_in_use_count() {
    let store = empty_store();
    let handle = engine_with_store(store);

    let mut rx = connect_client(&handle, "catc").await;
    handle
        .device_event(usbip_assignd::watcher::DeviceEvent::Add(BusId::new("1-1")))
        .await;
    assert_eq!(rx.recv().await.unwrap(), "Device 1-1 bound\n");

    disconnect_client(&handle, "catc").await;

    let devices = handle.list_devices().await;
    assert!(devices.iter().all(|d| d.in_use_by != Some(ClientId::new("catc"))));
}

/// A bind failure inside `assign` is surfaced as `queued-for-client`
/// rather than crashing the reactor — `not-exported` is reserved for
/// force_free/force_reattach's outcome set.
#[tokio::test]
async fn assign_reports_queued_for_client_when_bind_fails() {
    let tool = Box::new(FakeUsbipTool::default());
    tool.refuse_bind.lock().unwrap().push("9-9".to_owned());
    let store = empty_store();
    let (engine, handle) = Engine::new(store, tool, EventBus::new());
    tokio::spawn(engine.run());

    let outcome = handle.assign(BusId::new("9-9"), ClientId::new("catc")).await;
    assert_eq!(outcome, Outcome::QueuedForClient);
}
