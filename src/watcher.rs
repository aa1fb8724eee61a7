//! USB Port Watcher: enumerates existing devices at startup and
//! subscribes to kernel USB events, emitting `add`/`remove` for bus IDs
//! under the watched port prefixes.

use tokio::sync::mpsc;

use crate::ids::BusId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Add(BusId),
    Remove(BusId),
}

/// Abstraction over the kernel USB event stream, so tests can inject
/// deterministic `add`/`remove` sequences without real udev.
pub trait DeviceEventSource: Send {
    /// Enumerates bus IDs currently attached under `/sys/bus/usb/devices`
    /// (or the test double's equivalent), filtered to `port_prefixes`.
    fn enumerate_existing(&self, port_prefixes: &[String]) -> Vec<BusId>;

    /// Spawns whatever background work is needed to deliver future
    /// events into `sink`, already filtered to `port_prefixes`. Returns
    /// immediately; delivery happens asynchronously.
    fn subscribe(&self, port_prefixes: Vec<String>, sink: mpsc::Sender<DeviceEvent>);
}

/// Production device event source: scans sysfs on startup, then runs a
/// `udev` monitor on a dedicated OS thread and posts filtered events
/// into a bounded channel for the reactor to pick up.
pub struct SysfsUdevEventSource {
    sysfs_root: std::path::PathBuf,
}

impl SysfsUdevEventSource {
    pub fn new() -> Self {
        Self {
            sysfs_root: std::path::PathBuf::from("/sys/bus/usb/devices"),
        }
    }
}

impl Default for SysfsUdevEventSource {
    fn default() -> Self {
        Self::new()
    }
}

fn is_interface_entry(name: &str) -> bool {
    name.contains(':')
}

impl DeviceEventSource for SysfsUdevEventSource {
    fn enumerate_existing(&self, port_prefixes: &[String]) -> Vec<BusId> {
        let entries = match std::fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!(
                    "USB sysfs not found at {}: {e}; is this Linux with USB/IP installed?",
                    self.sysfs_root.display()
                );
                return Vec::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !is_interface_entry(name))
            .filter(|name| port_prefixes.iter().any(|p| name.starts_with(p.as_str())))
            .map(BusId::new)
            .collect()
    }

    fn subscribe(&self, port_prefixes: Vec<String>, sink: mpsc::Sender<DeviceEvent>) {
        std::thread::spawn(move || {
            run_udev_monitor_thread(port_prefixes, sink);
        });
    }
}

#[cfg(target_os = "linux")]
fn run_udev_monitor_thread(port_prefixes: Vec<String>, sink: mpsc::Sender<DeviceEvent>) {
    let builder = match udev::MonitorBuilder::new().and_then(|b| b.match_subsystem("usb")) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("udev unavailable: {e}; operating on an empty event stream");
            return;
        }
    };
    let mut socket = match builder.listen() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("udev unavailable: {e}; operating on an empty event stream");
            return;
        }
    };
    loop {
        let event = match socket.next() {
            Some(event) => event,
            None => {
                std::thread::sleep(std::time::Duration::from_millis(50));
                continue;
            }
        };
        let bus_id = event.sysname().to_string_lossy().into_owned();
        if is_interface_entry(&bus_id) {
            continue;
        }
        if !port_prefixes.iter().any(|p| bus_id.starts_with(p.as_str())) {
            continue;
        }
        let mapped = match event.event_type() {
            udev::EventType::Add => Some(DeviceEvent::Add(BusId::new(bus_id))),
            udev::EventType::Remove => Some(DeviceEvent::Remove(BusId::new(bus_id))),
            _ => None,
        };
        if let Some(ev) = mapped {
            if sink.blocking_send(ev).is_err() {
                return;
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run_udev_monitor_thread(_port_prefixes: Vec<String>, _sink: mpsc::Sender<DeviceEvent>) {
    log::warn!("udev monitoring is only available on Linux; operating on an empty event stream");
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_entries_are_filtered() {
        assert!(is_interface_entry("1-1:1.0"));
        assert!(!is_interface_entry("1-1"));
    }
}
