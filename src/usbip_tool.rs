//! Thin facade over the `usbip` CLI: bind, unbind, and the text parsers
//! for `usbip list -r` and `usbip port` output.
//!
//! Kept as a trait (`UsbipTool`) so the Engine and the Client Agent can
//! be driven against a fake in tests without spawning real processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ids::BusId;

/// Pause between `usbip unbind` and `usbip bind` during a force-free
/// cycle, tolerating kernel USB renegotiation.
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum UsbipToolError {
    #[error("usbip command not found; is the usbip-utils package installed?")]
    NotFound,
    #[error("usbip {args} failed: {stderr}")]
    NonZeroExit { args: String, stderr: String },
}

/// Operations the Engine and Client Agent need from the `usbip` binary.
/// Implemented synchronously per §5 (short-lived subprocess spawns run
/// directly on the reactor lane).
pub trait UsbipTool: Send + Sync {
    /// Binds `bus_id` to the `usbip-host` driver. Fast-paths via the
    /// sysfs driver symlink if already bound.
    fn bind(&self, bus_id: &BusId) -> Result<(), UsbipToolError>;

    /// Unbinds `bus_id`. Tolerant of nonzero exit (device may already
    /// be unbound).
    fn unbind(&self, bus_id: &BusId);

    /// Reads the product string from sysfs, defaulting to the bus ID.
    fn device_name(&self, bus_id: &BusId) -> String;

    /// Whether the `usbip` binary can be located at all.
    fn is_tool_present(&self) -> bool;

    /// Attaches a remote device (client-side operation).
    fn attach(&self, host: &str, bus_id: &BusId) -> Result<(), UsbipToolError>;

    /// Detaches a locally attached device by port number (client-side
    /// operation).
    fn detach(&self, port: &str) -> Result<(), UsbipToolError>;

    /// Runs `usbip list -r <host>` and returns the bus IDs it offers.
    fn list_remote(&self, host: &str) -> Result<Vec<BusId>, UsbipToolError>;

    /// Runs `usbip port` and returns the port -> bus_id mapping
    /// currently attached locally.
    fn attached_ports(&self) -> Vec<(String, BusId)>;
}

/// Real implementation, shelling out to the `usbip` binary and reading
/// sysfs directly.
pub struct SystemUsbipTool {
    binary: String,
    sysfs_root: PathBuf,
}

impl SystemUsbipTool {
    pub fn new() -> Self {
        Self {
            binary: "usbip".to_owned(),
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
        }
    }

    /// For tests: point at a fake `usbip`-shaped binary and a fake
    /// sysfs tree.
    pub fn with_binary_and_sysfs(binary: impl Into<String>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            sysfs_root: sysfs_root.into(),
        }
    }

    fn driver_symlink_target(&self, bus_id: &BusId) -> Option<String> {
        let driver_path = self.sysfs_root.join(bus_id.as_str()).join("driver");
        std::fs::read_link(&driver_path)
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
    }

    fn run(&self, args: &[&str]) -> Result<String, UsbipToolError> {
        let output = Command::new(&self.binary).args(args).output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                UsbipToolError::NotFound
            } else {
                UsbipToolError::NonZeroExit {
                    args: args.join(" "),
                    stderr: e.to_string(),
                }
            }
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(UsbipToolError::NonZeroExit {
                args: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

impl Default for SystemUsbipTool {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbipTool for SystemUsbipTool {
    fn bind(&self, bus_id: &BusId) -> Result<(), UsbipToolError> {
        if self.driver_symlink_target(bus_id).as_deref() == Some("usbip-host") {
            log::info!("{bus_id} already bound to usbip-host");
            return Ok(());
        }
        match self.run(&["bind", "-b", bus_id.as_str()]) {
            Ok(_) => {
                log::info!("bound {bus_id} to usbip-host");
                Ok(())
            }
            Err(UsbipToolError::NotFound) => {
                log::error!("usbip command not found; is the usbip-utils package installed?");
                Err(UsbipToolError::NotFound)
            }
            Err(e @ UsbipToolError::NonZeroExit { .. }) => {
                log::warn!("usbip bind failed for {bus_id}: {e}");
                Err(e)
            }
        }
    }

    fn unbind(&self, bus_id: &BusId) {
        if let Err(e) = self.run(&["unbind", "-b", bus_id.as_str()]) {
            log::info!("usbip unbind for {bus_id}: {e}");
        }
    }

    fn device_name(&self, bus_id: &BusId) -> String {
        let path = self.sysfs_root.join(bus_id.as_str()).join("product");
        std::fs::read_to_string(&path)
            .map(|s| s.trim().to_owned())
            .unwrap_or_else(|_| bus_id.to_string())
    }

    fn is_tool_present(&self) -> bool {
        Command::new(&self.binary)
            .arg("version")
            .output()
            .is_ok()
    }

    fn attach(&self, host: &str, bus_id: &BusId) -> Result<(), UsbipToolError> {
        self.run(&["attach", "-r", host, "-b", bus_id.as_str()]).map(|_| ())
    }

    fn detach(&self, port: &str) -> Result<(), UsbipToolError> {
        self.run(&["detach", "-p", port]).map(|_| ())
    }

    fn list_remote(&self, host: &str) -> Result<Vec<BusId>, UsbipToolError> {
        let stdout = self.run(&["list", "-r", host])?;
        Ok(parse_remote_busids(&stdout))
    }

    fn attached_ports(&self) -> Vec<(String, BusId)> {
        match self.run(&["port"]) {
            Ok(stdout) => parse_attached_ports(&stdout),
            Err(_) => Vec::new(),
        }
    }
}

static REMOTE_BUSID_LINUX: Lazy<Regex> = Lazy::new(|| Regex::new(r"busid\s+([\d-]+(?:\.[\d-]+)*)").unwrap());
static REMOTE_BUSID_WINDOWS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*([\d-]+(?:\.[\d-]+)*)\s*:").unwrap());

/// Parses `usbip list -r` stdout for bus IDs, in either the Linux
/// (`busid <id>   :`) or Windows (`  <id> :`) form.
pub fn parse_remote_busids(stdout: &str) -> Vec<BusId> {
    let mut found = Vec::new();
    for line in stdout.lines() {
        if let Some(caps) = REMOTE_BUSID_LINUX.captures(line) {
            found.push(BusId::new(caps[1].to_owned()));
            continue;
        }
        if let Some(caps) = REMOTE_BUSID_WINDOWS.captures(line) {
            found.push(BusId::new(caps[1].to_owned()));
        }
    }
    found
}

static PORT_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Port\s+(\d+):").unwrap());
static PORT_LEGACY_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"->\s*usbip://[^/]+/([\d-]+(?:\.[\d-]+)*)").unwrap());
static PORT_MODERN_ONELINER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"port\s+(\d+):\s+<->\s+busid\s+([\d-]+(?:\.[\d-]+)*)").unwrap());

/// Parses `usbip port` stdout for the port -> bus_id mapping, handling
/// both the legacy `Port N:` block form and the modern `port N: <->
/// busid <id>` one-liner form.
pub fn parse_attached_ports(stdout: &str) -> Vec<(String, BusId)> {
    let mut mapping = Vec::new();
    if stdout.contains("Imported USB devices") {
        let mut current_port: Option<String> = None;
        for line in stdout.lines() {
            if let Some(caps) = PORT_HEADER.captures(line) {
                current_port = Some(caps[1].to_owned());
                continue;
            }
            if let (Some(port), Some(caps)) = (current_port.take(), PORT_LEGACY_TARGET.captures(line)) {
                mapping.push((port, BusId::new(caps[1].to_owned())));
            }
        }
    } else {
        for line in stdout.lines() {
            if let Some(caps) = PORT_MODERN_ONELINER.captures(line) {
                mapping.push((caps[1].to_owned(), BusId::new(caps[2].to_owned())));
            }
        }
    }
    mapping
}
