//! Control plane for exporting USB devices over `usbip`: a host-side
//! Device Assignment Daemon and a symmetric Client Agent.
//!
//! The daemon reacts to USB plug/unplug events on a watched set of
//! root-hub ports, ensures each watched device is exported via the
//! host's `usbip` binding, holds persistent TCP control connections to
//! named remote clients, and drives convergence between a desired-state
//! assignment map and actual attach/detach outcomes.

pub mod client_agent;
pub mod control;
pub mod engine;
pub mod events;
pub mod ids;
pub mod registry;
pub mod session;
pub mod store;
pub mod usbip_tool;
pub mod watcher;

pub use engine::{Engine, EngineHandle, Outcome};
pub use ids::{BusId, ClientId};
