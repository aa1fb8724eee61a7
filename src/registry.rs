//! In-memory authoritative state of exported devices.

use std::collections::{HashMap, HashSet};

use crate::ids::{BusId, ClientId};

/// A snapshot of one exported device, suitable for returning to callers
/// (the Control API Adapter, tests) without holding a reference into the
/// registry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceSnapshot {
    pub bus_id: BusId,
    pub name: String,
    pub assigned_to: Option<ClientId>,
    #[serde(rename = "in_use")]
    pub in_use_by: Option<ClientId>,
}

/// Authoritative in-memory state: which bus IDs are exported, their
/// display names, and who currently has each in use.
///
/// Invariants (see spec §3):
/// 1. `in_use_by(B)` is `Some` implies `B` is exported.
/// 2. At most one client is `in_use_by` for any bus ID (trivially true:
///    `in_use` is a map, not a multimap).
/// 3. A bus ID leaves `exported` only via `remove` or a completed
///    force-free cycle.
#[derive(Debug, Default)]
pub struct Registry {
    exported: HashSet<BusId>,
    names: HashMap<BusId, String>,
    in_use: HashMap<BusId, ClientId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_exported(&self, bus_id: &BusId) -> bool {
        self.exported.contains(bus_id)
    }

    pub fn mark_exported(&mut self, bus_id: BusId, name: String) {
        self.names.insert(bus_id.clone(), name);
        self.exported.insert(bus_id);
    }

    /// Removes a bus ID from the exported set, clearing its name and
    /// in-use entry. Returns the previous in-use client, if any.
    pub fn remove(&mut self, bus_id: &BusId) -> Option<ClientId> {
        self.exported.remove(bus_id);
        self.names.remove(bus_id);
        self.in_use.remove(bus_id)
    }

    pub fn name(&self, bus_id: &BusId) -> Option<&str> {
        self.names.get(bus_id).map(String::as_str)
    }

    pub fn in_use_by(&self, bus_id: &BusId) -> Option<&ClientId> {
        self.in_use.get(bus_id)
    }

    pub fn mark_in_use(&mut self, bus_id: BusId, client_id: ClientId) {
        self.in_use.insert(bus_id, client_id);
    }

    pub fn clear_in_use(&mut self, bus_id: &BusId) -> Option<ClientId> {
        self.in_use.remove(bus_id)
    }

    /// Clears every device currently in use by `client_id`, returning
    /// the affected bus IDs.
    pub fn clear_in_use_for_client(&mut self, client_id: &ClientId) -> Vec<BusId> {
        let affected: Vec<BusId> = self
            .in_use
            .iter()
            .filter(|(_, c)| *c == client_id)
            .map(|(b, _)| b.clone())
            .collect();
        for bus_id in &affected {
            self.in_use.remove(bus_id);
        }
        affected
    }

    pub fn exported_bus_ids(&self) -> impl Iterator<Item = &BusId> {
        self.exported.iter()
    }

    pub fn count_in_use_by(&self, client_id: &ClientId) -> usize {
        self.in_use.values().filter(|c| *c == client_id).count()
    }
}
