//! Tracks per-interface reachability and emits precedence-resolved edges
//! (spec.md §4.4).

use std::collections::HashMap;

use transit_core::{ConnectivityStatus, InterfaceId, WanSubType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Up(InterfaceId),
    Down(InterfaceId),
}

pub struct InterfaceMonitor {
    raw: HashMap<InterfaceId, ConnectivityStatus>,
    wan_subtype: WanSubType,
}

impl InterfaceMonitor {
    pub fn new() -> Self {
        let mut raw = HashMap::new();
        for i in InterfaceId::NAMED {
            raw.insert(i, ConnectivityStatus::Unknown);
        }
        Self {
            raw,
            wan_subtype: WanSubType::Unknown,
        }
    }

    pub fn wan_subtype(&self) -> WanSubType {
        self.wan_subtype
    }

    pub fn set_wan_subtype(&mut self, sub: WanSubType) {
        self.wan_subtype = sub;
    }

    /// Effective status after applying precedence: wired overrides wifi and
    /// wan; wifi overrides wan; btpan is never overridden.
    pub fn effective_status(&self, iface: InterfaceId) -> ConnectivityStatus {
        use InterfaceId::*;
        let raw = *self.raw.get(&iface).unwrap_or(&ConnectivityStatus::Unknown);
        if raw != ConnectivityStatus::Connected {
            return raw;
        }
        let wired_up = self.raw.get(&Wired) == Some(&ConnectivityStatus::Connected);
        let wifi_up = self.raw.get(&Wifi) == Some(&ConnectivityStatus::Connected);
        match iface {
            Wifi if wired_up => ConnectivityStatus::Disconnected,
            Wan if wired_up || wifi_up => ConnectivityStatus::Disconnected,
            _ => ConnectivityStatus::Connected,
        }
    }

    /// Record a raw status change and return every effective-status edge it
    /// produces — a wired transition can flip wifi's or wan's *effective*
    /// status without their raw status changing.
    pub fn update(&mut self, iface: InterfaceId, status: ConnectivityStatus) -> Vec<Edge> {
        let before: HashMap<InterfaceId, ConnectivityStatus> = InterfaceId::NAMED
            .iter()
            .map(|i| (*i, self.effective_status(*i)))
            .collect();
        self.raw.insert(iface, status);

        let mut edges = Vec::new();
        for i in InterfaceId::NAMED {
            let was = before[&i];
            let now = self.effective_status(i);
            if was == now {
                continue;
            }
            edges.push(if now == ConnectivityStatus::Connected {
                Edge::Up(i)
            } else {
                Edge::Down(i)
            });
        }
        edges
    }

    /// Highest-precedence connected interface, or `None`.
    pub fn best_connected(&self) -> Option<InterfaceId> {
        [
            InterfaceId::Wired,
            InterfaceId::Wifi,
            InterfaceId::Wan,
            InterfaceId::Btpan,
        ]
        .into_iter()
        .find(|i| self.effective_status(*i) == ConnectivityStatus::Connected)
    }

    pub fn all_disconnected(&self) -> bool {
        InterfaceId::NAMED
            .iter()
            .all(|i| self.effective_status(*i) != ConnectivityStatus::Connected)
    }
}

impl Default for InterfaceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
