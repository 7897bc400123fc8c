//! Per-machine event log.
//!
//! Best-effort operator-facing diagnostic state. Nothing here may
//! influence how a request is answered; losing events is fine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dhcp4::Mac;
use tracing::info;

/// How far along the boot flow a machine has come.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// Answered the machine's DHCP discovery.
    Dhcp,
    /// Answered the machine's PXE boot-server request.
    Pxe,
    /// Sent the machine an iPXE binary over TFTP.
    Tftp,
    /// Sent the machine its boot script.
    IpxeScript,
    /// Sent the machine a kernel.
    Kernel,
    /// Sent the machine an initrd.
    Initrd,
    /// The machine reported that it is booting.
    Booted,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::Dhcp => "dhcp",
            MachineState::Pxe => "pxe",
            MachineState::Tftp => "tftp",
            MachineState::IpxeScript => "ipxe-script",
            MachineState::Kernel => "kernel",
            MachineState::Initrd => "initrd",
            MachineState::Booted => "booted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct MachineEvent {
    pub at: DateTime<Utc>,
    pub state: MachineState,
    pub message: String,
}

// Old events get dropped past this point; the interesting part of a boot
// is always the tail.
const MAX_EVENTS_PER_MACHINE: usize = 128;

/// In-memory per-MAC event history behind one coarse lock.
#[derive(Default)]
pub struct MachineEvents {
    events: Mutex<HashMap<Mac, Vec<MachineEvent>>>,
}

impl MachineEvents {
    pub fn new() -> Self {
        MachineEvents::default()
    }

    pub fn record(&self, mac: Mac, state: MachineState, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {}: {}", state, mac, message);
        let Ok(mut events) = self.events.lock() else {
            // Contention or poisoning just costs us the event.
            return;
        };
        let history = events.entry(mac).or_default();
        if history.len() == MAX_EVENTS_PER_MACHINE {
            history.remove(0);
        }
        history.push(MachineEvent {
            at: Utc::now(),
            state,
            message,
        });
    }

    /// The recorded history of one machine, oldest first.
    pub fn snapshot(&self, mac: Mac) -> Vec<MachineEvent> {
        self.events
            .lock()
            .map(|events| events.get(&mac).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots() {
        let events = MachineEvents::new();
        let mac: Mac = "01:02:03:04:05:06".parse().unwrap();
        events.record(mac, MachineState::Dhcp, "offered");
        events.record(mac, MachineState::Booted, "done");

        let history = events.snapshot(mac);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].state, MachineState::Dhcp);
        assert_eq!(history[1].state, MachineState::Booted);

        let other: Mac = "ff:ff:ff:ff:ff:ff".parse().unwrap();
        assert!(events.snapshot(other).is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let events = MachineEvents::new();
        let mac: Mac = "01:02:03:04:05:06".parse().unwrap();
        for i in 0..(MAX_EVENTS_PER_MACHINE + 10) {
            events.record(mac, MachineState::Kernel, format!("event {}", i));
        }
        let history = events.snapshot(mac);
        assert_eq!(history.len(), MAX_EVENTS_PER_MACHINE);
        assert_eq!(history.last().unwrap().message, "event 137");
    }
}
