//! Consumer groups: sets of consumers bound to devices that become active or
//! inactive together (e.g. application foreground/background).

use log::debug;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Identity of one consumer of device output
pub type ConsumerId = Uuid;

/// Receives activation changes of consumer groups.
pub trait GroupStateListener: Send + Sync {
    fn on_group_active(&self, group: &ConsumerGroup);
    fn on_group_inactive(&self, group: &ConsumerGroup);
}

/// Consumers grouped by target device id.
pub struct ConsumerGroup {
    uuid: Uuid,
    devices: Mutex<BTreeMap<String, HashSet<ConsumerId>>>,
    listeners: Mutex<Vec<Arc<dyn GroupStateListener>>>,
    active: AtomicBool,
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("uuid", &self.uuid)
            .field("devices", &self.device_consumers().len())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Default for ConsumerGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerGroup {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            devices: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Bind `consumer` to `device_id`.
    pub fn add_consumer(&self, device_id: impl Into<String>, consumer: ConsumerId) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.into())
            .or_default()
            .insert(consumer);
    }

    /// Unbind `consumer` from every device. Returns true if it was bound anywhere.
    pub fn remove_consumer(&self, consumer: ConsumerId) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let mut found = false;
        for set in devices.values_mut() {
            found |= set.remove(&consumer);
        }
        devices.retain(|_, set| !set.is_empty());
        found
    }

    /// Snapshot of device id → consumers
    pub fn device_consumers(&self) -> BTreeMap<String, HashSet<ConsumerId>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupStateListener>) {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).push(listener);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Activate the group and notify listeners. No-op if already active.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("ConsumerGroup {} active", self.uuid);
        for listener in self.listeners_snapshot() {
            listener.on_group_active(self);
        }
    }

    /// Deactivate the group and notify listeners. No-op if already inactive.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("ConsumerGroup {} inactive", self.uuid);
        for listener in self.listeners_snapshot() {
            listener.on_group_inactive(self);
        }
    }

    // Listeners run without the listener lock so they may touch the group
    fn listeners_snapshot(&self) -> Vec<Arc<dyn GroupStateListener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
