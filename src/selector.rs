//! Round-robin target selection keyed by listening port.
//!
//! Applications live in an arena addressed by index. The port lookup maps a
//! listening port to its application's slot, and each slot carries its own
//! cursor lock so rotations for different applications never contend.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

use crate::app::{AppRegistry, Application};
use crate::error::ProxyError;

struct Slot {
    app: Application,
    cursor: Mutex<usize>,
}

impl Slot {
    fn next_target(&self) -> Option<&str> {
        if self.app.targets.is_empty() {
            return None;
        }

        // A panic elsewhere cannot leave the cursor in a broken state, so a
        // poisoned lock is still safe to use.
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor % self.app.targets.len();
        *cursor = cursor.wrapping_add(1);
        drop(cursor);

        Some(self.app.targets[index].as_str())
    }
}

pub struct TargetSelector {
    slots: Vec<Slot>,
    lookup: HashMap<u16, usize>,
}

impl TargetSelector {
    /// Builds the port lookup. Fails if two applications claim the same port.
    pub fn new(registry: AppRegistry) -> Result<Self, ProxyError> {
        let mut slots = Vec::with_capacity(registry.len());
        let mut lookup: HashMap<u16, usize> = HashMap::new();

        for (index, app) in registry.into_iter().enumerate() {
            for &port in &app.ports {
                match lookup.entry(port) {
                    Entry::Occupied(existing) => {
                        let first: &Slot = &slots[*existing.get()];
                        return Err(ProxyError::DuplicatePort {
                            port,
                            first: first.app.name.clone(),
                            second: app.name.clone(),
                        });
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(index);
                    }
                }
            }
            slots.push(Slot {
                app,
                cursor: Mutex::new(0),
            });
        }

        debug!(apps = slots.len(), ports = lookup.len(), "Built port lookup");

        Ok(Self { slots, lookup })
    }

    /// Returns the next backend for `port` in round-robin order.
    pub fn resolve(&self, port: u16) -> Result<String, ProxyError> {
        let Some(slot) = self.lookup.get(&port).map(|&index| &self.slots[index]) else {
            warn!(port, "No application owns this port");
            return Err(ProxyError::TargetUnavailable { port });
        };

        match slot.next_target() {
            Some(target) => Ok(target.to_string()),
            None => {
                warn!(app = %slot.app.name, port, "Application has no targets");
                Err(ProxyError::TargetUnavailable { port })
            }
        }
    }

    /// Name of the application listening on `port`, if any.
    #[must_use]
    pub fn application(&self, port: u16) -> Option<&str> {
        self.lookup
            .get(&port)
            .map(|&index| self.slots[index].app.name.as_str())
    }

    /// Every `(application name, port)` pair, in registry order and ascending port order.
    #[must_use]
    pub fn ports(&self) -> Vec<(String, u16)> {
        self.slots
            .iter()
            .flat_map(|slot| {
                slot.app
                    .ports
                    .iter()
                    .map(|&port| (slot.app.name.clone(), port))
            })
            .collect()
    }
}
