//! Connectivity tracking
//!
//! Single source of truth for "can the client currently reach the network".
//! The host integration feeds connectivity transitions in through
//! [`NetworkMonitor::set_online`]; there is no polling. Listeners fire
//! synchronously, in registration order, and a panicking listener never
//! prevents the remaining listeners from running.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by listener registration, used to unregister.
pub type ListenerId = u64;

type Listener = Arc<dyn Fn() + Send + Sync>;

pub struct NetworkMonitor {
    online: AtomicBool,
    next_id: AtomicU64,
    on_online: Mutex<Vec<(ListenerId, Listener)>>,
    on_offline: Mutex<Vec<(ListenerId, Listener)>>,
}

impl NetworkMonitor {
    /// Create a monitor seeded with the host's current connectivity signal.
    pub fn new(initially_online: bool) -> Self {
        Self {
            online: AtomicBool::new(initially_online),
            next_id: AtomicU64::new(1),
            on_online: Mutex::new(Vec::new()),
            on_offline: Mutex::new(Vec::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn on_online(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.register(&self.on_online, listener)
    }

    pub fn on_offline(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
        self.register(&self.on_offline, listener)
    }

    pub fn remove_online_listener(&self, id: ListenerId) {
        self.on_online
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn remove_offline_listener(&self, id: ListenerId) {
        self.on_offline
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Host connectivity signal entry point. Listeners only fire on an
    /// actual transition.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return;
        }

        tracing::info!(online, "connectivity changed");

        let registry = if online {
            &self.on_online
        } else {
            &self.on_offline
        };
        // Snapshot under the lock, dispatch outside it, so a listener may
        // register or unregister without deadlocking.
        let listeners: Vec<(ListenerId, Listener)> = registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::warn!(listener = id, "connectivity listener panicked");
            }
        }
    }

    fn register(
        &self,
        registry: &Mutex<Vec<(ListenerId, Listener)>>,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(listener)));
        id
    }
}
