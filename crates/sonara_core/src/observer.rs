//! Process-wide observer bus
//!
//! Subsystems publish state-change events; registered subscribers (the
//! device list, each client's notification forwarder) receive them
//! synchronously on the main thread. Duplicate or coalesced notifications
//! are allowed, only the latest value matters to receivers.

use std::cell::RefCell;
use std::rc::Rc;

use sonara_proto::{Direction, NodeId};

/// Every event the bus can carry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObserverEvent {
    OutputVolumeChanged {
        volume: i32,
    },
    OutputMuteChanged {
        muted: bool,
        user_muted: bool,
        mute_locked: bool,
    },
    CaptureGainChanged {
        gain: i32,
    },
    CaptureMuteChanged {
        muted: bool,
        mute_locked: bool,
    },
    NodesChanged,
    ActiveNodeChanged {
        direction: Direction,
        node_id: NodeId,
    },
    OutputNodeVolumeChanged {
        node_id: NodeId,
        volume: i32,
    },
    NodeLeftRightSwappedChanged {
        node_id: NodeId,
        swapped: bool,
    },
    InputNodeGainChanged {
        node_id: NodeId,
        gain: i32,
    },
    SuspendChanged {
        suspended: bool,
    },
    NumActiveStreamsChanged {
        direction: Direction,
        num_active_streams: u32,
    },
}

/// A subscriber on the bus. Implementations filter the events they care
/// about themselves.
pub trait Observer {
    fn notify(&self, event: &ObserverEvent);
}

struct Registration {
    id: u64,
    observer: Rc<dyn Observer>,
}

/// The registry. Main-thread only; dispatch snapshots the subscriber list
/// so handlers may register or remove observers while being notified.
pub struct ObserverRegistry {
    inner: RefCell<Vec<Registration>>,
    next_id: RefCell<u64>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            inner: RefCell::new(Vec::new()),
            next_id: RefCell::new(1),
        }
    }

    pub fn add(&self, observer: Rc<dyn Observer>) -> u64 {
        let mut next = self.next_id.borrow_mut();
        let id = *next;
        *next += 1;
        self.inner.borrow_mut().push(Registration { id, observer });
        id
    }

    pub fn remove(&self, id: u64) {
        self.inner.borrow_mut().retain(|r| r.id != id);
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn notify(&self, event: &ObserverEvent) {
        // Snapshot first: a handler may mutate the registry.
        let observers: Vec<Rc<dyn Observer>> = self
            .inner
            .borrow()
            .iter()
            .map(|r| Rc::clone(&r.observer))
            .collect();
        for observer in observers {
            observer.notify(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counter {
        count: Cell<u32>,
        last_volume: Cell<i32>,
    }

    impl Observer for Counter {
        fn notify(&self, event: &ObserverEvent) {
            self.count.set(self.count.get() + 1);
            if let ObserverEvent::OutputVolumeChanged { volume } = event {
                self.last_volume.set(*volume);
            }
        }
    }

    fn counter() -> Rc<Counter> {
        Rc::new(Counter {
            count: Cell::new(0),
            last_volume: Cell::new(-1),
        })
    }

    #[test]
    fn test_notify_reaches_all() {
        let registry = ObserverRegistry::new();
        let a = counter();
        let b = counter();
        registry.add(a.clone());
        registry.add(b.clone());

        registry.notify(&ObserverEvent::OutputVolumeChanged { volume: 42 });
        assert_eq!(a.count.get(), 1);
        assert_eq!(b.count.get(), 1);
        assert_eq!(a.last_volume.get(), 42);
    }

    #[test]
    fn test_remove_stops_delivery() {
        let registry = ObserverRegistry::new();
        let a = counter();
        let id = registry.add(a.clone());
        registry.remove(id);
        registry.notify(&ObserverEvent::NodesChanged);
        assert_eq!(a.count.get(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handler_may_mutate_registry() {
        struct SelfRemover {
            registry: Rc<ObserverRegistry>,
            id: Cell<u64>,
        }
        impl Observer for SelfRemover {
            fn notify(&self, _event: &ObserverEvent) {
                self.registry.remove(self.id.get());
            }
        }

        let registry = Rc::new(ObserverRegistry::new());
        let remover = Rc::new(SelfRemover {
            registry: Rc::clone(&registry),
            id: Cell::new(0),
        });
        let id = registry.add(remover.clone());
        remover.id.set(id);

        // Must not panic on re-entrant mutation.
        registry.notify(&ObserverEvent::NodesChanged);
        assert!(registry.is_empty());
    }
}
