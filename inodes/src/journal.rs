//! Fire-and-forget change events consumed by the mount's journal.
//!
//! Events are emitted after every lock for the originating operation has
//! been released, but before any dependent operation can take its locks,
//! so subscribers observe changes in a consistent order.

use bstr::BString;
use parking_lot::Mutex;

/// A user-visible change to the working copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEvent {
    Created { path: BString },
    Removed { path: BString },
    Renamed { from: BString, to: BString },
    /// A rename that replaced an existing destination.
    Replaced { from: BString, to: BString },
}

pub trait Journal: Send + Sync {
    fn record(&self, event: JournalEvent);
}

/// Discards every event.
#[derive(Default)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn record(&self, _event: JournalEvent) {}
}

/// Collects events in memory, for tests.
#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<JournalEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn events(&self) -> Vec<JournalEvent> {
        self.events.lock().clone()
    }
}

impl Journal for MemoryJournal {
    fn record(&self, event: JournalEvent) {
        self.events.lock().push(event);
    }
}
