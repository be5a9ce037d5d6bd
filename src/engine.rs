use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::keys::Keys;
use crate::records::JobRecords;
use crate::store::Store;

/// Everything a role needs to talk to the shared store: the store itself, key
/// names, tuning, and the clock. Cheap to clone; every component holds one.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    keys: Keys,
    settings: Settings,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        Self {
            store,
            keys: Keys::new(settings.namespace.clone()),
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn records(&self) -> JobRecords {
        JobRecords::new(self.clone())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("namespace", &self.keys.namespace())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
