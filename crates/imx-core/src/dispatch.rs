//! Command dispatch registry: maps a numeric command to a handler plus the
//! context it should run with.
//!
//! Handlers are registered at startup and looked up once per message, so the
//! table sits behind a reader-writer lock that lets lookups proceed in
//! parallel. The handler and context types are generic; callers pick a
//! function-pointer or `Arc<dyn Fn>` handler and a typed context.

use parking_lot::RwLock;
use std::collections::HashMap;

/// A registered handler and its context.
#[derive(Debug, Clone)]
pub struct Entry<H, C> {
    pub handler: H,
    pub ctx: C,
}

/// Command → handler table.
pub struct Registry<H, C> {
    entries: RwLock<HashMap<u32, Entry<H, C>>>,
}

impl<H: Clone, C: Clone> Registry<H, C> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `cmd`. A later registration for the same
    /// command replaces the earlier one; returns `true` when that happened.
    pub fn register(&self, cmd: u32, handler: H, ctx: C) -> bool {
        self.entries
            .write()
            .insert(cmd, Entry { handler, ctx })
            .is_some()
    }

    /// Look up the entry for `cmd`.
    pub fn lookup(&self, cmd: u32) -> Option<Entry<H, C>> {
        self.entries.read().get(&cmd).cloned()
    }

    pub fn contains(&self, cmd: u32) -> bool {
        self.entries.read().contains_key(&cmd)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<H: Clone, C: Clone> Default for Registry<H, C> {
    fn default() -> Self {
        Self::new()
    }
}
