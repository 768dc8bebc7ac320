//! Cache of parsed debug information, one entry per loaded module
//!
//! Entries are keyed by [`ModuleId`] (load bias plus path) so a module
//! unloaded and replaced by another one at the same addresses never hands
//! out the old module's data. The first request for a module parses it;
//! concurrent requests for the same module wait on the same entry and see
//! the one result, including a failed parse.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use log::debug;

use super::memory_maps::{LoadedModule, ModuleId, ModuleSource, ProcessModules};
use crate::domain::Result;
use crate::stats::{self, Counter};

/// Parses the debug information of one module
pub trait DebugInfoLoader: Send + Sync {
    type Handle: Send + Sync;

    /// # Errors
    /// Returns an error if the module has no usable debug information.
    fn load(&self, module: &LoadedModule) -> Result<Self::Handle>;
}

/// One cached module
pub struct ModuleCacheEntry<H> {
    module: LoadedModule,
    handle: OnceLock<Option<Arc<H>>>,
    valid: AtomicBool,
}

impl<H> ModuleCacheEntry<H> {
    #[must_use]
    pub fn module(&self) -> &LoadedModule {
        &self.module
    }

    /// False once the entry has been evicted
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

pub struct ModuleCache<L: DebugInfoLoader> {
    loader: L,
    source: Box<dyn ModuleSource>,
    entries: RwLock<HashMap<ModuleId, Arc<ModuleCacheEntry<L::Handle>>>>,
}

impl<L: DebugInfoLoader> ModuleCache<L> {
    /// Cache over the modules of this process
    pub fn new(loader: L) -> Self {
        Self::with_source(loader, Box::new(ProcessModules))
    }

    pub fn with_source(loader: L, source: Box<dyn ModuleSource>) -> Self {
        Self { loader, source, entries: RwLock::new(HashMap::new()) }
    }

    /// Handle for the module currently mapped at `addr`
    ///
    /// Returns the module even when it has no debug information, so callers
    /// can still report the module path.
    pub fn resolve(&self, addr: u64) -> Option<(LoadedModule, Option<Arc<L::Handle>>)> {
        let module = self.source.locate(addr)?;
        let handle = self.lookup_or_load(&module);
        Some((module, handle))
    }

    /// Parsed debug information for `module`, parsing it on first use
    ///
    /// `None` means the module has no usable debug information; that
    /// outcome is cached too.
    pub fn lookup_or_load(&self, module: &LoadedModule) -> Option<Arc<L::Handle>> {
        let cached = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&module.id)
            .cloned();

        let entry = if let Some(entry) = cached {
            stats::incr(Counter::CacheHits);
            entry
        } else {
            self.insert(module)
        };

        entry
            .handle
            .get_or_init(|| {
                stats::incr(Counter::CacheLoads);
                match self.loader.load(&entry.module) {
                    Ok(handle) => {
                        debug!("Loaded debug info for {}", entry.module.id);
                        Some(Arc::new(handle))
                    }
                    Err(e) => {
                        debug!("No debug info for {}: {e}", entry.module.id);
                        None
                    }
                }
            })
            .clone()
    }

    fn insert(&self, module: &LoadedModule) -> Arc<ModuleCacheEntry<L::Handle>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(&module.id) {
            // Another thread got here first
            return Arc::clone(entry);
        }

        // Whatever occupied these addresses before is gone
        let stale: Vec<ModuleId> = entries
            .iter()
            .filter(|(_, e)| e.module.overlaps(module))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(old) = entries.remove(&id) {
                debug!("Evicting {id}: replaced by {}", module.id);
                Self::retire(&old);
            }
        }

        let entry = Arc::new(ModuleCacheEntry {
            module: module.clone(),
            handle: OnceLock::new(),
            valid: AtomicBool::new(true),
        });
        entries.insert(module.id.clone(), Arc::clone(&entry));
        entry
    }

    fn retire(entry: &ModuleCacheEntry<L::Handle>) {
        entry.valid.store(false, Ordering::Release);
        stats::incr(Counter::CacheEvictions);
    }

    /// Drops the entry for `id`; returns true if there was one
    pub fn invalidate(&self, id: &ModuleId) -> bool {
        let removed = self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(id);
        match removed {
            Some(entry) => {
                debug!("Invalidated {id}");
                Self::retire(&entry);
                true
            }
            None => false,
        }
    }

    /// Drops entries for modules that are no longer loaded; returns how many
    pub fn prune(&self) -> usize {
        let loaded = self.source.loaded();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|id, entry| {
            let keep = loaded.iter().any(|m| &m.id == id);
            if !keep {
                Self::retire(entry);
            }
            keep
        });
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!("Pruned {pruned} unloaded modules from the debug info cache");
        }
        pruned
    }

    /// Number of cached modules
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached modules and whether each has debug information (`None` while
    /// still unparsed)
    pub fn status(&self) -> Vec<(ModuleId, Option<bool>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut status: Vec<_> =
            entries.iter().map(|(id, e)| (id.clone(), e.handle.get().map(Option::is_some))).collect();
        status.sort();
        status
    }
}
