//! Process-wide compiled-variant cache.
//!
//! Each key moves through `Uncompiled -> Compiling -> Compiled`. The
//! `Compiling` state is a per-key slot mutex, so at most one compile runs per
//! key while different keys compile in parallel. A failed compile leaves the
//! key uncompiled and the next caller retries.

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::debug;

use crate::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    Hit,
    Compiled,
}

#[derive(Debug)]
pub struct CompileCache<T> {
    entries: RwLock<FxHashMap<CacheKey, Arc<T>>>,
    slots: Mutex<FxHashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl<T> Default for CompileCache<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            slots: Mutex::new(FxHashMap::default()),
        }
    }
}

// A panic inside a compile callback never leaves a half-written entry behind,
// so a poisoned lock still guards consistent data.
fn recover<G>(result: Result<G, PoisonError<G>>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl<T> CompileCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Arc<T>> {
        recover(self.entries.read()).get(key).cloned()
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        recover(self.entries.read()).contains_key(key)
    }

    /// Number of compiled variants.
    #[must_use]
    pub fn len(&self) -> usize {
        recover(self.entries.read()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every compiled variant. Compiles already in flight still finish
    /// and publish their result; their slots survive so later callers for the
    /// same key keep waiting on them.
    pub fn clear(&self) {
        recover(self.entries.write()).clear();
        // The map holds one reference; any other is a caller inside the slot.
        recover(self.slots.lock()).retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    fn slot(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        recover(self.slots.lock())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Returns the variant for `key`, running `compile` if there is none.
    /// Concurrent callers with the same key wait for the single compile in
    /// flight instead of starting their own.
    pub fn get_or_try_compile<E, F>(
        &self,
        key: &CacheKey,
        compile: F,
    ) -> Result<(Arc<T>, CacheLookup), E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(hit) = self.get(key) {
            return Ok((hit, CacheLookup::Hit));
        }

        let slot = self.slot(key);
        let _compiling: MutexGuard<'_, ()> = recover(slot.lock());
        if let Some(hit) = self.get(key) {
            debug!(key = %key.digest_hex(), "compiled by a concurrent caller");
            return Ok((hit, CacheLookup::Hit));
        }

        debug!(key = %key.digest_hex(), "compiling new variant");
        let compiled = Arc::new(compile()?);
        recover(self.entries.write()).insert(key.clone(), Arc::clone(&compiled));
        Ok((compiled, CacheLookup::Compiled))
    }
}
