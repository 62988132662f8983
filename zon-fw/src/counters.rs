use crate::module::Counter;

/// Cumulative counters of the rules of a chain, indexed like the rules.
///
/// The live modules only count since the last fetch and start from zero
/// with every new generation, so each fetch is added to the cached value.
#[derive(Default, Debug)]
pub struct CounterCache {
    entries: Vec<Option<Counter>>,
    default: Option<Counter>,
}

impl CounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn resize(&mut self, len: usize) {
        self.entries.resize(len, None);
    }

    /// Seeds the entry with `live` the first time, adds it afterwards.
    pub fn reconcile(&mut self, id: u32, live: Counter) -> Counter {
        let idx = id as usize;
        if self.entries.len() <= idx {
            self.entries.resize(idx + 1, None);
        }
        let entry = self.entries[idx].get_or_insert_with(Counter::default);
        entry.add(live);
        *entry
    }

    pub fn reconcile_default(&mut self, live: Counter) -> Counter {
        let entry = self.default.get_or_insert_with(Counter::default);
        entry.add(live);
        *entry
    }

    /// Drops the entry of a removed rule, the following ones move down
    /// with their rules.
    pub fn remove(&mut self, id: u32) {
        if (id as usize) < self.entries.len() {
            self.entries.remove(id as usize);
        }
    }

    /// Drops the rule counters, the default action ones are kept.
    pub fn clear_rules(&mut self) {
        self.entries.clear();
    }

    /// Zeroes every counter, the entries stay aligned with the rules.
    pub fn reset(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
        self.default = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached(cache: &CounterCache, id: u32) -> Option<Counter> {
        cache.entries.get(id as usize).copied().flatten()
    }

    #[test]
    fn seed_then_add() {
        let mut cache = CounterCache::new();
        assert!(cached(&cache, 2).is_none());
        assert_eq!(cache.reconcile(2, Counter::new(3, 300)), Counter::new(3, 300));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.reconcile(2, Counter::new(1, 10)), Counter::new(4, 310));
        assert_eq!(cache.reconcile(2, Counter::default()), Counter::new(4, 310));
        assert!(cached(&cache, 0).is_none());
    }

    #[test]
    fn remove_shifts_entries() {
        let mut cache = CounterCache::new();
        cache.resize(4);
        for id in 0..4 {
            cache.reconcile(id, Counter::new(id as u64 + 1, 0));
        }
        cache.remove(1);
        assert_eq!(cache.len(), 3);
        assert_eq!(cached(&cache, 1), Some(Counter::new(3, 0)));
        assert_eq!(cached(&cache, 2), Some(Counter::new(4, 0)));

        cache.reset();
        assert_eq!(cache.len(), 3);
        assert!(cached(&cache, 1).is_none());
    }

    #[test]
    fn default_counters_accumulate() {
        let mut cache = CounterCache::new();
        cache.reconcile(0, Counter::new(5, 5));
        cache.reconcile_default(Counter::new(1, 64));
        assert_eq!(cache.reconcile_default(Counter::new(1, 64)), Counter::new(2, 128));
        cache.clear_rules();
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.reconcile_default(Counter::default()), Counter::new(2, 128));
        cache.reset();
        assert_eq!(cache.reconcile_default(Counter::default()), Counter::default());
    }
}
