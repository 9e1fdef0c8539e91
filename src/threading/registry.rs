use crate::{
    config::DefectPolicy,
    threading::{barrier::SuspendBarrier, thread::ManagedThread},
    utils::{
        sync::{Arc, AtomicU64, Ordering},
        ManagedThreadId,
    },
};
use dashmap::DashMap;

// 0 is never handed out
static NEXT_GLOBAL_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Live thread control records, keyed by managed thread id.
///
/// Records are reference counted: removing one from the registry does not free
/// it while an initiator still holds an `Arc` to it.
#[derive(Debug)]
pub struct ThreadRegistry {
    threads: DashMap<ManagedThreadId, Arc<ManagedThread>>,
    barrier: Arc<SuspendBarrier>,
    defect_policy: DefectPolicy,
}

impl ThreadRegistry {
    pub fn new(barrier: Arc<SuspendBarrier>, defect_policy: DefectPolicy) -> Self {
        Self {
            threads: DashMap::new(),
            barrier,
            defect_policy,
        }
    }

    /// Creates a STARTING record with a fresh id and inserts it.
    pub fn register(&self, name: impl Into<String>) -> Arc<ManagedThread> {
        let id = ManagedThreadId::new(NEXT_GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(ManagedThread::new(
            id,
            name.into(),
            self.barrier.clone(),
            self.defect_policy,
        ));
        self.threads.insert(id, thread.clone());
        thread
    }

    pub fn unregister(&self, id: ManagedThreadId) -> Option<Arc<ManagedThread>> {
        self.threads.remove(&id).map(|(_, thread)| thread)
    }

    pub fn get(&self, id: ManagedThreadId) -> Option<Arc<ManagedThread>> {
        self.threads.get(&id).map(|entry| entry.value().clone())
    }

    /// All records, ordered by id. The map is not locked while the caller
    /// iterates.
    pub fn snapshot(&self) -> Vec<Arc<ManagedThread>> {
        let mut threads: Vec<_> = self.threads.iter().map(|e| e.value().clone()).collect();
        threads.sort_by_key(|t| t.id());
        threads
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threading::state::ThreadState;
    use std::thread;

    fn registry() -> ThreadRegistry {
        ThreadRegistry::new(Arc::new(SuspendBarrier::new()), DefectPolicy::Propagate)
    }

    #[test]
    fn test_register_lookup_remove() {
        let registry = registry();
        let a = registry.register("a");
        let b = registry.register("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.snapshot().unwrap().state, ThreadState::Starting);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(b.id()).unwrap().name(), "b");
        let ids: Vec<_> = registry.snapshot().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id()]);

        let removed = registry.unregister(a.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(registry.get(a.id()).is_none());
        assert!(registry.unregister(a.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|j| registry.register(format!("t{}-{}", i, j)).id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
        assert_eq!(registry.len(), 400);
    }
}
