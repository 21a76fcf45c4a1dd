use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use svobake_world::ChunkKey;

/// One mutex per chunk key, so at most one Load-Merge-Commit per chunk runs
/// at a time while different chunks proceed in parallel.
#[derive(Default)]
pub struct ChunkLocks {
    locks: Mutex<HashMap<ChunkKey, Arc<Mutex<()>>>>,
}

impl ChunkLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: ChunkKey) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key).or_default())
    }

    /// Runs `f` while holding `key`'s lock.
    pub fn with<R>(&self, key: ChunkKey, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn same_key_is_serialized() {
        let locks = Arc::new(ChunkLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let key = ChunkKey {
            region: 1,
            chunk: 2,
        };
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, peak) = (locks.clone(), inside.clone(), peak.clone());
                std::thread::spawn(move || {
                    locks.with(key, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn different_keys_do_not_block() {
        let locks = ChunkLocks::new();
        let a = ChunkKey {
            region: 0,
            chunk: 0,
        };
        let b = ChunkKey {
            region: 0,
            chunk: 1,
        };
        // Nested acquisition would deadlock if keys shared a lock.
        let v = locks.with(a, || locks.with(b, || 7));
        assert_eq!(v, 7);
    }
}
