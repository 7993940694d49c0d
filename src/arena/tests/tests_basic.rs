//! Arena allocation, handle resolution, and growth tests.
//!
//! ## See also
//! - [`tests_pool`]: recycling arenas through a `Pool`

#[cfg(test)]
mod tests {
    use crate::arena::{Arena, MAX_HANDLES};
    use std::sync::Arc;
    use std::thread;

    /// # Scenario
    /// Allocate a handful of values and resolve them.
    ///
    /// # Expected behavior
    /// Handles are dense from zero and resolve to the stored values.
    #[test]
    fn test_alloc_and_get() {
        let arena = Arena::with_capacity(4);
        let a = arena.alloc("a").unwrap();
        let b = arena.alloc("b").unwrap();

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_unallocated_handles_resolve_to_none() {
        let arena: Arena<u64> = Arena::with_capacity(16);
        assert!(arena.is_empty());
        assert_eq!(arena.get(0), None);
        assert_eq!(arena.get(1_000_000), None);
        assert_eq!(arena.get(MAX_HANDLES), None);
    }

    /// # Scenario
    /// Allocate past the first segment several times over.
    ///
    /// # Expected behavior
    /// Capacity doubles per new segment and earlier handles keep resolving.
    #[test]
    fn test_grows_by_doubling() {
        let arena = Arena::with_capacity(16);
        assert_eq!(arena.capacity(), 16);

        for i in 0..100u64 {
            let h = arena.alloc(i).unwrap();
            assert_eq!(h as u64, i);
        }

        // 16 + 32 + 64 = 112 >= 100
        assert_eq!(arena.capacity(), 112);
        for i in 0..100u32 {
            assert_eq!(arena.get(i), Some(&(i as u64)));
        }
    }

    #[test]
    fn test_initial_capacity_rounds_to_power_of_two() {
        let arena: Arena<u8> = Arena::with_capacity(100);
        assert_eq!(arena.capacity(), 128);
    }

    #[test]
    fn test_reset_clears_slots_and_keeps_segments() {
        let mut arena = Arena::with_capacity(16);
        for i in 0..40u32 {
            arena.alloc(i).unwrap();
        }
        let capacity = arena.capacity();

        arena.reset();

        assert!(arena.is_empty());
        assert_eq!(arena.get(0), None);
        assert_eq!(arena.capacity(), capacity);

        let h = arena.alloc(7).unwrap();
        assert_eq!(h, 0);
        assert_eq!(arena.get(h), Some(&7));
    }

    /// # Scenario
    /// Eight threads allocate concurrently, crossing several growth points.
    ///
    /// # Expected behavior
    /// Every handle is unique and resolves to the value its thread stored.
    #[test]
    fn test_concurrent_alloc_yields_unique_handles() {
        let arena = Arc::new(Arena::with_capacity(16));

        let mut handles = Vec::new();
        for t in 0..8u64 {
            let arena = Arc::clone(&arena);
            handles.push(thread::spawn(move || {
                (0..500u64)
                    .map(|i| {
                        let v = t * 1_000 + i;
                        (arena.alloc(v).unwrap(), v)
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for (h, v) in handle.join().unwrap() {
                assert!(seen.insert(h), "duplicate handle {h}");
                assert_eq!(arena.get(h), Some(&v));
            }
        }
        assert_eq!(arena.len(), 4_000);
    }
}
