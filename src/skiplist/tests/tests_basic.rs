//! Point operations on a single-threaded skip list.
//!
//! ## Coverage
//! - `set` / `get` round trips and misses
//! - first-writer-wins on duplicate keys
//! - hash function values and the reserved zero hash
//! - distinct keys sharing one hash
//! - index growth and `Display`
//!
//! ## See also
//! - [`tests_range`]: ordered traversal
//! - [`tests_concurrency`]: multi-threaded behavior

#[cfg(test)]
mod tests {
    use crate::skiplist::{MAX_HEIGHT, NodePool, SkipList, hash_key};

    #[test]
    fn test_set_then_get() {
        let list = SkipList::new().unwrap();
        assert!(list.set(b"a", b"1").unwrap());

        assert_eq!(list.get(b"a"), Some(&b"1"[..]));
        assert_eq!(list.get(b"b"), None);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_empty_list_misses() {
        let list = SkipList::new().unwrap();
        assert!(list.is_empty());
        assert_eq!(list.get(b"anything"), None);
        assert_eq!(list.get(b""), None);
        assert_eq!(list.iter().count(), 0);
    }

    /// # Scenario
    /// Set the same key twice with different values.
    ///
    /// # Expected behavior
    /// The second call reports no insert and the first value is kept.
    #[test]
    fn test_duplicate_set_keeps_first_value() {
        let list = SkipList::new().unwrap();
        assert!(list.set(b"k", b"x").unwrap());
        assert!(!list.set(b"k", b"y").unwrap());

        assert_eq!(list.get(b"k"), Some(&b"x"[..]));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_empty_value_is_a_live_value() {
        let list = SkipList::new().unwrap();
        list.set(b"k", b"").unwrap();
        assert_eq!(list.get(b"k"), Some(&b""[..]));
    }

    #[test]
    fn test_hash_matches_shift_add_formula() {
        assert_eq!(hash_key(b"a"), 97);

        let expected = (b'b' as u64).wrapping_add(97 * 65_599);
        assert_eq!(hash_key(b"ab"), expected);
    }

    #[test]
    fn test_zero_hash_is_reserved() {
        assert_eq!(hash_key(b""), 1);
        assert_eq!(hash_key(&[0, 0, 0]), 1);

        let list = SkipList::new().unwrap();
        list.set(&[0, 0], b"zeros").unwrap();
        assert_eq!(list.get(&[0, 0]), Some(&b"zeros"[..]));
        assert_eq!(list.get(&[0]), None);
    }

    /// # Scenario
    /// Insert enough keys that promotion almost surely builds several levels.
    ///
    /// # Expected behavior
    /// Height grows beyond one, stays under the cap, and every key is found.
    #[test]
    fn test_index_grows_with_inserts() {
        let list = SkipList::new().unwrap();
        for i in 0..5_000u32 {
            let key = format!("key-{i:05}");
            list.set(key.as_bytes(), &i.to_be_bytes()).unwrap();
        }

        assert!(list.height() > 1);
        assert!(list.height() <= MAX_HEIGHT);
        assert_eq!(list.len(), 5_000);
        for i in 0..5_000u32 {
            let key = format!("key-{i:05}");
            assert_eq!(list.get(key.as_bytes()), Some(&i.to_be_bytes()[..]));
        }
    }

    #[test]
    fn test_display_lists_base_entries() {
        let list = SkipList::new().unwrap();
        list.set(b"a", b"1").unwrap();
        list.set(b"b", b"2").unwrap();

        let out = list.to_string();
        let base = out.lines().last().unwrap();
        assert!(base.starts_with("L0:"));
        assert!(base.contains("a=1"));
        assert!(base.contains("b=2"));
    }

    /// # Scenario
    /// Build a list from the pool, fill it, recycle it, build another.
    ///
    /// # Expected behavior
    /// The second list starts empty and works normally on reused storage.
    #[test]
    fn test_pooled_lists_are_recycled_empty() {
        let pool = NodePool::new(2, 64);
        let list = pool.list().unwrap();
        for i in 0..200u32 {
            list.set(&i.to_be_bytes(), b"v").unwrap();
        }
        pool.recycle(list);
        assert_eq!(pool.parked(), 1);

        let list = pool.list().unwrap();
        assert_eq!(pool.parked(), 0);
        assert!(list.is_empty());
        assert_eq!(list.get(&7u32.to_be_bytes()), None);

        list.set(b"fresh", b"1").unwrap();
        assert_eq!(list.get(b"fresh"), Some(&b"1"[..]));
    }

    /// # Scenario
    /// `"\x00"` hashes to zero, which is remapped to one, the hash of
    /// `"\x01"`. Both keys are set, read, iterated, and then one is removed.
    ///
    /// # Expected behavior
    /// The two keys never alias: each keeps its own value, iteration yields
    /// both in raw-key order, and removing one leaves the other readable.
    #[test]
    fn test_colliding_hashes_keep_keys_apart() {
        let (low, high) = (&b"\x00"[..], &b"\x01"[..]);
        assert_eq!(hash_key(low), hash_key(high));

        let list = SkipList::new().unwrap();
        assert!(list.set(high, b"high").unwrap());
        assert!(list.set(low, b"low").unwrap());
        assert!(list.set(b"other", b"x").unwrap());
        assert!(!list.set(low, b"again").unwrap());

        assert_eq!(list.get(low), Some(&b"low"[..]));
        assert_eq!(list.get(high), Some(&b"high"[..]));
        assert_eq!(list.len(), 3);

        let colliding: Vec<(&[u8], &[u8])> = list
            .iter()
            .filter(|(k, _)| hash_key(k) == hash_key(low))
            .collect();
        assert_eq!(colliding, vec![(low, &b"low"[..]), (high, &b"high"[..])]);

        assert!(list.remove(low));
        assert_eq!(list.get(low), None);
        assert_eq!(list.get(high), Some(&b"high"[..]));
        assert_eq!(list.len(), 2);

        assert!(list.set(low, b"back").unwrap());
        assert_eq!(list.get(low), Some(&b"back"[..]));
        assert_eq!(list.get(high), Some(&b"high"[..]));
    }
}
