/// Room-keyed state split across independently locked shards.
///
/// Every room lives in exactly one shard chosen by hashing its id, so two
/// rooms never contend on the same lock unless they hash together, and any
/// operation on one room is atomic with respect to that room.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

pub struct Shards<T> {
    shards: Vec<Mutex<HashMap<String, T>>>,
}

impl<T> Shards<T> {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn lock(shard: &Mutex<HashMap<String, T>>) -> MutexGuard<'_, HashMap<String, T>> {
        shard.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with exclusive access to the shard that owns `key`.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&mut HashMap<String, T>) -> R) -> R {
        let mut guard = Self::lock(&self.shards[self.index(key)]);
        f(&mut guard)
    }

    /// Visit every shard in turn. Shards are locked one at a time.
    pub fn for_each_shard(&self, mut f: impl FnMut(&mut HashMap<String, T>)) {
        for shard in &self.shards {
            let mut guard = Self::lock(shard);
            f(&mut guard);
        }
    }

    /// Sum a per-shard measurement.
    pub fn sum(&self, mut f: impl FnMut(&HashMap<String, T>) -> usize) -> usize {
        let mut total = 0;
        self.for_each_shard(|map| total += f(map));
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_always_hits_same_shard() {
        let shards: Shards<u32> = Shards::new(8);
        shards.with("room-a", |m| {
            m.insert("room-a".to_string(), 1);
        });
        let found = shards.with("room-a", |m| m.get("room-a").copied());
        assert_eq!(found, Some(1));
    }

    #[test]
    fn sum_spans_all_shards() {
        let shards: Shards<u32> = Shards::new(4);
        for i in 0..50 {
            let key = format!("room-{}", i);
            shards.with(&key, |m| {
                m.insert(key.clone(), i);
            });
        }
        assert_eq!(shards.sum(|m| m.len()), 50);
    }

    #[test]
    fn zero_shards_is_clamped() {
        let shards: Shards<u32> = Shards::new(0);
        shards.with("x", |m| {
            m.insert("x".to_string(), 7);
        });
        assert_eq!(shards.sum(|m| m.len()), 1);
    }
}
