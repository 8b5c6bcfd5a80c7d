use dashmap::DashMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Concurrent interner for SQL text and stack traces.
///
/// Identities are cloned on every recorded operation, so repeated text is
/// shared through one `Arc<str>` per distinct string.
#[derive(Debug, Default)]
pub struct TextInterner {
    // Map hash to the shared string
    strings: DashMap<u64, Arc<str>>,
}

impl TextInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string and returns the shared copy.
    pub fn intern(&self, s: &str) -> Arc<str> {
        self.intern_hashed(xxh3_64(s.as_bytes()), s)
    }

    fn intern_hashed(&self, hash: u64, s: &str) -> Arc<str> {
        let existing = self.strings.get(&hash).map(|e| e.clone());
        let shared = match existing {
            Some(existing) => existing,
            None => self
                .strings
                .entry(hash)
                .or_insert_with(|| Arc::from(s))
                .clone(),
        };
        if &*shared == s {
            shared
        } else {
            // hash collision: hand out an unshared copy
            Arc::from(s)
        }
    }

    /// Resolves a hash back to a string.
    pub fn resolve(&self, hash: u64) -> Option<Arc<str>> {
        self.strings.get(&hash).map(|s| s.clone())
    }

    pub fn clear(&self) {
        self.strings.clear();
        self.strings.shrink_to_fit();
    }

    /// Returns the number of interned strings.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns true if the interner contains no strings.
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning() {
        let interner = TextInterner::new();
        let s1 = "SELECT * FROM very_long_table_name WHERE id = ?";
        let a = interner.intern(s1);
        let b = interner.intern(s1);

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.resolve(xxh3_64(s1.as_bytes())).as_deref(), Some(s1));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_colliding_hash_keeps_text() {
        let interner = TextInterner::new();
        let first = interner.intern_hashed(7, "SELECT 1");
        let second = interner.intern_hashed(7, "SELECT 2");

        assert_eq!(&*first, "SELECT 1");
        assert_eq!(&*second, "SELECT 2");
        assert!(Arc::ptr_eq(&first, &interner.intern_hashed(7, "SELECT 1")));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_concurrent_interning() {
        let interner = Arc::new(TextInterner::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let interner = Arc::clone(&interner);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        interner.intern(&format!("stmt {}", i % 10));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(interner.len(), 10);
        interner.clear();
        assert!(interner.is_empty());
    }
}
