//! Per-instance memoization of method results.
//!
//! A [`Stash`] lives as a field on the object whose methods it memoizes.
//! Values are keyed by a method identifier (usually a small enum) plus the
//! signature of the call's arguments. There is no expiry: values live until
//! the stash is cleared or the object is dropped.
//!
//! Stashed values are process-local. Clear the stash before an object is
//! serialized into a shared cache; cloning or deserializing an object always
//! yields an empty stash.
//!
//! Only methods whose results depend on nothing but the instance may be
//! stashed. This is not checked.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use strata_core::args_signature;

type StashKey<M> = (M, String);
type StashValue = Arc<dyn Any + Send + Sync>;

/// Typed memo table for one object instance.
///
/// Lookups and inserts are serialized by a per-instance lock; computation
/// runs outside it, so stashed methods may call other stashed methods. Two
/// threads missing the same entry both compute and the last insert wins.
pub struct Stash<M> {
    entries: Mutex<HashMap<StashKey<M>, StashValue>>,
}

impl<M> Stash<M>
where
    M: Eq + Hash + Copy + Debug,
{
    /// Create an empty stash.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the stashed result of `method(args)`, computing it if absent.
    ///
    /// `None` results are returned but never stashed.
    pub fn get_or_stash<A, T, F>(&self, method: M, args: &A, compute: F) -> Option<T>
    where
        A: Serialize + Debug + ?Sized,
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Option<T>,
    {
        let key = (method, args_signature(args));
        if let Some(value) = self.lookup::<T>(&key) {
            tracing::trace!(?method, signature = %key.1, "Stash get");
            return Some(value);
        }

        let value = compute()?;
        self.insert(key, value.clone());
        Some(value)
    }

    /// Like [`Stash::get_or_stash`] for methods that always return a value.
    pub fn get_or_stash_value<A, T, F>(&self, method: M, args: &A, compute: F) -> T
    where
        A: Serialize + Debug + ?Sized,
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let key = (method, args_signature(args));
        if let Some(value) = self.lookup::<T>(&key) {
            return value;
        }

        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Get a stashed result without computing.
    pub fn get<A, T>(&self, method: M, args: &A) -> Option<T>
    where
        A: Serialize + Debug + ?Sized,
        T: Clone + 'static,
    {
        self.lookup(&(method, args_signature(args)))
    }

    /// Drop every stashed value, returning how many were held.
    pub fn clear(&self) -> usize {
        match self.entries.lock() {
            Ok(mut entries) => {
                let held = entries.len();
                entries.clear();
                if held > 0 {
                    tracing::trace!(held, "Stash clear");
                }
                held
            }
            Err(_) => 0,
        }
    }

    /// Number of stashed values.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// True if nothing is stashed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup<T: Clone + 'static>(&self, key: &StashKey<M>) -> Option<T> {
        // A poisoned lock reads as a miss
        let entries = self.entries.lock().ok()?;
        entries.get(key)?.downcast_ref::<T>().cloned()
    }

    fn insert<T: Send + Sync + 'static>(&self, key: StashKey<M>, value: T) {
        if let Ok(mut entries) = self.entries.lock() {
            tracing::trace!(method = ?key.0, signature = %key.1, "Stash set");
            entries.insert(key, Arc::new(value));
        }
    }
}

impl<M> Default for Stash<M>
where
    M: Eq + Hash + Copy + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Cloning an object never carries its stash along.
impl<M> Clone for Stash<M>
where
    M: Eq + Hash + Copy + Debug,
{
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<M> Debug for Stash<M>
where
    M: Eq + Hash + Copy + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stash").field("len", &self.len()).finish()
    }
}

/// Implemented by objects that carry a [`Stash`].
pub trait Stashed {
    /// Identifies each stashed method.
    type Method: Eq + Hash + Copy + Debug;

    /// The instance's stash.
    fn stash(&self) -> &Stash<Self::Method>;

    /// Memoize `compute` as `method(args)` on this instance.
    fn stashed<A, T, F>(&self, method: Self::Method, args: &A, compute: F) -> Option<T>
    where
        A: Serialize + Debug + ?Sized,
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Option<T>,
    {
        self.stash().get_or_stash(method, args, compute)
    }

    /// Drop every stashed value on this instance.
    fn clear_stash(&self) -> usize {
        self.stash().clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Method {
        ItemCount,
        Label,
    }

    struct Bag {
        items: Vec<u32>,
        counted: Cell<usize>,
        stash: Stash<Method>,
    }

    impl Bag {
        fn item_count(&self) -> usize {
            self.stash
                .get_or_stash_value(Method::ItemCount, &(), || {
                    self.counted.set(self.counted.get() + 1);
                    self.items.len()
                })
        }
    }

    #[test]
    fn test_stash_memoizes_until_cleared() {
        let bag = Bag {
            items: vec![1, 2, 3],
            counted: Cell::new(0),
            stash: Stash::new(),
        };

        assert_eq!(bag.item_count(), 3);
        assert_eq!(bag.item_count(), 3);
        assert_eq!(bag.counted.get(), 1);

        assert_eq!(bag.stash.clear(), 1);
        assert_eq!(bag.item_count(), 3);
        assert_eq!(bag.counted.get(), 2);
    }

    #[test]
    fn test_args_are_part_of_the_key() {
        let stash: Stash<Method> = Stash::new();
        let a = stash.get_or_stash_value(Method::Label, &("a", 1), || "first".to_string());
        let b = stash.get_or_stash_value(Method::Label, &("b", 1), || "second".to_string());
        assert_eq!(a, "first");
        assert_eq!(b, "second");
        assert_eq!(stash.len(), 2);
        assert_eq!(
            stash.get::<_, String>(Method::Label, &("a", 1)).as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_none_is_not_stashed() {
        let stash: Stash<Method> = Stash::new();
        let calls = Cell::new(0);
        for _ in 0..3 {
            let value: Option<u32> = stash.get_or_stash(Method::Label, &(), || {
                calls.set(calls.get() + 1);
                None
            });
            assert!(value.is_none());
        }
        assert_eq!(calls.get(), 3);
        assert!(stash.is_empty());
    }

    #[test]
    fn test_clone_is_empty() {
        let stash: Stash<Method> = Stash::new();
        stash.get_or_stash_value(Method::ItemCount, &(), || 1usize);
        assert_eq!(stash.len(), 1);
        assert!(stash.clone().is_empty());
    }

    #[test]
    fn test_nested_stashed_calls_do_not_deadlock() {
        let stash: Stash<Method> = Stash::new();
        let label = stash.get_or_stash_value(Method::Label, &(), || {
            let count = stash.get_or_stash_value(Method::ItemCount, &(), || 4usize);
            format!("{count} items")
        });
        assert_eq!(label, "4 items");
        assert_eq!(stash.len(), 2);
    }

    #[test]
    fn test_shared_across_threads() {
        let stash: Stash<Method> = Stash::new();
        let calls = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let value = stash.get_or_stash_value(Method::ItemCount, &(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        10usize
                    });
                    assert_eq!(value, 10);
                });
            }
        });

        // Racing misses may each compute, but all agree on the value
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(stash.get::<_, usize>(Method::ItemCount, &()), Some(10));
    }

    struct Owner {
        stash: Stash<Method>,
    }

    impl Stashed for Owner {
        type Method = Method;

        fn stash(&self) -> &Stash<Method> {
            &self.stash
        }
    }

    #[test]
    fn test_stashed_trait() {
        let owner = Owner {
            stash: Stash::default(),
        };
        let value = owner.stashed(Method::Label, "x", || Some(7u8));
        assert_eq!(value, Some(7));
        assert_eq!(owner.clear_stash(), 1);
    }
}
