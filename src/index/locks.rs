use std::{
    collections::HashSet,
    sync::{Condvar, Mutex, PoisonError},
};

/// Set of named locks.
///
/// All the keys of a [`KeyLocks::lock`] call are acquired at once, so two
/// callers with overlapping keys can't deadlock.
#[derive(Default)]
pub(super) struct KeyLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

pub(super) struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<String>,
}

impl KeyLocks {
    /// Block until none of the `keys` is held by another caller.
    pub fn lock(&self, keys: Vec<String>) -> KeyGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);

        while keys.iter().any(|k| held.contains(k)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }

        held.extend(keys.iter().cloned());

        KeyGuard { locks: self, keys }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for key in &self.keys {
            held.remove(key);
        }

        self.locks.released.notify_all();
    }
}

#[test]
fn exclusive_keys() {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    let locks = KeyLocks::default();
    let inside = AtomicUsize::new(0);

    thread::scope(|scope| {
        for n in 0..4 {
            let locks = &locks;
            let inside = &inside;

            scope.spawn(move || {
                let keys = vec![format!("other-{n}"), "shared".to_owned()];
                let _guard = locks.lock(keys);

                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                thread::sleep(Duration::from_millis(10));
                inside.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    // Disjoint keys are not blocked.
    let _a = locks.lock(vec!["a".to_owned()]);
    let _b = locks.lock(vec!["b".to_owned()]);
}
