//! Poison-tolerant lock helpers.
//!
//! Shared state behind these locks is plain bookkeeping (counters, ring
//! buffers, subscription sets), so a panic in another holder never makes it
//! unusable. The guard is recovered and the event is logged.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recovered(component: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        component,
        lock_kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock"
    );
}

pub(crate) fn read_guard<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        recovered(component, op, "rwlock.read");
        poisoned.into_inner()
    })
}

pub(crate) fn write_guard<'a, T>(
    lock: &'a RwLock<T>,
    component: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        recovered(component, op, "rwlock.write");
        poisoned.into_inner()
    })
}

pub(crate) fn lock_guard<'a, T>(
    lock: &'a Mutex<T>,
    component: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        recovered(component, op, "mutex.lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn recovers_poisoned_mutex() {
        let lock = Arc::new(Mutex::new(1_u32));
        let clone = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(lock.is_poisoned());
        *lock_guard(&lock, "test", "bump") += 1;
        assert_eq!(*lock_guard(&lock, "test", "read"), 2);
    }

    #[test]
    fn recovers_poisoned_rwlock() {
        let lock = Arc::new(RwLock::new(vec![1_u8]));
        let clone = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("poison");
        })
        .join();

        write_guard(&lock, "test", "push").push(2);
        assert_eq!(read_guard(&lock, "test", "len").len(), 2);
    }
}
