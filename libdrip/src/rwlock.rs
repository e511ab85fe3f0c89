use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::error::{Result, StoreError};

#[derive(Default)]
struct LockState {
    /// Per-thread read depth. A writer also holds one read permit here, so
    /// the writing thread can keep taking read locks recursively.
    readers: HashMap<ThreadId, usize>,
    /// The writer seat: owning thread and recursion depth. Claimed before
    /// the readers drain, which is what blocks new readers out.
    writer: Option<(ThreadId, usize)>,
}

impl LockState {
    fn others_reading(&self, me: ThreadId) -> bool {
        self.readers.iter().any(|(t, &n)| *t != me && n > 0)
    }
}

/// Re-entrant read-write lock.
///
/// Readers are not exclusive and may re-acquire recursively. A writer claims
/// the writer seat first (new readers block from that point), then waits for
/// every other thread's readers to drain. While writing, the thread holds a
/// read permit as well, so reads taken inside a write section on the same
/// thread succeed immediately; a thread already holding a read lock may also
/// promote to the write lock.
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    check: Condvar,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            check: Condvar::new(),
        }
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        loop {
            let held = state.readers.get(&me).copied().unwrap_or(0) > 0;
            let seat_ok = match state.writer {
                None => true,
                Some((owner, _)) => owner == me,
            };

            if held || seat_ok {
                *state.readers.entry(me).or_insert(0) += 1;
                return ReadGuard { lock: self };
            }

            state = self.check.wait(state).unwrap();
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();

        loop {
            match state.writer {
                None => {
                    state.writer = Some((me, 1));
                    break;
                }
                Some((owner, depth)) if owner == me => {
                    state.writer = Some((owner, depth + 1));
                    break;
                }
                Some(_) => state = self.check.wait(state).unwrap(),
            }
        }

        while state.others_reading(me) {
            state = self.check.wait(state).unwrap();
        }

        // the read permit that makes read-during-write work
        *state.readers.entry(me).or_insert(0) += 1;

        WriteGuard { lock: self }
    }

    fn release_read(&self, me: ThreadId) {
        let mut state = self.state.lock().unwrap();
        let count = state.readers.get_mut(&me).expect("released a read lock that was never held");
        *count -= 1;
        self.check.notify_all();
    }

    fn release_write(&self, me: ThreadId) {
        let mut state = self.state.lock().unwrap();

        let count = state.readers.get_mut(&me).expect("released a write lock that was never held");
        *count -= 1;

        match state.writer {
            Some((owner, depth)) if owner == me => {
                state.writer = if depth > 1 { Some((owner, depth - 1)) } else { None };
            }
            _ => panic!("released a write lock that was never held"),
        }

        self.check.notify_all();
    }
}

pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read(thread::current().id());
    }
}

pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write(thread::current().id());
    }
}

/// The read-only counterpart: read locks always grant and do nothing, write
/// locks always refuse. Engines opened without write access use this so any
/// mutation path fails at its first lock acquisition.
pub struct ReadOnlyRwLock;

pub struct PassGuard;

impl ReadOnlyRwLock {
    pub fn read(&self) -> PassGuard {
        PassGuard
    }

    pub fn write(&self) -> Result<PassGuard> {
        StoreError::read_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_read() {
        let lock = ReentrantRwLock::new();
        let a = lock.read();
        let b = lock.read();
        drop(a);
        drop(b);
        let _w = lock.write();
    }

    #[test]
    fn read_inside_write_same_thread() {
        let lock = ReentrantRwLock::new();
        let w = lock.write();
        let r = lock.read();
        drop(r);
        drop(w);
    }

    #[test]
    fn recursive_write() {
        let lock = ReentrantRwLock::new();
        let outer = lock.write();
        let inner = lock.write();
        drop(inner);
        drop(outer);
        let _r = lock.read();
    }

    #[test]
    fn promotion_from_read() {
        let lock = ReentrantRwLock::new();
        let r = lock.read();
        let w = lock.write();
        drop(w);
        drop(r);
    }

    #[test]
    fn writer_excludes_other_readers() {
        let lock = Arc::new(ReentrantRwLock::new());
        let writes = Arc::new(AtomicUsize::new(0));

        let (started_tx, started_rx) = mpsc::channel();
        let reader = {
            let lock = Arc::clone(&lock);
            let writes = Arc::clone(&writes);
            std::thread::spawn(move || {
                let guard = lock.read();
                started_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                let seen = writes.load(Ordering::SeqCst);
                drop(guard);
                seen
            })
        };

        started_rx.recv().unwrap();
        let guard = lock.write();
        writes.store(1, Ordering::SeqCst);
        drop(guard);

        // the reader must have finished before the write went through
        assert_eq!(reader.join().unwrap(), 0);
    }

    #[test]
    fn read_only_lock_refuses_writes() {
        let lock = ReadOnlyRwLock;
        let _r = lock.read();
        assert!(lock.write().is_err());
    }
}
