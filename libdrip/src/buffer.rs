use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::Vnode;

#[derive(Debug, Default)]
struct BufferInner {
    /// Monotonic insertion stamp; rewrites get a fresh stamp, which moves
    /// them to the back of the drain order on purpose: a fragment that just
    /// changed should not be the next thing drained.
    next_seq: u64,
    order: BTreeMap<u64, (Vnode, usize)>,
    entries: HashMap<(Vnode, usize), (u64, Vec<u8>)>,
}

/// In-memory staging for fragments that have not been dripped out yet,
/// keyed by (vnode, fragment offset) and drained in FIFO order.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: Mutex<BufferInner>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total staged bytes.
    pub fn size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.values().map(|(_, data)| data.len()).sum()
    }

    pub fn get(&self, vnode: Vnode, boff: usize) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(&(vnode, boff)).map(|(_, data)| data.clone())
    }

    pub fn set(&self, vnode: Vnode, boff: usize, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();

        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some((old, _)) = inner.entries.insert((vnode, boff), (seq, data)) {
            inner.order.remove(&old);
        }
        inner.order.insert(seq, (vnode, boff));
    }

    /// Snapshot of everything staged, oldest first.
    pub fn available(&self) -> Vec<(Vnode, usize, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .values()
            .map(|&(vnode, boff)| {
                let (_, data) = &inner.entries[&(vnode, boff)];
                (vnode, boff, data.clone())
            })
            .collect()
    }

    /// Removes the given keys; keys that are no longer present are skipped.
    pub fn pop(&self, keys: impl IntoIterator<Item = (Vnode, usize)>) {
        let mut inner = self.inner.lock().unwrap();
        for key in keys {
            if let Some((seq, _)) = inner.entries.remove(&key) {
                inner.order.remove(&seq);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_insertion_order() {
        let buf = Buffer::new();
        buf.set(1, 0, b"a".to_vec());
        buf.set(2, 0, b"b".to_vec());
        buf.set(1, 1, b"c".to_vec());

        let keys: Vec<_> = buf.available().into_iter().map(|(v, b, _)| (v, b)).collect();
        assert_eq!(keys, vec![(1, 0), (2, 0), (1, 1)]);
    }

    #[test]
    fn rewrite_moves_to_the_back() {
        let buf = Buffer::new();
        buf.set(1, 0, b"a".to_vec());
        buf.set(2, 0, b"b".to_vec());
        buf.set(1, 0, b"a2".to_vec());

        let avail = buf.available();
        assert_eq!(avail.len(), 2);
        assert_eq!(avail[0].0, 2);
        assert_eq!(avail[1].2, b"a2".to_vec());
    }

    #[test]
    fn pop_removes_only_named_keys() {
        let buf = Buffer::new();
        buf.set(1, 0, b"a".to_vec());
        buf.set(1, 1, b"b".to_vec());

        buf.pop([(1, 0), (9, 9)]);

        assert_eq!(buf.len(), 1);
        assert!(buf.get(1, 0).is_none());
        assert_eq!(buf.get(1, 1), Some(b"b".to_vec()));
        assert_eq!(buf.size(), 1);
    }
}
