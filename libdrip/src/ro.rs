use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::backend::Backend;
use crate::block;
use crate::error::{Result, StoreError};
use crate::rwlock::ReadOnlyRwLock;
use crate::store::FragmentStore;
use crate::superblock::{load_superblock, Geometry};
use crate::vtable::VTable;
use crate::Vnode;

struct RoInner {
    vtable: VTable,
    last_refresh: Instant,
}

/// The read-only engine: serves everything straight from the backend and
/// re-reads the root record once it is older than the refresh threshold, so
/// a writer elsewhere becomes visible within one threshold. Every mutation
/// fails at its write-lock acquisition.
pub struct RoStore {
    backend: Backend,
    geom: Geometry,
    thresh: Duration,
    lock: ReadOnlyRwLock,
    inner: Mutex<RoInner>,
}

impl RoStore {
    /// Opens an existing store. The threshold should be at least the
    /// writer's drip period; refreshing faster buys nothing.
    pub fn open(backend: Backend, thresh: Duration) -> Result<Self> {
        let Some(sup) = load_superblock(&backend)? else {
            return StoreError::corrupt("backend has no root record");
        };

        Ok(Self {
            backend,
            geom: sup.geom,
            thresh,
            lock: ReadOnlyRwLock,
            inner: Mutex::new(RoInner {
                vtable: sup.vtable,
                last_refresh: Instant::now(),
            }),
        })
    }

    pub fn geometry(&self) -> Geometry {
        self.geom
    }

    /// Re-reads the root record when the cached one has aged out.
    fn supdate(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.last_refresh.elapsed() <= self.thresh {
            return Ok(());
        }

        match load_superblock(&self.backend)? {
            Some(sup) => {
                inner.vtable = sup.vtable;
                inner.last_refresh = Instant::now();
                Ok(())
            }
            None => StoreError::corrupt("backend lost its root record"),
        }
    }

    pub fn len(&self) -> usize {
        if let Err(err) = self.supdate() {
            log::warn!("root record refresh failed: {err}");
        }
        self.inner.lock().unwrap().vtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vnodes(&self) -> Vec<Vnode> {
        if let Err(err) = self.supdate() {
            log::warn!("root record refresh failed: {err}");
        }
        self.inner.lock().unwrap().vtable.vnodes()
    }

    pub fn num_blocks(&self, vnode: Vnode) -> Result<usize> {
        self.supdate()?;
        Ok(self.inner.lock().unwrap().vtable.get_info(vnode)?.inodes.len())
    }

    pub fn get_size(&self, vnode: Vnode) -> Result<usize> {
        self.supdate()?;
        self.inner.lock().unwrap().vtable.get_size(vnode)
    }

    pub fn get_mtime(&self, vnode: Vnode) -> Result<SystemTime> {
        self.supdate()?;
        self.inner.lock().unwrap().vtable.get_mtime(vnode)
    }

    /// Total stored bytes across all objects. Walks every vnode.
    pub fn size(&self) -> Result<usize> {
        self.supdate()?;
        let _r = self.lock.read();
        let inner = self.inner.lock().unwrap();
        let mut total = 0;
        for vnode in inner.vtable.vnodes() {
            total += inner.vtable.get_size(vnode)?;
        }
        Ok(total)
    }

    /// One fragment, straight from the backend. A fragment whose bytes were
    /// still staged when the root record was saved reads as `None` until the
    /// writer drips it out.
    pub fn get(&self, vnode: Vnode, boff: usize) -> Result<Option<Vec<u8>>> {
        self.supdate()?;
        let _r = self.lock.read();

        let inodes = self.inner.lock().unwrap().vtable.get_inodes(vnode)?;
        let Some(&(inode, split)) = inodes.get(boff) else {
            return StoreError::out_of_range(vnode, boff);
        };
        if inode < 0 {
            return Ok(None);
        }

        Ok(block::fetch_fragment(&self.backend, self.geom, vnode, inode, split))
    }

    pub fn create(&self) -> Result<Vnode> {
        self.lock.write()?;
        StoreError::read_only()
    }

    pub fn set(&self, _vnode: Vnode, _boff: usize, _data: &[u8]) -> Result<()> {
        self.lock.write()?;
        Ok(())
    }

    pub fn resize(&self, _vnode: Vnode, _size: usize) -> Result<()> {
        self.lock.write()?;
        Ok(())
    }

    pub fn delete(&self, _vnode: Vnode) -> Result<()> {
        self.lock.write()?;
        Ok(())
    }

    pub fn set_mtime(&self, _vnode: Vnode, _when: SystemTime) -> Result<()> {
        self.lock.write()?;
        Ok(())
    }
}

impl FragmentStore for RoStore {
    fn geometry(&self) -> Geometry {
        self.geom
    }

    fn num_blocks(&self, vnode: Vnode) -> Result<usize> {
        RoStore::num_blocks(self, vnode)
    }

    fn get(&self, vnode: Vnode, boff: usize) -> Result<Option<Vec<u8>>> {
        RoStore::get(self, vnode, boff)
    }

    fn get_size(&self, vnode: Vnode) -> Result<usize> {
        RoStore::get_size(self, vnode)
    }

    fn get_mtime(&self, vnode: Vnode) -> Result<SystemTime> {
        RoStore::get_mtime(self, vnode)
    }

    fn vnodes(&self) -> Vec<Vnode> {
        RoStore::vnodes(self)
    }

    fn len(&self) -> usize {
        RoStore::len(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rw::{RwStore, StoreOptions};

    const KEY: [u8; 16] = *b"0123456789abcdef";

    fn options() -> StoreOptions {
        StoreOptions::default()
            .blocksize(1 << 16)
            .total_blocks(128)
            .drip_rate(10)
            .drip_time(0)
    }

    fn drain(store: &RwStore) {
        while store.buffered() > 0 {
            store.sync().unwrap();
        }
    }

    #[test]
    fn opening_an_empty_backend_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::open(KEY, dir.path()).unwrap();
        assert!(RoStore::open(backend, Duration::ZERO).is_err());
    }

    #[test]
    fn serves_what_the_writer_drained() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RwStore::open(Backend::open(KEY, dir.path()).unwrap(), options()).unwrap();
        let fbsize = writer.geometry().fbsize;

        let vnode = writer.create();
        writer.set(vnode, 0, &vec![3u8; fbsize]).unwrap();
        writer.set(vnode, 1, b"reader-visible").unwrap();
        drain(&writer);

        let reader = RoStore::open(Backend::open(KEY, dir.path()).unwrap(), Duration::ZERO).unwrap();
        assert_eq!(reader.num_blocks(vnode).unwrap(), 2);
        assert_eq!(reader.get_size(vnode).unwrap(), fbsize + 14);
        assert_eq!(reader.get(vnode, 0).unwrap(), Some(vec![3u8; fbsize]));
        assert_eq!(reader.get(vnode, 1).unwrap(), Some(b"reader-visible".to_vec()));
    }

    #[test]
    fn refresh_picks_up_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RwStore::open(Backend::open(KEY, dir.path()).unwrap(), options()).unwrap();

        let vnode = writer.create();
        writer.set(vnode, 0, b"first").unwrap();
        drain(&writer);

        let reader = RoStore::open(Backend::open(KEY, dir.path()).unwrap(), Duration::ZERO).unwrap();
        assert_eq!(reader.get(vnode, 0).unwrap(), Some(b"first".to_vec()));

        writer.set(vnode, 0, b"second").unwrap();
        drain(&writer);
        assert_eq!(reader.get(vnode, 0).unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn mutations_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let writer = RwStore::open(Backend::open(KEY, dir.path()).unwrap(), options()).unwrap();
        let vnode = writer.create();
        writer.set(vnode, 0, b"data").unwrap();
        drain(&writer);

        let reader = RoStore::open(Backend::open(KEY, dir.path()).unwrap(), Duration::ZERO).unwrap();
        assert!(reader.create().is_err());
        assert!(reader.set(vnode, 0, b"nope").is_err());
        assert!(reader.resize(vnode, 1).is_err());
        assert!(reader.delete(vnode).is_err());
        assert!(reader.set_mtime(vnode, SystemTime::now()).is_err());
    }
}
