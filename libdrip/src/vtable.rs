use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Seek, Write};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::error::{Result, StoreError};
use crate::store::Storage;
use crate::{Inode, Vnode};

/// Reserved for the mount adapter's directory table; created with the store
/// and never handed out by `allocate`.
pub const ROOT_VNODE: Vnode = 1;

/// Inode sentinel: the fragment's authoritative bytes are staged in the
/// buffer and have no backend address yet.
pub(crate) const STALE: Inode = -2;

#[derive(Debug, Clone)]
pub struct VtEntry {
    pub mtime: SystemTime,
    /// Size of the tail fragment. Every earlier fragment is exactly `fbsize`.
    pub lbsize: usize,
    pub inodes: Vec<Inode>,
}

#[derive(Debug)]
struct VTableInner {
    next_free: Vnode,
    free: BTreeSet<Vnode>,
    cache: BTreeMap<Vnode, VtEntry>,
    /// Pre-mutation snapshot per vnode with unsynced fragments. Kept until
    /// every inode of the live entry is a real address again, so concurrent
    /// readers of old slots never see their data reclaimed early.
    shadow: BTreeMap<Vnode, VtEntry>,
}

/// Maps each vnode to its modification time, tail size and fragment
/// addresses.
#[derive(Debug)]
pub struct VTable {
    fbsize: usize,
    /// Largest fragment that may live in a split half.
    sbmax: usize,
    inner: Mutex<VTableInner>,
}

impl VTable {
    pub fn create(fbsize: usize, sbmax: usize) -> Self {
        let mut cache = BTreeMap::new();
        cache.insert(ROOT_VNODE, VtEntry {
            mtime: SystemTime::now(),
            lbsize: fbsize,
            inodes: Vec::new(),
        });

        Self {
            fbsize,
            sbmax,
            inner: Mutex::new(VTableInner {
                next_free: ROOT_VNODE + 1,
                free: BTreeSet::new(),
                cache,
                shadow: BTreeMap::new(),
            }),
        }
    }

    pub fn load(save: VTableSave, fbsize: usize, sbmax: usize) -> Self {
        Self {
            fbsize,
            sbmax,
            inner: Mutex::new(VTableInner {
                next_free: save.next_free,
                free: save.free.into_iter().collect(),
                cache: save.cache.into_iter().collect(),
                shadow: BTreeMap::new(),
            }),
        }
    }

    /// Snapshot for persistence. Entries with a shadow copy are saved from
    /// the shadow: the live entry points into the buffer, which does not
    /// survive a restart, while the shadow still names valid addresses.
    pub fn save(&self) -> VTableSave {
        let inner = self.inner.lock().unwrap();

        let mut merged = inner.cache.clone();
        for (vnode, entry) in &inner.shadow {
            merged.insert(*vnode, entry.clone());
        }

        VTableSave {
            next_free: inner.next_free,
            free: inner.free.iter().copied().collect(),
            cache: merged.into_iter().collect(),
        }
    }

    pub fn allocate(&self) -> Vnode {
        let mut inner = self.inner.lock().unwrap();

        let vnode = match inner.free.pop_first() {
            Some(vnode) => vnode,
            None => {
                let vnode = inner.next_free;
                inner.next_free += 1;
                vnode
            }
        };

        inner.cache.insert(vnode, VtEntry {
            mtime: SystemTime::now(),
            lbsize: self.fbsize,
            inodes: Vec::new(),
        });

        vnode
    }

    pub fn release(&self, vnode: Vnode) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.cache.contains_key(&vnode) {
            return StoreError::not_found(vnode);
        }

        if vnode + 1 == inner.next_free {
            inner.next_free -= 1;
            loop {
                let candidate = inner.next_free.saturating_sub(1);
                if candidate == 0 || !inner.free.remove(&candidate) {
                    break;
                }
                inner.next_free = candidate;
            }
        } else {
            inner.free.insert(vnode);
        }

        inner.cache.remove(&vnode);
        inner.shadow.remove(&vnode);
        Ok(())
    }

    pub fn contains(&self, vnode: Vnode) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.cache.contains_key(&vnode) && !inner.free.contains(&vnode)
    }

    pub fn has_shadow(&self) -> bool {
        !self.inner.lock().unwrap().shadow.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vnodes(&self) -> Vec<Vnode> {
        self.inner.lock().unwrap().cache.keys().copied().collect()
    }

    /// Assuming a fragment of `vnode` was found at `inode`, may it be
    /// reclaimed? Only if neither the live entry nor the shadow still points
    /// there. Split fragments hold the whole slot pair alive, since either
    /// half of the pair can host them after a merge.
    pub fn is_stale(&self, vnode: Vnode, inode: Inode) -> bool {
        let inner = self.inner.lock().unwrap();

        let infos = [inner.shadow.get(&vnode), inner.cache.get(&vnode)];
        for info in infos.into_iter().flatten() {
            for (tin, split) in self.unpack(info) {
                if split {
                    if tin / 2 == inode / 2 {
                        return false;
                    }
                } else if tin == inode {
                    return false;
                }
            }
        }

        true
    }

    pub fn get_info(&self, vnode: Vnode) -> Result<VtEntry> {
        let inner = self.inner.lock().unwrap();
        if inner.free.contains(&vnode) {
            return StoreError::not_found(vnode);
        }
        match inner.cache.get(&vnode) {
            Some(entry) => Ok(entry.clone()),
            None => StoreError::not_found(vnode),
        }
    }

    /// The fragment addresses of a vnode as `(inode, split)` pairs. Only the
    /// tail can be small enough for a split half; every earlier fragment is
    /// a full `fbsize` and therefore a full half.
    pub fn get_inodes(&self, vnode: Vnode) -> Result<Vec<(Inode, bool)>> {
        Ok(self.unpack(&self.get_info(vnode)?))
    }

    fn unpack(&self, entry: &VtEntry) -> Vec<(Inode, bool)> {
        match entry.inodes.split_last() {
            None => Vec::new(),
            Some((&tail, rest)) if entry.lbsize <= self.sbmax => rest
                .iter()
                .map(|&inode| (inode, false))
                .chain([(tail, true)])
                .collect(),
            Some(_) => entry.inodes.iter().map(|&inode| (inode, false)).collect(),
        }
    }

    pub fn get_size(&self, vnode: Vnode) -> Result<usize> {
        let entry = self.get_info(vnode)?;
        Ok(match entry.inodes.len() {
            0 => 0,
            n => self.fbsize * (n - 1) + entry.lbsize,
        })
    }

    pub fn get_mtime(&self, vnode: Vnode) -> Result<SystemTime> {
        Ok(self.get_info(vnode)?.mtime)
    }

    pub fn set_mtime(&self, vnode: Vnode, when: SystemTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.cache.get_mut(&vnode) {
            Some(entry) => {
                entry.mtime = when;
                Ok(())
            }
            None => StoreError::not_found(vnode),
        }
    }

    /// Marks one fragment as rewritten: the address becomes the stale
    /// sentinel (the bytes go to the buffer) and the entry is snapshotted
    /// into the shadow the first time it diverges from synced state.
    pub fn change_inode(&self, vnode: Vnode, boff: usize, size: usize) -> Result<()> {
        if size == 0 {
            return StoreError::invalid("fragment size must be positive");
        }

        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();

        let Some(current) = inner.cache.get(&vnode) else {
            return StoreError::not_found(vnode);
        };

        let mut entry = current.clone();
        if boff == entry.inodes.len() {
            // appending; the current tail must be full
            if entry.lbsize != self.fbsize {
                return StoreError::invalid("cannot append until the last fragment is full");
            }
            entry.inodes.push(STALE);
            entry.lbsize = size;
        } else if boff + 1 == entry.inodes.len() {
            entry.inodes[boff] = STALE;
            entry.lbsize = size;
        } else if boff < entry.inodes.len() {
            if size != self.fbsize {
                return StoreError::invalid("a fragment before the tail must keep its full size");
            }
            entry.inodes[boff] = STALE;
        } else {
            return StoreError::out_of_range(vnode, boff);
        }
        entry.mtime = now;

        if !inner.shadow.contains_key(&vnode) {
            debug_assert!(current.inodes.iter().all(|&inode| inode >= 0));
            let snapshot = current.clone();
            inner.shadow.insert(vnode, snapshot);
        }
        inner.cache.insert(vnode, entry);

        Ok(())
    }

    /// Truncates the fragment list. The tail size resets to `fbsize`; a
    /// partial tail is the caller's follow-up `set`. If nothing unsynced
    /// survives the cut the shadow is dropped right here.
    pub fn trunc_inodes(&self, vnode: Vnode, newlen: usize) -> Result<()> {
        let now = SystemTime::now();
        let mut inner = self.inner.lock().unwrap();

        let Some(current) = inner.cache.get(&vnode) else {
            return StoreError::not_found(vnode);
        };

        if newlen >= current.inodes.len() {
            return StoreError::invalid("truncation must shorten the fragment list");
        }

        let mut entry = current.clone();
        entry.inodes.truncate(newlen);
        entry.lbsize = self.fbsize;
        entry.mtime = now;

        if entry.inodes.iter().all(|&inode| inode >= 0) {
            inner.shadow.remove(&vnode);
        }
        inner.cache.insert(vnode, entry);

        Ok(())
    }

    /// Records a confirmed backend address after a drip placed the fragment.
    /// Does not touch the modification time. A placement that outlived its
    /// fragment (the list shrank while the drip was in flight) is dropped on
    /// the floor; the written copy is stale from birth.
    pub fn set_inode(&self, vnode: Vnode, boff: usize, inode: Inode) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        let Some(current) = inner.cache.get(&vnode) else {
            return StoreError::not_found(vnode);
        };

        let mut entry = current.clone();
        match entry.inodes.get_mut(boff) {
            Some(slot) => *slot = inode,
            None => return Ok(()),
        }

        if entry.inodes.iter().all(|&inode| inode >= 0) {
            inner.shadow.remove(&vnode);
        }
        inner.cache.insert(vnode, entry);

        Ok(())
    }
}

/// Persistable form of the table, embedded in the root record.
///
/// # Binary Layout (Little-Endian)
/// ```text
/// Offset  Size     Field
/// -------------------------------
/// 0       8 B      Next-free counter
/// 8       4 B      Free-set length F
/// 12      8F B     Free vnodes
/// ..      4 B      Entry count E
/// ..      E entries:
///         8 B      Vnode
///         8 B      Modification time (ms since UNIX_EPOCH)
///         4 B      Tail fragment size
///         4 B      Fragment count N
///         8N B     Inodes (signed; negative values never persist)
/// ```
#[derive(Debug)]
pub struct VTableSave {
    pub(crate) next_free: Vnode,
    pub(crate) free: Vec<Vnode>,
    pub(crate) cache: Vec<(Vnode, VtEntry)>,
}

impl<Backing: Read + Write + Seek> Storage<Backing> for VTableSave {
    fn read(mut source: Backing) -> Result<Self> {
        let mut buffer = [0u8; 12];
        source.read_exact(&mut buffer)?;

        let next_free = Vnode::from_le_bytes(buffer[0..8].try_into()?);
        let free_len = u32::from_le_bytes(buffer[8..12].try_into()?) as usize;

        let mut free = Vec::with_capacity(free_len);
        for _ in 0..free_len {
            let mut word = [0u8; 8];
            source.read_exact(&mut word)?;
            free.push(Vnode::from_le_bytes(word));
        }

        let mut word = [0u8; 4];
        source.read_exact(&mut word)?;
        let entries = u32::from_le_bytes(word) as usize;

        let mut cache = Vec::with_capacity(entries);
        for _ in 0..entries {
            let mut head = [0u8; 24];
            source.read_exact(&mut head)?;

            let vnode = Vnode::from_le_bytes(head[0..8].try_into()?);
            let mtime = SystemTime::UNIX_EPOCH
                + Duration::from_millis(u64::from_le_bytes(head[8..16].try_into()?));
            let lbsize = u32::from_le_bytes(head[16..20].try_into()?) as usize;
            let ninodes = u32::from_le_bytes(head[20..24].try_into()?) as usize;

            let mut inodes = Vec::with_capacity(ninodes);
            for _ in 0..ninodes {
                let mut word = [0u8; 8];
                source.read_exact(&mut word)?;
                inodes.push(Inode::from_le_bytes(word));
            }

            cache.push((vnode, VtEntry { mtime, lbsize, inodes }));
        }

        Ok(Self { next_free, free, cache })
    }

    fn write(&mut self, mut source: Backing) -> Result<()> {
        source.write_all(&self.next_free.to_le_bytes())?;
        source.write_all(&(self.free.len() as u32).to_le_bytes())?;
        for vnode in &self.free {
            source.write_all(&vnode.to_le_bytes())?;
        }

        source.write_all(&(self.cache.len() as u32).to_le_bytes())?;
        for (vnode, entry) in &self.cache {
            source.write_all(&vnode.to_le_bytes())?;
            let mtime = entry.mtime.duration_since(SystemTime::UNIX_EPOCH)?.as_millis() as u64;
            source.write_all(&mtime.to_le_bytes())?;
            source.write_all(&(entry.lbsize as u32).to_le_bytes())?;
            source.write_all(&(entry.inodes.len() as u32).to_le_bytes())?;
            for inode in &entry.inodes {
                source.write_all(&inode.to_le_bytes())?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const FBSIZE: usize = 1000;
    const SBMAX: usize = 600;

    fn table() -> VTable {
        VTable::create(FBSIZE, SBMAX)
    }

    #[test]
    fn allocate_skips_the_root_vnode() {
        let vt = table();
        for _ in 0..16 {
            assert_ne!(vt.allocate(), ROOT_VNODE);
        }
    }

    #[test]
    fn release_shrinks_the_counter_and_absorbs_free_entries() {
        let vt = table();
        let a = vt.allocate(); // 2
        let b = vt.allocate(); // 3
        let c = vt.allocate(); // 4

        vt.release(b).unwrap(); // goes to the free set
        vt.release(c).unwrap(); // top of the counter; absorbs nothing yet
        vt.release(a).unwrap(); // top again; absorbs b

        // everything was reclaimed, so the next handle restarts at 2
        assert_eq!(vt.allocate(), 2);
    }

    #[test]
    fn released_vnodes_are_reused() {
        let vt = table();
        let a = vt.allocate();
        let _b = vt.allocate();
        vt.release(a).unwrap();
        assert_eq!(vt.allocate(), a);
    }

    #[test]
    fn contains_ignores_freed_vnodes() {
        let vt = table();
        let a = vt.allocate();
        assert!(vt.contains(a));
        vt.release(a).unwrap();
        assert!(!vt.contains(a));
        assert!(vt.get_info(a).is_err());
    }

    #[test]
    fn append_requires_a_full_tail() {
        let vt = table();
        let v = vt.allocate();

        vt.change_inode(v, 0, 100).unwrap();
        // tail is partial; appending is refused
        assert!(vt.change_inode(v, 1, 100).is_err());

        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.change_inode(v, 1, 100).unwrap();
        assert_eq!(vt.get_size(v).unwrap(), FBSIZE + 100);
    }

    #[test]
    fn mid_fragment_writes_must_be_full() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.change_inode(v, 1, 50).unwrap();

        assert!(vt.change_inode(v, 0, 10).is_err());
        vt.change_inode(v, 0, FBSIZE).unwrap();
    }

    #[test]
    fn shadow_tracks_unsynced_fragments() {
        let vt = table();
        let v = vt.allocate();
        assert!(!vt.has_shadow());

        vt.change_inode(v, 0, 100).unwrap();
        assert!(vt.has_shadow());

        vt.set_inode(v, 0, 6).unwrap();
        assert!(!vt.has_shadow());
        assert_eq!(vt.get_inodes(v).unwrap(), vec![(6, true)]);
    }

    #[test]
    fn truncation_drops_the_shadow_when_fully_synced() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.change_inode(v, 1, 10).unwrap();
        vt.set_inode(v, 0, 4).unwrap();
        assert!(vt.has_shadow()); // fragment 1 still unsynced

        vt.trunc_inodes(v, 1).unwrap();
        assert!(!vt.has_shadow());
        assert_eq!(vt.get_size(v).unwrap(), FBSIZE);
    }

    #[test]
    fn failed_changes_leave_no_shadow() {
        let vt = table();
        let v = vt.allocate();
        assert!(vt.change_inode(v, 5, 10).is_err());
        assert!(!vt.has_shadow());
    }

    #[test]
    fn set_inode_ignores_placements_beyond_the_list() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, 100).unwrap();
        vt.set_inode(v, 7, 12).unwrap();
        assert_eq!(vt.get_inodes(v).unwrap(), vec![(STALE, true)]);
    }

    #[test]
    fn staleness_spares_live_addresses() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.change_inode(v, 1, 100).unwrap();
        vt.set_inode(v, 0, 8).unwrap(); // full half at slot 4
        vt.set_inode(v, 1, 11).unwrap(); // split half at slot 5

        assert!(!vt.is_stale(v, 8));
        assert!(vt.is_stale(v, 9));
        // split fragments keep the whole slot pair alive
        assert!(!vt.is_stale(v, 10));
        assert!(!vt.is_stale(v, 11));
        assert!(vt.is_stale(v, 12));
        assert!(vt.is_stale(999, 8));
    }

    #[test]
    fn staleness_consults_the_shadow() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.set_inode(v, 0, 8).unwrap();

        // rewrite the fragment; the live entry forgets address 8 but the
        // shadow keeps it reachable until the new copy lands
        vt.change_inode(v, 0, FBSIZE).unwrap();
        assert!(!vt.is_stale(v, 8));

        vt.set_inode(v, 0, 20).unwrap();
        assert!(vt.is_stale(v, 8));
    }

    #[test]
    fn save_prefers_the_shadow_for_dirty_entries() {
        let vt = table();
        let v = vt.allocate();
        vt.change_inode(v, 0, 100).unwrap();
        vt.set_inode(v, 0, 6).unwrap();
        vt.change_inode(v, 0, 200).unwrap(); // dirty again; shadow holds (6)

        let save = vt.save();
        let (_, entry) = save.cache.iter().find(|(vnode, _)| *vnode == v).unwrap();
        assert_eq!(entry.inodes, vec![6]);
        assert_eq!(entry.lbsize, 100);
    }

    #[test]
    fn save_roundtrip() {
        let vt = table();
        let v = vt.allocate();
        let gone = vt.allocate();
        vt.change_inode(v, 0, FBSIZE).unwrap();
        vt.change_inode(v, 1, 321).unwrap();
        vt.set_inode(v, 0, 2).unwrap();
        vt.set_inode(v, 1, 3).unwrap();
        vt.release(gone).unwrap();

        let mut raw = Vec::new();
        vt.save().write(Cursor::new(&mut raw)).unwrap();
        let loaded = VTable::load(VTableSave::read(Cursor::new(raw)).unwrap(), FBSIZE, SBMAX);

        assert!(loaded.contains(v));
        assert_eq!(loaded.get_size(v).unwrap(), FBSIZE + 321);
        assert_eq!(loaded.get_inodes(v).unwrap(), vec![(2, false), (3, true)]);
        assert_eq!(loaded.allocate(), gone);
    }
}
