use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use libdrip::{FragmentStore, RwStore, Vnode, ROOT_VNODE};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Metadata for one name in the flat namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub vnode: Vnode,
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub ctime_ms: u64,
    pub nlink: u32,
}

impl FileHeader {
    pub fn ctime(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.ctime_ms)
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

/// The directory table: a flat map from path to header, serialized as JSON
/// into the reserved vnode. Keys are `/` for the root and `/<name>` for
/// files; there is no hierarchy.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DirTable {
    pub entries: BTreeMap<String, FileHeader>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl DirTable {
    /// A table holding only the root directory, for a backend mounted for
    /// the first time.
    pub fn with_root() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("/".to_string(), FileHeader {
            vnode: ROOT_VNODE,
            mode: libc::S_IFDIR | 0o755,
            ctime_ms: now_ms(),
            nlink: 2,
        });
        Self { entries }
    }

    pub fn lookup(&self, name: &str) -> Option<&FileHeader> {
        self.entries.get(&format!("/{name}"))
    }

    pub fn by_ino(&self, ino: u64) -> Option<(&String, &FileHeader)> {
        self.entries.iter().find(|(_, header)| header.vnode == ino)
    }

    /// File names without their leading slash, for directory listings.
    pub fn names(&self) -> impl Iterator<Item = (&str, &FileHeader)> {
        self.entries
            .iter()
            .filter(|(path, _)| path.as_str() != "/")
            .map(|(path, header)| (&path[1..], header))
    }

    pub fn insert(&mut self, name: &str, header: FileHeader) {
        self.entries.insert(format!("/{name}"), header);
    }

    pub fn remove(&mut self, name: &str) -> Option<FileHeader> {
        self.entries.remove(&format!("/{name}"))
    }

    /// Reads the table out of the reserved vnode. `None` on a backend that
    /// has never been mounted read-write.
    pub fn load(store: &impl FragmentStore) -> Result<Option<Self>> {
        let data = read_file(store, ROOT_VNODE)?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// Writes the table back into the reserved vnode, resizing it first so a
    /// shrunken table leaves no trailing fragments behind.
    pub fn save(&self, store: &RwStore) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        store.resize(ROOT_VNODE, data.len())?;
        let blocks = block_count(data.len(), store.geometry().fbsize);
        write_file(store, ROOT_VNODE, &data, &vec![true; blocks])
    }
}

pub fn block_count(size: usize, fbsize: usize) -> usize {
    size.div_ceil(fbsize)
}

/// Materializes a whole object. An unreachable fragment fails the read; the
/// caller surfaces that as an I/O error rather than serving a torn file.
pub fn read_file(store: &impl FragmentStore, vnode: Vnode) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for boff in 0..store.num_blocks(vnode)? {
        match store.get(vnode, boff)? {
            Some(chunk) => out.extend_from_slice(&chunk),
            None => return Err(std::io::Error::other("file has an unreachable fragment").into()),
        }
    }
    Ok(out)
}

/// Writes the dirty fragments of an object back to the engine.
pub fn write_file(store: &RwStore, vnode: Vnode, data: &[u8], dirty: &[bool]) -> Result<()> {
    if dirty.iter().any(|&flag| flag) {
        store.set_mtime(vnode, SystemTime::now())?;
    }

    for (boff, chunk) in data.chunks(store.geometry().fbsize).enumerate() {
        if dirty.get(boff).copied().unwrap_or(true) {
            store.set(vnode, boff, chunk)?;
        }
    }

    Ok(())
}
