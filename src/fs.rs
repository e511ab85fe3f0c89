use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libdrip::{RwStore, Vnode, ROOT_VNODE};

use crate::direntry::{self, block_count, DirTable, FileHeader};
use crate::error::{errno, Result};

const TTL: Duration = Duration::from_secs(1);

/// Per-file state between open and the final release: the whole content,
/// which fragments diverged from the engine, and how many handles are out.
struct OpenFile {
    content: Vec<u8>,
    dirty: Vec<bool>,
    counter: usize,
}

/// The writable mount: a flat namespace over the engine, with whole-file
/// buffering per open file and per-fragment write-back on the last close.
pub struct DripFs {
    store: Arc<RwStore>,
    table: DirTable,
    open_files: HashMap<Vnode, OpenFile>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl DripFs {
    pub fn new(store: Arc<RwStore>) -> Result<Self> {
        let table = match DirTable::load(&*store)? {
            Some(table) => table,
            None => {
                log::debug!("backend has no directory table; creating one");
                let table = DirTable::with_root();
                table.save(&store)?;
                table
            }
        };

        Ok(Self {
            store,
            table,
            open_files: HashMap::new(),
            next_fh: 0,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        })
    }

    fn attr(&self, header: &FileHeader) -> FileAttr {
        let (size, mtime) = match self.open_files.get(&header.vnode) {
            Some(open) => (open.content.len() as u64, SystemTime::now()),
            None => (
                self.store.get_size(header.vnode).unwrap_or(0) as u64,
                self.store.get_mtime(header.vnode).unwrap_or(UNIX_EPOCH),
            ),
        };

        FileAttr {
            ino: header.vnode,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: header.ctime(),
            crtime: header.ctime(),
            kind: if header.is_dir() { FileType::Directory } else { FileType::RegularFile },
            perm: (header.mode & 0o7777) as u16,
            nlink: header.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn next_fh(&mut self) -> u64 {
        self.next_fh += 1;
        self.next_fh
    }

    fn truncate(&mut self, vnode: Vnode, length: usize) -> Result<()> {
        let fbsize = self.store.geometry().fbsize;

        if let Some(open) = self.open_files.get_mut(&vnode) {
            open.content.resize(length, 0);
            open.dirty.resize(block_count(length, fbsize), false);
            if length % fbsize != 0
                && let Some(last) = open.dirty.last_mut()
            {
                *last = true;
            }
        }

        self.store.resize(vnode, length)?;
        Ok(())
    }

    fn close_file(&mut self, vnode: Vnode) -> Result<()> {
        let std::collections::hash_map::Entry::Occupied(mut entry) = self.open_files.entry(vnode)
        else {
            return Ok(());
        };

        entry.get_mut().counter -= 1;
        if entry.get().counter > 0 {
            return Ok(());
        }

        let open = entry.remove();
        direntry::write_file(&self.store, vnode, &open.content, &open.dirty)
    }
}

impl Filesystem for DripFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_VNODE {
            reply.error(libc::ENOENT);
            return;
        }

        match name.to_str().and_then(|name| self.table.lookup(name)) {
            Some(header) => reply.entry(&TTL, &self.attr(header), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.table.by_ino(ino) {
            Some((_, header)) => reply.attr(&TTL, &self.attr(header)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some((path, header)) = self.table.by_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = path.clone();
        let mut header = header.clone();

        if let Some(mode) = mode {
            header.mode = (header.mode & libc::S_IFMT) | (mode & 0o7777);
            self.table.entries.insert(path, header.clone());
            if let Err(err) = self.table.save(&self.store) {
                log::warn!("directory table write failed: {err}");
                reply.error(errno(&err));
                return;
            }
        }

        if let Some(size) = size {
            if let Err(err) = self.truncate(ino, size as usize) {
                log::warn!("truncate of vnode {ino} failed: {err}");
                reply.error(errno(&err));
                return;
            }
        }

        if let Some(when) = mtime {
            let when = match when {
                TimeOrNow::SpecificTime(when) => when,
                TimeOrNow::Now => SystemTime::now(),
            };
            if let Err(err) = self.store.set_mtime(ino, when) {
                reply.error(errno(&err.into()));
                return;
            }
        }

        reply.attr(&TTL, &self.attr(&header));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        if parent != ROOT_VNODE {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        if self.table.lookup(name).is_some() {
            reply.error(libc::EEXIST);
            return;
        }

        let vnode = self.store.create();
        let header = FileHeader {
            vnode,
            mode: libc::S_IFREG | (mode & 0o7777),
            ctime_ms: direntry::now_ms(),
            nlink: 1,
        };
        if let Err(err) = self.store.set_mtime(vnode, SystemTime::now()) {
            reply.error(errno(&err.into()));
            return;
        }

        self.table.insert(name, header.clone());
        if let Err(err) = self.table.save(&self.store) {
            log::warn!("directory table write failed: {err}");
            reply.error(errno(&err));
            return;
        }

        self.open_files.insert(vnode, OpenFile {
            content: Vec::new(),
            dirty: Vec::new(),
            counter: 1,
        });

        let fh = self.next_fh();
        reply.created(&TTL, &self.attr(&header), 0, fh, 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.table.by_ino(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }

        if let Some(open) = self.open_files.get_mut(&ino) {
            open.counter += 1;
        } else {
            let content = match direntry::read_file(&*self.store, ino) {
                Ok(content) => content,
                Err(err) => {
                    log::warn!("open of vnode {ino} failed: {err}");
                    reply.error(errno(&err));
                    return;
                }
            };
            let blocks = block_count(content.len(), self.store.geometry().fbsize);
            self.open_files.insert(ino, OpenFile {
                content,
                dirty: vec![false; blocks],
                counter: 1,
            });
        }

        let fh = self.next_fh();
        reply.opened(fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(open) = self.open_files.get(&ino) else {
            reply.error(libc::EIO);
            return;
        };

        let offset = offset.max(0) as usize;
        let end = open.content.len().min(offset.saturating_add(size as usize));
        if offset >= open.content.len() {
            reply.data(&[]);
        } else {
            reply.data(&open.content[offset..end]);
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let fbsize = self.store.geometry().fbsize;
        let Some(open) = self.open_files.get_mut(&ino) else {
            reply.error(libc::EIO);
            return;
        };

        let offset = offset.max(0) as usize;
        let end = offset + data.len();
        if open.content.len() < end {
            open.content.resize(end, 0);
        }
        open.content[offset..end].copy_from_slice(data);

        // every fragment the write touched is dirty, as is anything new
        let blocks = block_count(open.content.len(), fbsize);
        open.dirty.resize(blocks, true);
        for boff in offset / fbsize..=(end.saturating_sub(1)) / fbsize {
            if let Some(flag) = open.dirty.get_mut(boff) {
                *flag = true;
            }
        }

        reply.written(data.len() as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.close_file(ino) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::warn!("write-back of vnode {ino} failed: {err}");
                reply.error(errno(&err));
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        // acknowledged without forcing a drip; an on-demand drip would tie
        // backend writes to client activity
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if parent != ROOT_VNODE {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(header) = self.table.lookup(name).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Err(err) = self.store.delete(header.vnode) {
            reply.error(errno(&err.into()));
            return;
        }
        self.open_files.remove(&header.vnode);
        self.table.remove(name);

        match self.table.save(&self.store) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::warn!("directory table write failed: {err}");
                reply.error(errno(&err));
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        if parent != ROOT_VNODE || newparent != ROOT_VNODE {
            reply.error(libc::ENOENT);
            return;
        }
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Some(header) = self.table.remove(name) else {
            reply.error(libc::ENOENT);
            return;
        };

        // a replaced target's object goes away with its name
        if let Some(replaced) = self.table.remove(newname)
            && let Err(err) = self.store.delete(replaced.vnode)
        {
            log::warn!("deleting replaced vnode {} failed: {err}", replaced.vnode);
        }
        self.table.insert(newname, header);

        match self.table.save(&self.store) {
            Ok(()) => reply.ok(),
            Err(err) => {
                log::warn!("directory table write failed: {err}");
                reply.error(errno(&err));
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_VNODE {
            reply.error(libc::ENOTDIR);
            return;
        }

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ROOT_VNODE, FileType::Directory, ".".to_string()),
            (ROOT_VNODE, FileType::Directory, "..".to_string()),
        ];
        for (name, header) in self.table.names() {
            entries.push((header.vnode, FileType::RegularFile, name.to_string()));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let geom = self.store.geometry();
        let blocks = geom.total_blocks as u64;
        let used = self
            .store
            .size()
            .map(|bytes| bytes.div_ceil(geom.blocksize) as u64)
            .unwrap_or(0);
        let free = blocks.saturating_sub(used + 1);

        reply.statfs(
            blocks,
            free,
            free,
            self.table.entries.len() as u64,
            free,
            geom.blocksize as u32,
            255,
            geom.blocksize as u32,
        );
    }

    fn destroy(&mut self) {
        let vnodes: Vec<Vnode> = self.open_files.keys().copied().collect();
        for vnode in vnodes {
            if let Some(open) = self.open_files.get_mut(&vnode) {
                // force the write-back regardless of outstanding handles
                open.counter = 1;
            }
            if let Err(err) = self.close_file(vnode) {
                log::warn!("write-back of vnode {vnode} on unmount failed: {err}");
            }
        }
    }
}
