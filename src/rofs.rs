use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, Request, TimeOrNow,
};
use libdrip::{RoStore, Vnode, ROOT_VNODE};

use crate::direntry::{self, DirTable, FileHeader};
use crate::error::{errno, Result};

const TTL: Duration = Duration::from_secs(1);

struct OpenFile {
    content: Vec<u8>,
    counter: usize,
}

/// The read-only mount. The directory table is re-read once it is older
/// than the refresh threshold; every mutation is refused with EROFS.
pub struct DripFsRo {
    store: RoStore,
    table: DirTable,
    last_table: Instant,
    thresh: Duration,
    open_files: HashMap<Vnode, OpenFile>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl DripFsRo {
    pub fn new(store: RoStore, thresh: Duration) -> Result<Self> {
        let table = match DirTable::load(&store)? {
            Some(table) => table,
            None => return Err(std::io::Error::other("backend has never been mounted read-write").into()),
        };

        Ok(Self {
            store,
            table,
            last_table: Instant::now(),
            thresh,
            open_files: HashMap::new(),
            next_fh: 0,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        })
    }

    /// Re-reads the directory table once it has aged out. A writer syncing
    /// elsewhere may leave it briefly unreadable; the stale copy serves
    /// until the next attempt.
    fn refresh_table(&mut self) {
        if self.last_table.elapsed() <= self.thresh {
            return;
        }

        match DirTable::load(&self.store) {
            Ok(Some(table)) => {
                self.table = table;
                self.last_table = Instant::now();
            }
            Ok(None) => log::warn!("directory table vanished from the backend"),
            Err(err) => log::warn!("directory table refresh failed: {err}"),
        }
    }

    fn attr(&self, header: &FileHeader) -> FileAttr {
        let (size, mtime) = match self.open_files.get(&header.vnode) {
            Some(open) => (
                open.content.len() as u64,
                self.store.get_mtime(header.vnode).unwrap_or(UNIX_EPOCH),
            ),
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
}

impl Filesystem for DripFsRo {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_VNODE {
            reply.error(libc::ENOENT);
            return;
        }
        self.refresh_table();

        match name.to_str().and_then(|name| self.table.lookup(name)) {
            Some(header) => reply.entry(&TTL, &self.attr(header), 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if !self.open_files.contains_key(&ino) {
            self.refresh_table();
        }

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
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if mode.is_some() || size.is_some() {
            reply.error(libc::EROFS);
            return;
        }

        // timestamp-only updates are quietly ignored
        match self.table.by_ino(ino) {
            Some((_, header)) => reply.attr(&TTL, &self.attr(header)),
            None => reply.error(libc::ENOENT),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_APPEND != 0 {
            reply.error(libc::EROFS);
            return;
        }

        self.refresh_table();
        if self.table.by_ino(ino).is_none() {
            reply.error(libc::ENOENT);
            return;
        }

        if let Some(open) = self.open_files.get_mut(&ino) {
            open.counter += 1;
        } else {
            let content = match direntry::read_file(&self.store, ino) {
                Ok(content) => content,
                Err(err) => {
                    log::warn!("open of vnode {ino} failed: {err}");
                    reply.error(errno(&err));
                    return;
                }
            };

            // a length disagreeing with the table means a sync is mid-flight
            let expected = self.store.get_size(ino).unwrap_or(0);
            if content.len() != expected {
                reply.error(libc::EIO);
                return;
            }

            self.open_files.insert(ino, OpenFile { content, counter: 1 });
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
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        reply.error(libc::EROFS);
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
        if let Some(open) = self.open_files.get_mut(&ino) {
            open.counter -= 1;
            if open.counter == 0 {
                self.open_files.remove(&ino);
            }
        }
        reply.ok();
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
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
        self.refresh_table();

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

        reply.statfs(
            blocks,
            0,
            0,
            self.table.entries.len() as u64,
            0,
            geom.blocksize as u32,
            255,
            geom.blocksize as u32,
        );
    }
}
