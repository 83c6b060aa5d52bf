//! fuser glue: translates kernel requests into core calls.
//!
//! Each callback blocks on the core's async operation through a runtime
//! handle; remote transfers inside one operation still fan out on the
//! runtime's worker threads.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{FileHandle, FileStat, FsCore, RequestContext};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Attribute answers are authoritative in the core, never in the kernel.
const TTL: Duration = Duration::from_secs(0);

/// FUSE filesystem over the mount core.
pub struct BosfsFs {
    core: Arc<FsCore>,
    rt: Handle,
    inodes: RwLock<crate::inode_table::InodeTable>,
    handles: RwLock<HashMap<u64, FileHandle>>,
    next_fh: AtomicU64,
}

impl BosfsFs {
    pub fn new(core: Arc<FsCore>, rt: Handle) -> Self {
        Self {
            core,
            rt,
            inodes: RwLock::new(crate::inode_table::InodeTable::new()),
            handles: RwLock::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn ctx(req: &Request<'_>) -> RequestContext {
        RequestContext {
            uid: req.uid(),
            gid: req.gid(),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes
            .read()
            .unwrap()
            .path_of(ino)
            .map(str::to_string)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let name = name.to_str()?;
        self.inodes.read().unwrap().child_path(parent, name)
    }

    fn register_handle(&self, handle: FileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().unwrap().insert(fh, handle);
        fh
    }

    fn handle(&self, fh: u64) -> Option<FileHandle> {
        self.handles.read().unwrap().get(&fh).cloned()
    }

    fn file_attr(&self, ino: u64, st: &FileStat) -> FileAttr {
        let kind = match st.mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        };
        FileAttr {
            ino,
            size: st.size,
            blocks: st.blocks,
            atime: time_from_secs(st.atime),
            mtime: time_from_secs(st.mtime),
            ctime: time_from_secs(st.ctime),
            crtime: time_from_secs(st.ctime),
            kind,
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink,
            uid: st.uid,
            gid: st.gid,
            rdev: 0,
            blksize: st.blksize,
            flags: 0,
        }
    }
}

fn time_from_secs(secs: i64) -> SystemTime {
    if secs <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    }
}

fn mtime_secs(t: TimeOrNow) -> i64 {
    match t {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
    }
}

macro_rules! path_or_reply {
    ($self:expr, $ino:expr, $reply:expr) => {
        match $self.path_of($ino) {
            Some(path) => path,
            None => {
                $reply.error(libc::ENOENT);
                return;
            }
        }
    };
}

macro_rules! child_or_reply {
    ($self:expr, $parent:expr, $name:expr, $reply:expr) => {
        match $self.child_path($parent, $name) {
            Some(path) => path,
            None => {
                $reply.error(libc::ENOENT);
                return;
            }
        }
    };
}

impl Filesystem for BosfsFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("filesystem initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        info!("filesystem shut down");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.getattr(&ctx, &path)) {
            Ok(st) => {
                let ino = self.inodes.write().unwrap().assign(&path);
                reply.entry(&TTL, &self.file_attr(ino, &st), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.getattr(&ctx, &path)) {
            Ok(st) => reply.attr(&TTL, &self.file_attr(ino, &st)),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
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
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        let result = self.rt.block_on(async {
            if let Some(mode) = mode {
                self.core.chmod(&ctx, &path, mode & 0o7777).await?;
            }
            if uid.is_some() || gid.is_some() {
                self.core
                    .chown(&ctx, &path, uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))
                    .await?;
            }
            if let Some(size) = size {
                self.core.truncate(&ctx, &path, size).await?;
            }
            if let Some(mtime) = mtime {
                self.core.utimens(&ctx, &path, mtime_secs(mtime)).await?;
            }
            self.core.getattr(&ctx, &path).await
        });
        match result {
            Ok(st) => reply.attr(&TTL, &self.file_attr(ino, &st)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        let result = self.rt.block_on(async {
            self.core.mknod(&ctx, &path, mode).await?;
            self.core.getattr(&ctx, &path).await
        });
        match result {
            Ok(st) => {
                let ino = self.inodes.write().unwrap().assign(&path);
                reply.entry(&TTL, &self.file_attr(ino, &st), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        let result = self.rt.block_on(async {
            self.core.mkdir(&ctx, &path, mode).await?;
            self.core.getattr(&ctx, &path).await
        });
        match result {
            Ok(st) => {
                let ino = self.inodes.write().unwrap().assign(&path);
                reply.entry(&TTL, &self.file_attr(ino, &st), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.unlink(&ctx, &path)) {
            Ok(()) => {
                self.inodes.write().unwrap().forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.rmdir(&ctx, &path)) {
            Ok(()) => {
                self.inodes.write().unwrap().forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = child_or_reply!(self, parent, link_name, reply);
        let Some(target) = target.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = Self::ctx(req);
        let result = self.rt.block_on(async {
            self.core.symlink(&ctx, target, &path).await?;
            self.core.getattr(&ctx, &path).await
        });
        match result {
            Ok(st) => {
                let ino = self.inodes.write().unwrap().assign(&path);
                reply.entry(&TTL, &self.file_attr(ino, &st), 0);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.readlink(&ctx, &path)) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = child_or_reply!(self, parent, name, reply);
        let to = child_or_reply!(self, newparent, newname, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.rename(&ctx, &from, &to, flags)) {
            Ok(()) => {
                self.inodes.write().unwrap().rename(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.open(&ctx, &path, flags)) {
            Ok(handle) => reply.opened(self.register_handle(handle), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = child_or_reply!(self, parent, name, reply);
        let ctx = Self::ctx(req);
        let result = self.rt.block_on(async {
            let handle = self.core.create(&ctx, &path, mode).await?;
            let st = self.core.getattr(&ctx, &path).await?;
            Ok::<_, common::FsError>((handle, st))
        });
        match result {
            Ok((handle, st)) => {
                let ino = self.inodes.write().unwrap().assign(&path);
                let fh = self.register_handle(handle);
                reply.created(&TTL, &self.file_attr(ino, &st), 0, fh, flags as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self
            .rt
            .block_on(self.core.read(&handle, &mut buf, offset.max(0) as u64))
        {
            Ok(n) => {
                buf.truncate(n);
                reply.data(&buf);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self
            .rt
            .block_on(self.core.write(&handle, data, offset.max(0) as u64))
        {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.rt.block_on(self.core.flush(&handle)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match self.rt.block_on(self.core.fsync(&handle, datasync)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let handle = self.handles.write().unwrap().remove(&fh);
        if let Some(handle) = handle {
            if let Err(err) = self.rt.block_on(self.core.release(&handle)) {
                debug!(error = %err, "release failed");
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.opendir(&ctx, &path)) {
            Ok(()) => reply.opened(0, 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        let entries = match self.rt.block_on(self.core.read_dir(&ctx, &path)) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        let dot_entries = [(ino, "."), (ino, "..")];
        for (idx, (entry_ino, name)) in dot_entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, idx as i64 + 1, FileType::Directory, name) {
                reply.ok();
                return;
            }
        }
        for (idx, entry) in entries
            .iter()
            .enumerate()
            .skip((offset as usize).saturating_sub(2))
        {
            let child_ino = {
                let mut inodes = self.inodes.write().unwrap();
                match inodes.child_path(ino, &entry.name) {
                    Some(path) => inodes.assign(&path),
                    None => continue,
                }
            };
            let kind = match entry.stat.mode & libc::S_IFMT {
                libc::S_IFDIR => FileType::Directory,
                libc::S_IFLNK => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            if reply.add(child_ino, idx as i64 + 3, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.core.statfs();
        reply.statfs(
            stat.blocks,
            stat.bfree,
            stat.bavail,
            0,
            0,
            stat.bsize,
            stat.namemax,
            stat.bsize,
        );
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = path_or_reply!(self, ino, reply);
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = Self::ctx(req);
        let create_only = flags & libc::XATTR_CREATE != 0;
        let replace_only = flags & libc::XATTR_REPLACE != 0;
        match self.rt.block_on(self.core.setxattr(
            &ctx,
            &path,
            name,
            value,
            create_only,
            replace_only,
        )) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = path_or_reply!(self, ino, reply);
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.getxattr(&ctx, &path, name)) {
            Ok(value) => {
                if size == 0 {
                    reply.size(value.len() as u32);
                } else if (value.len() as u32) > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&value);
                }
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.listxattr(&ctx, &path)) {
            Ok(names) => {
                let mut buf = Vec::new();
                for name in names {
                    buf.extend_from_slice(name.as_bytes());
                    buf.push(0);
                }
                if size == 0 {
                    reply.size(buf.len() as u32);
                } else if (buf.len() as u32) > size {
                    reply.error(libc::ERANGE);
                } else {
                    reply.data(&buf);
                }
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = path_or_reply!(self, ino, reply);
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = Self::ctx(req);
        match self.rt.block_on(self.core.removexattr(&ctx, &path, name)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = path_or_reply!(self, ino, reply);
        let ctx = Self::ctx(req);
        match self
            .rt
            .block_on(self.core.access(&ctx, &path, mask as u32))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }
}
