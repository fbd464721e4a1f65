use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EINVAL, EIO, ENOENT, ENOTDIR};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{Attr, EntryKind, FsError, VaultFs};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

struct InodeMap {
    next: u64,
    path_to_ino: HashMap<String, u64>,
    ino_to_path: HashMap<u64, String>,
}

impl InodeMap {
    fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();
        path_to_ino.insert("/".to_string(), ROOT_INO);
        ino_to_path.insert(ROOT_INO, "/".to_string());
        Self {
            next: ROOT_INO + 1,
            path_to_ino,
            ino_to_path,
        }
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(existing) = self.path_to_ino.get(path) {
            return *existing;
        }
        let ino = self.next;
        self.next += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn forget(&mut self, path: &str) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Keeps the inode of `from` so open handles follow the rename.
    fn rename(&mut self, from: &str, to: &str) {
        self.forget(to);
        if let Some(ino) = self.path_to_ino.remove(from) {
            self.path_to_ino.insert(to.to_string(), ino);
            self.ino_to_path.insert(ino, to.to_string());
        }
    }
}

/// `fuser` adapter; every callback blocks on the projection through the
/// runtime handle it was mounted from.
struct MountedFs {
    fs: VaultFs,
    runtime: Handle,
    inodes: Mutex<InodeMap>,
}

impl MountedFs {
    fn new(fs: VaultFs, runtime: Handle) -> Self {
        Self {
            fs,
            runtime,
            inodes: Mutex::new(InodeMap::new()),
        }
    }

    fn path_for(&self, ino: u64) -> Result<String, i32> {
        self.inodes
            .lock()
            .map_err(|_| EIO)?
            .path_for(ino)
            .ok_or(ENOENT)
    }

    fn inode_for(&self, path: &str) -> Result<u64, i32> {
        Ok(self.inodes.lock().map_err(|_| EIO)?.inode_for(path))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        if parent != ROOT_INO {
            return Err(ENOTDIR);
        }
        let name = name.to_str().ok_or(EINVAL)?;
        Ok(format!("/{name}"))
    }

    fn entry(&self, path: &str) -> Result<FileAttr, i32> {
        let attr = self
            .runtime
            .block_on(self.fs.getattr(path))
            .map_err(|err| errno("getattr", path, err))?;
        let ino = self.inode_for(path)?;
        Ok(to_file_attr(ino, &attr))
    }
}

impl Filesystem for MountedFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self
            .child_path(parent, name)
            .and_then(|path| self.entry(&path))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.path_for(ino).and_then(|path| self.entry(&path)) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
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
        let result = self.path_for(ino).and_then(|path| {
            if let Some(size) = size {
                self.runtime
                    .block_on(self.fs.truncate(&path, size))
                    .map_err(|err| errno("truncate", &path, err))?;
            }
            self.entry(&path)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
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
        if ino != ROOT_INO {
            reply.error(ENOTDIR);
            return;
        }
        let names = match self.runtime.block_on(self.fs.readdir("/")) {
            Ok(names) => names,
            Err(err) => {
                reply.error(errno("readdir", "/", err));
                return;
            }
        };
        let mut entries = vec![
            (ROOT_INO, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
        ];
        for name in names {
            let child_ino = match self.inode_for(&format!("/{name}")) {
                Ok(ino) => ino,
                Err(code) => {
                    reply.error(code);
                    return;
                }
            };
            entries.push((child_ino, FileType::RegularFile, name));
        }

        for (idx, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*entry_ino, (idx + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = self.path_for(ino).and_then(|path| {
            self.runtime
                .block_on(self.fs.open(&path))
                .map_err(|err| errno("open", &path, err))
        });
        match result {
            Ok(()) => reply.opened(0, 0),
            Err(code) => reply.error(code),
        }
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
        let result = self.path_for(ino).and_then(|path| {
            self.runtime
                .block_on(self.fs.read(&path, offset.max(0) as u64, size as usize))
                .map_err(|err| errno("read", &path, err))
        });
        match result {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
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
        let result = self.path_for(ino).and_then(|path| {
            self.runtime
                .block_on(self.fs.write(&path, offset.max(0) as u64, data))
                .map_err(|err| errno("write", &path, err))
        });
        match result {
            Ok(written) => reply.written(written as u32),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.runtime
                .block_on(self.fs.create(&path))
                .map_err(|err| errno("create", &path, err))?;
            self.entry(&path)
        });
        match result {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let result = self.path_for(ino).and_then(|path| {
            self.runtime
                .block_on(self.fs.flush(&path))
                .map_err(|err| errno("flush", &path, err))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
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
        let result = self.path_for(ino).and_then(|path| {
            self.runtime
                .block_on(self.fs.release(&path))
                .map_err(|err| errno("release", &path, err))
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_path(parent, name).and_then(|path| {
            self.runtime
                .block_on(self.fs.unlink(&path))
                .map_err(|err| errno("unlink", &path, err))?;
            if let Ok(mut inodes) = self.inodes.lock() {
                inodes.forget(&path);
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
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
        let result = self.child_path(parent, name).and_then(|from| {
            let to = self.child_path(newparent, newname)?;
            self.runtime
                .block_on(self.fs.rename(&from, &to))
                .map_err(|err| errno("rename", &from, err))?;
            if let Ok(mut inodes) = self.inodes.lock() {
                inodes.rename(&from, &to);
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }
}

fn errno(op: &str, path: &str, err: FsError) -> i32 {
    let code = err.errno();
    if code == EIO {
        warn!(op, path, error = %err, "filesystem operation failed");
    } else {
        debug!(op, path, error = %err, "filesystem operation rejected");
    }
    code
}

fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
    let (kind, perm, nlink) = match attr.kind {
        EntryKind::Directory => (FileType::Directory, 0o755, 2),
        EntryKind::File => (FileType::RegularFile, 0o644, 1),
    };
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: attr.modified,
        mtime: attr.modified,
        ctime: attr.modified,
        crtime: attr.modified,
        kind,
        perm,
        nlink,
        uid: unsafe { libc::geteuid() },
        gid: unsafe { libc::getegid() },
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

/// Mounts `fs` at `mountpoint` and serves it until ctrl-c, then unmounts.
/// Unflushed write buffers are discarded.
pub async fn mount_until_ctrl_c(fs: VaultFs, mountpoint: &Path) -> io::Result<()> {
    std::fs::create_dir_all(mountpoint)?;
    let options = [
        MountOption::FSName("tgvault".to_string()),
        MountOption::DefaultPermissions,
    ];
    let session = fuser::spawn_mount2(
        MountedFs::new(fs, Handle::current()),
        mountpoint,
        &options,
    )?;
    info!(mountpoint = %mountpoint.display(), "mounted, press ctrl-c to unmount");
    tokio::signal::ctrl_c().await?;
    drop(session);
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_map_starts_at_root_and_follows_renames() {
        let mut map = InodeMap::new();
        assert_eq!(map.path_for(ROOT_INO).as_deref(), Some("/"));
        let a = map.inode_for("/a");
        assert_eq!(map.inode_for("/a"), a);
        let b = map.inode_for("/b");
        assert_ne!(a, b);

        map.rename("/a", "/b");
        assert_eq!(map.path_for(a).as_deref(), Some("/b"));
        assert_eq!(map.path_for(b), None);
        assert_eq!(map.inode_for("/b"), a);

        map.forget("/b");
        assert_eq!(map.path_for(a), None);
    }

    #[test]
    fn attrs_carry_kind_and_size() {
        let attr = to_file_attr(
            5,
            &Attr {
                kind: EntryKind::File,
                size: 1025,
                modified: SystemTime::UNIX_EPOCH,
            },
        );
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.perm, 0o644);
    }
}
