// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::{
    FileAttr,
    FileType,
    MountOption,
    ReplyData,
    ReplyDirectory,
    ReplyEntry,
    ReplyOpen,
    Request,
    FUSE_ROOT_ID,
};
use tracing::instrument;

use crate::filesystem::{EntryKind, EnvLinkFs, Node};
use crate::{Error, Result};

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;

/// Options to configure the FUSE filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// The permission bits for the root directory
    pub root_mode: u32,
    /// The permission bits reported for every link
    pub link_mode: u32,
    /// The user id that should own all nodes
    pub uid: nix::unistd::Uid,
    /// The group id that should own all nodes
    pub gid: nix::unistd::Gid,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

/// Assigns inode numbers to variable names.
///
/// The same name always maps to the same inode for the life
/// of the mount, no matter which process asks. What the inode
/// points to is decided again on every request. Names are
/// never released, so the table is bounded only by the set of
/// distinct variable names seen during the mount.
struct Inodes {
    next_inode: AtomicU64,
    names: DashMap<Arc<str>, u64>,
    inodes: DashMap<u64, Arc<str>>,
}

impl Inodes {
    fn new() -> Self {
        Self {
            // the root inode is never allocated from here
            next_inode: AtomicU64::new(FUSE_ROOT_ID + 1),
            names: Default::default(),
            inodes: Default::default(),
        }
    }

    fn inode_for(&self, name: &str) -> u64 {
        if let Some(ino) = self.names.get(name) {
            return *ino;
        }
        *self.names.entry(Arc::from(name)).or_insert_with(|| {
            let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
            self.inodes.insert(ino, Arc::from(name));
            ino
        })
    }

    /// The request path that an inode stands for
    fn path_of(&self, ino: u64) -> Option<String> {
        if ino == FUSE_ROOT_ID {
            return Some("/".to_string());
        }
        self.inodes.get(&ino).map(|name| format!("/{}", name.value()))
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// Maps FUSE's inode based requests onto the paths
/// of the envlinkfs view of each caller
struct Filesystem {
    fs: EnvLinkFs,
    opts: Config,

    // every answer depends on who is asking, so nothing
    // can be cached by the kernel
    ttl: Duration,
    inodes: Inodes,
}

impl Filesystem {
    const BLOCK_SIZE: u32 = 512;

    fn new(fs: EnvLinkFs, opts: Config) -> Self {
        Self {
            fs,
            opts,
            ttl: Duration::ZERO,
            inodes: Inodes::new(),
        }
    }

    fn attr_for_node(&self, node: &Node) -> FileAttr {
        let now = SystemTime::now();
        let (ino, kind, perm, nlink, size) = match node {
            Node::Root => (FUSE_ROOT_ID, FileType::Directory, self.opts.root_mode, 2, 0),
            Node::Link { name, target } => (
                self.inodes.inode_for(name),
                FileType::Symlink,
                self.opts.link_mode,
                1,
                target.len() as u64,
            ),
        };
        FileAttr {
            ino,
            size,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm: perm as u16, // truncate the non-perm bits
            nlink,
            uid: self.opts.uid.as_raw(),
            gid: self.opts.gid.as_raw(),
            rdev: 0,
            blksize: Self::BLOCK_SIZE,
            flags: 0,
        }
    }
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err: Error = $err;
        match &err {
            Error::NotFound(path) => tracing::trace!("{path} = ENOENT"),
            Error::Errno(msg, errno) => tracing::debug!("{msg} = {errno}"),
            _ => tracing::error!("{err:?}"),
        }
        let errno = err.os_error().unwrap_or(libc::EIO);
        $reply.error(errno);
        return;
    }};
}

/// One entry of a directory listing, as it is sent to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedEntry {
    ino: u64,
    /// The offset to resume the listing from after this entry
    offset: i64,
    kind: FileType,
    name: String,
}

impl Filesystem {
    fn path_of(&self, ino: u64) -> Result<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {ino}")))
    }

    fn lookup_node(&self, pid: u32, parent: u64, name: &OsStr) -> Result<Node> {
        if parent != FUSE_ROOT_ID {
            return Err(Error::NotFound(name.to_string_lossy().into_owned()));
        }
        // variables are always utf-8, anything else cannot be one
        let Some(name) = name.to_str() else {
            return Err(Error::NotFound(name.to_string_lossy().into_owned()));
        };
        self.fs.getattr(pid, &format!("/{name}"))
    }

    fn node_of(&self, pid: u32, ino: u64) -> Result<Node> {
        let path = self.path_of(ino)?;
        self.fs.getattr(pid, &path)
    }

    fn link_target(&self, pid: u32, ino: u64) -> Result<String> {
        if ino == FUSE_ROOT_ID {
            return Err(Error::Errno("the root is not a link".into(), libc::EINVAL));
        }
        let path = self.path_of(ino)?;
        self.fs.readlink(pid, &path)
    }

    fn check_opendir(ino: u64) -> Result<()> {
        if ino != FUSE_ROOT_ID {
            return Err(Error::Errno(
                format!("inode {ino} is not a directory"),
                libc::ENOTDIR,
            ));
        }
        Ok(())
    }

    /// Nothing in this filesystem can be opened as a file
    fn open_error(ino: u64, flags: i32) -> Error {
        if flags & (libc::O_WRONLY | libc::O_RDWR) != 0 {
            Error::Errno(format!("open {flags}"), libc::EROFS)
        } else if ino == FUSE_ROOT_ID {
            Error::Errno("the root is a directory".into(), libc::EISDIR)
        } else {
            // the kernel resolves links itself and never reads them as files
            Error::Errno(format!("inode {ino} is a link"), libc::EINVAL)
        }
    }

    /// The listing of a directory for one caller, starting after
    /// the first `offset` entries.
    ///
    /// Each entry's offset is its 1-based position in the listing,
    /// so that the kernel can resume after the last one it received.
    fn listing(
        &self,
        pid: u32,
        ino: u64,
        offset: i64,
    ) -> Result<impl Iterator<Item = ListedEntry> + '_> {
        Self::check_opendir(ino)?;
        let entries = self.fs.readdir(pid, "/")?;
        Ok(entries
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(move |(index, entry)| {
                let (ino, kind) = match entry.kind {
                    EntryKind::Directory => (FUSE_ROOT_ID, FileType::Directory),
                    EntryKind::Symlink => (self.inodes.inode_for(&entry.name), FileType::Symlink),
                };
                ListedEntry {
                    ino,
                    offset: index as i64 + 1,
                    kind,
                    name: entry.name,
                }
            }))
    }
}

// these functions mirror the actual fuse ones, with the
// caller pid pulled out of the request
impl Filesystem {
    fn statfs(&self, reply: fuser::ReplyStatfs) {
        reply.statfs(
            0,
            0,
            0,
            self.inodes.len() as u64 + 1,
            0,
            Self::BLOCK_SIZE,
            u32::MAX,
            Self::BLOCK_SIZE,
        )
    }

    fn lookup(&self, pid: u32, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::trace!("lookup {name:?} for {pid}");
        let node = unwrap!(reply, self.lookup_node(pid, parent, name));
        let attr = self.attr_for_node(&node);
        reply.entry(&self.ttl, &attr, 0);
    }

    fn getattr(&self, pid: u32, ino: u64, reply: fuser::ReplyAttr) {
        let node = unwrap!(reply, self.node_of(pid, ino));
        let attr = self.attr_for_node(&node);
        reply.attr(&self.ttl, &attr);
    }

    fn readlink(&self, pid: u32, ino: u64, reply: ReplyData) {
        let target = unwrap!(reply, self.link_target(pid, ino));
        tracing::trace!("readlink {ino} for {pid} = {target}");
        reply.data(target.as_bytes());
    }

    fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        err!(reply, Self::open_error(ino, flags));
    }

    fn opendir(&self, ino: u64, reply: ReplyOpen) {
        unwrap!(reply, Self::check_opendir(ino));
        // directory contents are recomputed on every read, no
        // handle state is needed
        reply.opened(0, 0);
    }

    fn readdir(&self, pid: u32, ino: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = unwrap!(reply, self.listing(pid, ino, offset));
        for entry in entries {
            let buffer_full = reply.add(entry.ino, entry.offset, entry.kind, &entry.name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives
/// all requests and answers each one from the environment of
/// the process that made it.
pub struct Session {
    inner: Arc<Filesystem>,
    threaded: bool,
}

impl Session {
    /// Construct a new session which serves the provided view.
    ///
    /// Requests are handled on the thread that runs the session
    /// unless [`Session::threaded`] is enabled.
    pub fn new(fs: EnvLinkFs, opts: Config) -> Self {
        Self {
            inner: Arc::new(Filesystem::new(fs, opts)),
            threaded: false,
        }
    }

    /// Handle each request on its own blocking thread of the tokio
    /// runtime that runs the session, so that a process whose
    /// environment cannot be read only holds up its own requests.
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    fn dispatch<F>(&self, op: F)
    where
        F: FnOnce(&Filesystem) + Send + 'static,
    {
        if self.threaded {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let fs = Arc::clone(&self.inner);
                    runtime.spawn_blocking(move || op(&fs));
                    return;
                }
                Err(err) => tracing::warn!("no runtime to dispatch onto: {err}"),
            }
        }
        op(&self.inner)
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        // no extra capabilities are requested, in particular not
        // FUSE_CACHE_SYMLINKS since link targets differ per caller
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        self.dispatch(move |fs| fs.statfs(reply));
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let pid = req.pid();
        let name = name.to_owned();
        self.dispatch(move |fs| fs.lookup(pid, parent, &name, reply));
    }

    fn forget(&mut self, _req: &Request<'_>, _ino: u64, _nlookup: u64) {
        // nothing to do, inodes are tied to names rather than
        // to lookups and live as long as the mount
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: fuser::ReplyAttr) {
        let pid = req.pid();
        self.dispatch(move |fs| fs.getattr(pid, ino, reply));
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let pid = req.pid();
        self.dispatch(move |fs| fs.readlink(pid, ino, reply));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.inner.open(ino, flags, reply);
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        self.inner.opendir(ino, reply);
    }

    #[instrument(skip_all, fields(pid = req.pid()))]
    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let pid = req.pid();
        self.dispatch(move |fs| fs.readdir(pid, ino, offset, reply));
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }
}
