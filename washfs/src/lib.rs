// Copyright 2024 Wash project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time;

use bytes::BytesMut;
use entries::{Action, Context, Entry, Registry, StreamHandle, WashError};
use journal::JournalId;
use log::{debug, warn};
use task_executor::Executor;

type Inode = u64;

const ROOT: Inode = 1;

/// Kernel-side attribute caching is disabled: coherence is the operation cache's job.
const TTL: time::Duration = time::Duration::from_secs(0);

const EPOCH: time::SystemTime = time::SystemTime::UNIX_EPOCH;

#[derive(Clone, Copy, Debug)]
pub enum WashFsEvent {
    Init,
    Destroy,
}

///
/// Inodes are allocated from a monotonically increasing counter and bound to canonical paths.
/// The binding survives TTL-driven re-enumeration for as long as the kernel may reference the
/// inode: lookups are counted, and `forget` releases the binding when the count reaches zero.
///
struct InodeTable {
    by_inode: HashMap<Inode, InodeRecord>,
    by_path: HashMap<String, Inode>,
    next_inode: Inode,
}

struct InodeRecord {
    path: String,
    lookups: u64,
}

impl InodeTable {
    fn new() -> InodeTable {
        InodeTable {
            by_inode: HashMap::new(),
            by_path: HashMap::new(),
            next_inode: 2,
        }
    }

    fn get_or_assign(&mut self, path: &str) -> Inode {
        if let Some(inode) = self.by_path.get(path) {
            return *inode;
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.by_inode.insert(
            inode,
            InodeRecord {
                path: path.to_owned(),
                lookups: 0,
            },
        );
        self.by_path.insert(path.to_owned(), inode);
        inode
    }

    ///
    /// Record one kernel reference against the path's inode, assigning one if needed.
    ///
    fn lookup(&mut self, path: &str) -> Inode {
        let inode = self.get_or_assign(path);
        if let Some(record) = self.by_inode.get_mut(&inode) {
            record.lookups += 1;
        }
        inode
    }

    fn path_of(&self, inode: Inode) -> Option<&str> {
        self.by_inode.get(&inode).map(|record| record.path.as_str())
    }

    fn forget(&mut self, inode: Inode, nlookup: u64) {
        let remove = match self.by_inode.get_mut(&inode) {
            Some(record) => {
                record.lookups = record.lookups.saturating_sub(nlookup);
                record.lookups == 0
            }
            None => false,
        };
        if remove {
            if let Some(record) = self.by_inode.remove(&inode) {
                self.by_path.remove(&record.path);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_inode.len()
    }
}

///
/// Per-open-file state. Size-known reads are stateless (served straight from the cached `read`);
/// only streams and pending writes require a file handle.
///
enum OpenHandle {
    Streaming {
        handle: StreamHandle,
        buffer: BytesMut,
        eof: bool,
    },
    Writing {
        entry: Entry,
        buffer: BytesMut,
    },
}

///
/// Projects the entry tree onto the kernel VFS. Every callback resolves the inode to a
/// canonical path, performs the corresponding capability calls through the registry (and thus
/// the operation cache and journal), and maps failures onto errnos.
///
pub struct WashFs {
    sender: Sender<WashFsEvent>,
    runtime: Executor,
    registry: Arc<Registry>,
    inodes: InodeTable,
    handles: HashMap<u64, OpenHandle>,
    next_handle: u64,
}

impl WashFs {
    pub fn new(sender: Sender<WashFsEvent>, runtime: Executor, registry: Arc<Registry>) -> WashFs {
        WashFs {
            sender,
            runtime,
            registry,
            inodes: InodeTable::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    ///
    /// Tag the request with a journal id derived from the calling process, so that one user
    /// command yields one journal.
    ///
    fn context_for(req: &fuser::Request<'_>) -> Context {
        Context::new(JournalId::for_process(req.pid()))
    }

    fn attr_for(&self, inode: Inode, entry: &Entry) -> fuser::FileAttr {
        let attrs = entry.attributes();
        let kind = if entry.is_container() {
            fuser::FileType::Directory
        } else {
            fuser::FileType::RegularFile
        };
        let perm = match attrs.mode {
            Some(mode) => (mode & 0o7777) as u16,
            None if entry.is_container() => 0o555,
            None if entry.supports(Action::Write) => 0o644,
            None => 0o444,
        };
        fuser::FileAttr {
            ino: inode,
            size: attrs.size.unwrap_or(0),
            blocks: 0,
            atime: attrs.atime.unwrap_or(EPOCH),
            mtime: attrs.mtime.unwrap_or(EPOCH),
            ctime: attrs.ctime.unwrap_or(EPOCH),
            crtime: EPOCH,
            kind,
            perm,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 1,
            flags: 0,
        }
    }

    fn root_attr(inode: Inode) -> fuser::FileAttr {
        fuser::FileAttr {
            ino: inode,
            size: 0,
            blocks: 0,
            atime: EPOCH,
            mtime: EPOCH,
            ctime: EPOCH,
            crtime: EPOCH,
            kind: fuser::FileType::Directory,
            perm: 0o555,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 1,
            flags: 0,
        }
    }

    fn resolve_blocking(&self, context: &Context, path: &str) -> Result<Entry, WashError> {
        let registry = self.registry.clone();
        let context = context.clone();
        let path = path.to_owned();
        self.runtime
            .block_on(async move { registry.resolve(&context, &path).await })
    }

    fn alloc_handle(&mut self, handle: OpenHandle) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, handle);
        fh
    }

    ///
    /// Directory listing for an inode: the synthetic root lists one directory per plugin root;
    /// everything else lists through the cached `list` capability.
    ///
    fn readdir_entries(
        &mut self,
        context: &Context,
        inode: Inode,
    ) -> Result<Vec<(Inode, fuser::FileType, String)>, i32> {
        let mut listing = vec![
            (inode, fuser::FileType::Directory, ".".to_owned()),
            (ROOT, fuser::FileType::Directory, "..".to_owned()),
        ];
        if inode == ROOT {
            let roots: Vec<(String, String)> = self
                .registry
                .roots()
                .map(|root| (root.path_str().to_owned(), root.name().to_owned()))
                .collect();
            for (path, name) in roots {
                let child_inode = self.inodes.get_or_assign(&path);
                listing.push((child_inode, fuser::FileType::Directory, name));
            }
            return Ok(listing);
        }

        let path = self
            .inodes
            .path_of(inode)
            .ok_or(libc::ENOENT)?
            .to_owned();
        let entry = self
            .resolve_blocking(context, &path)
            .map_err(|e| e.errno())?;
        let registry = self.registry.clone();
        let children = {
            let context = context.clone();
            self.runtime
                .block_on(async move { registry.children(&context, &entry).await })
                .map_err(|e| e.errno())?
        };
        for child in children {
            let child_inode = self.inodes.get_or_assign(child.path_str());
            let kind = if child.is_container() {
                fuser::FileType::Directory
            } else {
                fuser::FileType::RegularFile
            };
            listing.push((child_inode, kind, child.name().to_owned()));
        }
        Ok(listing)
    }
}

impl fuser::Filesystem for WashFs {
    fn init(
        &mut self,
        _req: &fuser::Request,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        self.sender.send(WashFsEvent::Init).map_err(|_| 1)
    }

    fn destroy(&mut self) {
        self.sender
            .send(WashFsEvent::Destroy)
            .unwrap_or_else(|err| warn!("Failed to send {:?} event: {}", WashFsEvent::Destroy, err))
    }

    // Used to answer stat calls, and to pin path→inode bindings for the kernel.
    fn lookup(
        &mut self,
        req: &fuser::Request<'_>,
        parent: Inode,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            let context = Self::context_for(req);
            let name = match name.to_str() {
                Some(name) => name,
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
            let path = if parent == ROOT {
                format!("/{name}")
            } else {
                match self.inodes.path_of(parent) {
                    Some(parent_path) => format!("{parent_path}/{name}"),
                    None => {
                        reply.error(libc::ENOENT);
                        return;
                    }
                }
            };
            match self.resolve_blocking(&context, &path) {
                Ok(entry) => {
                    let inode = self.inodes.lookup(&path);
                    reply.entry(&TTL, &self.attr_for(inode, &entry), 1);
                }
                Err(e) => reply.error(e.errno()),
            }
        })
    }

    fn forget(&mut self, _req: &fuser::Request<'_>, inode: Inode, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    fn getattr(&mut self, req: &fuser::Request<'_>, inode: Inode, reply: fuser::ReplyAttr) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            if inode == ROOT {
                reply.attr(&TTL, &Self::root_attr(ROOT));
                return;
            }
            let context = Self::context_for(req);
            let path = match self.inodes.path_of(inode) {
                Some(path) => path.to_owned(),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
            match self.resolve_blocking(&context, &path) {
                Ok(entry) => reply.attr(&TTL, &self.attr_for(inode, &entry)),
                Err(e) => reply.error(e.errno()),
            }
        })
    }

    fn readdir(
        &mut self,
        req: &fuser::Request<'_>,
        inode: Inode,
        _fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            let context = Self::context_for(req);
            match self.readdir_entries(&context, inode) {
                Ok(listing) => {
                    // 0 is a magic offset which means no offset, whereas a non-zero offset means
                    // start _after_ that entry. Inconsistency is fun.
                    let to_skip = if offset == 0 { 0 } else { offset + 1 } as usize;
                    let mut i = offset;
                    for (child_inode, kind, name) in listing.into_iter().skip(to_skip) {
                        if reply.add(child_inode, i, kind, name) {
                            // Buffer is full, don't add more entries.
                            break;
                        }
                        i += 1;
                    }
                    reply.ok();
                }
                Err(errno) => reply.error(errno),
            }
        })
    }

    fn open(&mut self, req: &fuser::Request<'_>, inode: Inode, flags: i32, reply: fuser::ReplyOpen) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            let context = Self::context_for(req);
            let path = match self.inodes.path_of(inode) {
                Some(path) => path.to_owned(),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
            let entry = match self.resolve_blocking(&context, &path) {
                Ok(entry) => entry,
                Err(e) => {
                    reply.error(e.errno());
                    return;
                }
            };

            let for_writing = flags & libc::O_ACCMODE != libc::O_RDONLY;
            if for_writing {
                if !entry.supports(Action::Write) {
                    reply.error(libc::ENOTSUP);
                    return;
                }
                let fh = self.alloc_handle(OpenHandle::Writing {
                    entry,
                    buffer: BytesMut::new(),
                });
                reply.opened(fh, 0);
                return;
            }

            // Size-known files read through the cached `read` capability statelessly; files of
            // unknown size are backed by a `stream` with a buffered reader.
            let size_known = entry.attributes().size.is_some();
            if entry.supports(Action::Read) && size_known {
                reply.opened(0, 0);
            } else if entry.supports(Action::Stream) {
                let registry = self.registry.clone();
                let stream = {
                    let context = context.clone();
                    let entry = entry.clone();
                    self.runtime
                        .block_on(async move { registry.stream(&context, &entry).await })
                };
                match stream {
                    Ok(handle) => {
                        let fh = self.alloc_handle(OpenHandle::Streaming {
                            handle,
                            buffer: BytesMut::new(),
                            eof: false,
                        });
                        reply.opened(fh, 0);
                    }
                    Err(e) => reply.error(e.errno()),
                }
            } else if entry.supports(Action::Read) {
                reply.opened(0, 0);
            } else {
                reply.error(libc::ENOTSUP);
            }
        })
    }

    fn read(
        &mut self,
        req: &fuser::Request<'_>,
        inode: Inode,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            let context = Self::context_for(req);
            let offset = offset.max(0) as usize;
            let wanted = offset + size as usize;

            if let Some(OpenHandle::Streaming { .. }) = self.handles.get(&fh) {
                // Buffer the live stream up to the requested range.
                let result: Result<(usize, usize), i32> = {
                    let runtime = self.runtime.clone();
                    match self.handles.get_mut(&fh) {
                        Some(OpenHandle::Streaming {
                            handle,
                            buffer,
                            eof,
                        }) => loop {
                            if buffer.len() >= wanted || *eof {
                                let begin = offset.min(buffer.len());
                                let end = wanted.min(buffer.len());
                                break Ok((begin, end));
                            }
                            match runtime.block_on(handle.next_chunk()) {
                                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                                Some(Err(e)) => break Err(e.errno()),
                                None => *eof = true,
                            }
                        },
                        _ => Err(libc::EBADF),
                    }
                };
                match result {
                    Ok((begin, end)) => {
                        if let Some(OpenHandle::Streaming { buffer, .. }) = self.handles.get(&fh) {
                            reply.data(&buffer[begin..end]);
                        } else {
                            reply.error(libc::EBADF);
                        }
                    }
                    Err(errno) => reply.error(errno),
                }
                return;
            }

            // Stateless read through the cache.
            let path = match self.inodes.path_of(inode) {
                Some(path) => path.to_owned(),
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
            let registry = self.registry.clone();
            let bytes = self.runtime.block_on(async move {
                let entry = registry.resolve(&context, &path).await?;
                registry.read(&context, &entry).await
            });
            match bytes {
                Ok(bytes) => {
                    let begin = offset.min(bytes.len());
                    let end = wanted.min(bytes.len());
                    reply.data(&bytes[begin..end]);
                }
                Err(e) => reply.error(e.errno()),
            }
        })
    }

    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _inode: Inode,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        match self.handles.get_mut(&fh) {
            Some(OpenHandle::Writing { buffer, .. }) => {
                // The capability vocabulary has whole-value writes, so kernel writes accumulate
                // in order and are issued as one `write` on release.
                if offset.max(0) as usize != buffer.len() {
                    reply.error(libc::EINVAL);
                    return;
                }
                buffer.extend_from_slice(data);
                reply.written(data.len() as u32);
            }
            _ => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        req: &fuser::Request<'_>,
        _inode: Inode,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        runtime.enter(|| match self.handles.remove(&fh) {
            Some(OpenHandle::Streaming { handle, .. }) => {
                handle.cancel();
                reply.ok();
            }
            Some(OpenHandle::Writing { entry, buffer }) => {
                let context = Self::context_for(req);
                let registry = self.registry.clone();
                let result = self.runtime.block_on(async move {
                    registry.write(&context, &entry, buffer.freeze()).await
                });
                match result {
                    Ok(()) => reply.ok(),
                    Err(e) => reply.error(e.errno()),
                }
            }
            None => reply.ok(),
        })
    }

    fn unlink(
        &mut self,
        req: &fuser::Request<'_>,
        parent: Inode,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        let runtime = self.runtime.clone();
        runtime.enter(|| {
            let context = Self::context_for(req);
            let name = match name.to_str() {
                Some(name) => name,
                None => {
                    reply.error(libc::ENOENT);
                    return;
                }
            };
            let path = if parent == ROOT {
                format!("/{name}")
            } else {
                match self.inodes.path_of(parent) {
                    Some(parent_path) => format!("{parent_path}/{name}"),
                    None => {
                        reply.error(libc::ENOENT);
                        return;
                    }
                }
            };
            let registry = self.registry.clone();
            let result = self.runtime.block_on(async move {
                let entry = registry.resolve(&context, &path).await?;
                registry.delete(&context, &entry).await
            });
            match result {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        })
    }

    // If this isn't implemented, OSX will try to manipulate ._ files to manage xattrs out of band, which adds both overhead and logspam.
    fn listxattr(
        &mut self,
        _req: &fuser::Request<'_>,
        _inode: Inode,
        _size: u32,
        reply: fuser::ReplyXattr,
    ) {
        reply.size(0);
    }
}

///
/// Mount the registry at the given path. The returned session must be kept alive for the
/// lifetime of the mount; the receiver reports Init and Destroy events.
///
pub fn mount<P: AsRef<Path>>(
    mount_path: P,
    registry: Arc<Registry>,
    runtime: Executor,
) -> std::io::Result<(fuser::BackgroundSession, Receiver<WashFsEvent>)> {
    let options = vec![
        fuser::MountOption::FSName("wash".to_owned()),
        fuser::MountOption::CUSTOM("noapplexattr".to_owned()),
    ];

    let (sender, receiver) = channel();
    let fs = WashFs::new(sender, runtime, registry);

    debug!("About to spawn_mount with options {:?}", options);
    let result = fuser::spawn_mount2(fs, &mount_path, &options);
    // N.B.: The session won't be used by the caller, but we return it since a reference must be
    // maintained to prevent early dropping which unmounts the filesystem.
    result.map(|session| (session, receiver))
}
