mod file_attr;

pub mod fuse;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuse_backend_rs::abi::fuse_abi::{stat64, Attr};
use fuse_backend_rs::api::filesystem::{
    Context, DirEntry as FuseDirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyWriter,
};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use self::file_attr::gen_file_attr;
use crate::manifest::{self, Descriptor, ImageManifest, ResourceKind};
use crate::puller::{BlobReader, Puller};
use crate::tree::{ImageTree, TreeItem, TreeNode};
use crate::Error;

/// The default entry and attribute timeout handed to the kernel.
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(180);

/// Describes what to mount.
#[derive(Clone, Debug)]
pub struct Options {
    /// The image location, passed to the [Puller] as-is.
    pub image: String,
    /// The reference name (tag) to resolve in the index of the image.
    pub ref_name: String,
    /// How long the kernel may cache attributes.
    pub attr_timeout: Duration,
    /// How long the kernel may cache name lookups.
    pub entry_timeout: Duration,
}

impl Options {
    pub fn new(image: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ref_name: ref_name.into(),
            attr_timeout: DEFAULT_CACHE_TIMEOUT,
            entry_timeout: DEFAULT_CACHE_TIMEOUT,
        }
    }
}

/// An entry returned by [LazyFs::open_dir].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: u64,
    /// The file type bits of the POSIX mode (`S_IFDIR`, `S_IFLNK`, `S_IFREG`).
    pub file_type: u32,
}

fn enoent() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn eio() -> io::Error {
    io::Error::from_raw_os_error(libc::EIO)
}

/// A read-only filesystem presenting an image, pulling file contents on
/// first open.
///
/// The tree of the image is built once, in [LazyFs::load], and never changes
/// afterwards. All metadata requests are answered from it. Opening a regular
/// file pulls its content through the [Puller], which is expected to be a
/// [crate::puller::BlobCache], so every blob is only transferred once.
///
/// Inodes are assigned while building the tree, the root always has
/// [crate::tree::ROOT_INODE], which is the inode FUSE uses for the root.
///
/// Errors are logged, but only `ENOENT` and `EIO` are returned to callers.
pub struct LazyFs<P> {
    puller: P,
    opts: Options,
    tree: ImageTree,

    /// This holds all open file handles
    #[allow(clippy::type_complexity)]
    file_handles: RwLock<HashMap<u64, Arc<tokio::sync::Mutex<Box<dyn BlobReader>>>>>,

    next_file_handle: AtomicU64,

    tokio_handle: tokio::runtime::Handle,
}

impl<P> LazyFs<P>
where
    P: Puller,
{
    /// Resolves the reference name in the index of the image, and builds the
    /// tree out of all layers of the image manifest.
    ///
    /// Must be called from within a tokio runtime, which is used to serve
    /// FUSE requests later on.
    #[instrument(skip_all, fields(image=%opts.image, ref_name=%opts.ref_name, indicatif.pb_show=1), err)]
    pub async fn load(puller: P, opts: Options) -> Result<Self, Error> {
        let span = Span::current();
        span.pb_set_style(&lazyfs_tracing::PB_PROGRESS_STYLE);
        span.pb_set_message("Loading layers");
        span.pb_start();

        let index = puller.pull_index(&opts.image).await?;
        let manifest_desc = index.resolve(&opts.ref_name)?;
        debug!(manifest.digest=%manifest_desc.digest, "resolved reference name");

        let manifest: ImageManifest =
            serde_json::from_slice(&read_blob(&puller, &opts.image, manifest_desc).await?)?;

        span.pb_set_length(manifest.layers.len() as u64);

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            // check before pulling anything.
            if desc.media_type != manifest::MEDIA_TYPE_CONTINUITY_MANIFEST {
                return Err(Error::UnsupportedMediaType(desc.media_type.clone()));
            }

            let data = read_blob(&puller, &opts.image, desc).await?;
            layers.push(manifest::parse_layer(desc, &data)?);
            span.pb_inc(1);
        }

        let tree = ImageTree::from_layers(layers)?;
        info!(layers = manifest.layers.len(), "loaded image");

        Ok(Self {
            puller,
            opts,
            tree,
            file_handles: RwLock::new(Default::default()),
            next_file_handle: AtomicU64::new(1),
            tokio_handle: tokio::runtime::Handle::current(),
        })
    }

    /// Looks up the node at path. Paths containing `.` or `..` don't exist.
    fn node_by_path(&self, path: &str) -> io::Result<(&TreeNode<TreeItem>, &TreeItem)> {
        match self.tree.lookup(path) {
            Ok(Some(node)) => Ok((node, payload(node)?)),
            Ok(None) => Err(enoent()),
            Err(e) => {
                debug!(err=%e, path, "rejected path");
                Err(enoent())
            }
        }
    }

    fn node_by_inode(&self, inode: u64) -> io::Result<(&TreeNode<TreeItem>, &TreeItem)> {
        match self.tree.lookup_inode(inode) {
            Some((_, node)) => Ok((node, payload(node)?)),
            None => Err(enoent()),
        }
    }

    /// Returns the attributes of the node at path.
    pub fn get_attr(&self, path: &str) -> io::Result<Attr> {
        let (_, item) = self.node_by_path(path)?;
        Ok(gen_file_attr(item))
    }

    /// Lists the children of the directory at path, ordered by name.
    pub fn open_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let (node, item) = self.node_by_path(path)?;
        list_dir(node, item)
    }

    /// Returns the target of the symlink at path.
    pub fn readlink(&self, path: &str) -> io::Result<String> {
        let (_, item) = self.node_by_path(path)?;
        symlink_target(item).map(str::to_string)
    }

    /// Opens the regular file at path, pulling its content if needed.
    /// Returns a handle to pass to [LazyFs::read] and [LazyFs::release].
    pub async fn open(&self, path: &str) -> io::Result<u64> {
        let (_, item) = self.node_by_path(path)?;
        self.open_item(item).await
    }

    #[instrument(skip_all, fields(rq.inode = item.inode), err)]
    async fn open_item(&self, item: &TreeItem) -> io::Result<u64> {
        if item.resource.kind() != ResourceKind::Regular {
            warn!(path=?item.resource.path, "not a regular file");
            return Err(eio());
        }

        let digest = match item.resource.content_digest() {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                warn!(path=?item.resource.path, "no digest for regular file");
                return Err(eio());
            }
            Err(e) => {
                warn!(path=?item.resource.path, err=%e, "invalid digest");
                return Err(eio());
            }
        };

        let blob_reader = match self.puller.pull_blob(&self.opts.image, &digest).await {
            Ok(blob_reader) => blob_reader,
            Err(e) => {
                warn!(path=?item.resource.path, blob.digest=%digest, err=%e, "error pulling blob");
                return Err(eio());
            }
        };

        // TODO: this will overflow after 2**64 operations,
        // which is fine for now.
        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);

        debug!("add file handle {}", fh);
        self.file_handles
            .write()
            .insert(fh, Arc::new(tokio::sync::Mutex::new(blob_reader)));

        Ok(fh)
    }

    /// Reads up to size bytes at offset from an open file.
    /// Returns less than size bytes only at the end of the file.
    pub async fn read(&self, handle: u64, offset: u64, size: u32) -> io::Result<Vec<u8>> {
        let blob_reader = match self.file_handles.read().get(&handle) {
            Some(blob_reader) => blob_reader.clone(),
            None => {
                warn!("file handle {} unknown", handle);
                return Err(eio());
            }
        };

        let mut blob_reader = blob_reader.lock().await;

        // seek to the offset specified, which is relative to the start of the file.
        match blob_reader.seek(io::SeekFrom::Start(offset)).await {
            Ok(pos) => {
                debug_assert_eq!(offset, pos);
            }
            Err(e) => {
                warn!("failed to seek to offset {}: {}", offset, e);
                return Err(eio());
            }
        }

        let mut buf: Vec<u8> = Vec::with_capacity(size as usize);

        // copy things from the internal buffer into buf to fill it till up until size
        if let Err(e) =
            tokio::io::copy(&mut blob_reader.as_mut().take(size as u64), &mut buf).await
        {
            warn!("failed to read {} bytes at offset {}: {}", size, offset, e);
            return Err(eio());
        }

        Ok(buf)
    }

    /// Closes a file handle. Unknown handles are ignored.
    pub fn release(&self, handle: u64) {
        // remove and get ownership on the blob reader
        match self.file_handles.write().remove(&handle) {
            // drop it, which will close it.
            Some(blob_reader) => drop(blob_reader),
            None => {
                debug!("file_handle {} not found", handle);
            }
        }
    }
}

/// Reads a manifest blob into memory. The size in the descriptor is checked,
/// not trusted.
async fn read_blob<P: Puller>(puller: &P, image: &str, desc: &Descriptor) -> Result<Vec<u8>, Error> {
    // one more byte than announced, to notice blobs larger than that.
    let mut r = puller
        .pull_blob(image, &desc.digest)
        .await?
        .take(desc.size.saturating_add(1));
    let mut buf = Vec::new();
    r.read_to_end(&mut buf).await?;

    if buf.len() as u64 != desc.size {
        return Err(Error::Malformed(format!(
            "blob {} has {} bytes, descriptor says {}",
            desc.digest,
            buf.len(),
            desc.size
        )));
    }
    Ok(buf)
}

/// Every node has a payload once the tree is built, a missing one is a bug.
fn payload(node: &TreeNode<TreeItem>) -> io::Result<&TreeItem> {
    node.payload().ok_or_else(|| {
        warn!("node without payload");
        eio()
    })
}

#[allow(clippy::unnecessary_cast)] // libc::S_IFMT is u32 on Linux and u16 on MacOS
fn file_type(item: &TreeItem) -> u32 {
    item.resource.posix_mode() & libc::S_IFMT as u32
}

fn list_dir(node: &TreeNode<TreeItem>, item: &TreeItem) -> io::Result<Vec<DirEntry>> {
    if item.resource.kind() != ResourceKind::Directory {
        warn!(rq.inode = item.inode, "not a directory");
        return Err(eio());
    }

    node.children()
        .map(|(name, child)| {
            let child_item = payload(child)?;
            Ok(DirEntry {
                name: name.to_string(),
                inode: child_item.inode,
                file_type: file_type(child_item),
            })
        })
        .collect()
}

fn symlink_target(item: &TreeItem) -> io::Result<&str> {
    if item.resource.kind() != ResourceKind::Symlink {
        warn!(rq.inode = item.inode, "not a symlink");
        return Err(eio());
    }
    Ok(&item.resource.target)
}

impl<P> FileSystem for LazyFs<P>
where
    P: Puller,
{
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        Ok(FsOptions::empty())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(stat64, Duration)> {
        let (_, item) = self.node_by_inode(inode)?;
        Ok((gen_file_attr(item).into(), self.opts.attr_timeout))
    }

    #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &std::ffi::CStr) -> io::Result<Entry> {
        debug!("lookup");

        let (parent_node, parent_item) = self.node_by_inode(parent)?;
        if parent_item.resource.kind() != ResourceKind::Directory {
            return Err(enoent());
        }

        // `.` and `..` never exist as children.
        let Some(child) = name.to_str().ok().and_then(|name| parent_node.child(name)) else {
            // a negative entry, the kernel remembers the miss for entry_timeout.
            return Ok(Entry {
                inode: 0,
                entry_timeout: self.opts.entry_timeout,
                ..Default::default()
            });
        };
        let child_item = payload(child)?;

        Ok(Entry {
            inode: child_item.inode,
            attr: gen_file_attr(child_item).into(),
            attr_timeout: self.opts.attr_timeout,
            entry_timeout: self.opts.entry_timeout,
            ..Default::default()
        })
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn opendir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        let (_, item) = self.node_by_inode(inode)?;
        if item.resource.kind() != ResourceKind::Directory {
            warn!("not a directory");
            return Err(eio());
        }
        Ok((None, OpenOptions::empty()))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(FuseDirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        debug!("readdir");

        let (node, item) = self.node_by_inode(inode)?;
        let entries = list_dir(node, item)?;

        for (i, entry) in entries.iter().skip(offset as usize).enumerate() {
            // the second parameter will become the "offset" parameter on the next call.
            let written = add_entry(FuseDirEntry {
                ino: entry.inode,
                offset: offset + i as u64 + 1,
                type_: entry.file_type,
                name: entry.name.as_bytes(),
            })?;
            // If the buffer is full, add_entry will return `Ok(0)`.
            if written == 0 {
                break;
            }
        }

        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions, Option<u32>)> {
        let (_, item) = self.node_by_inode(inode)?;
        let fh = self.tokio_handle.block_on(self.open_item(item))?;

        // contents never change, the kernel may keep its page cache.
        Ok((Some(fh), OpenOptions::KEEP_CACHE, None))
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        LazyFs::release(self, handle);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        debug!("read");

        let buf = self
            .tokio_handle
            .block_on(LazyFs::read(self, handle, offset, size))?;

        w.write(&buf)
    }

    #[tracing::instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        let (_, item) = self.node_by_inode(inode)?;
        Ok(symlink_target(item)?.as_bytes().to_vec())
    }
}
