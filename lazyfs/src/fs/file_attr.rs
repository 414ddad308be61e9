use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::manifest::ResourceKind;
use crate::tree::TreeItem;

/// Generates the [Attr] for a tree item.
/// All timestamps are set to the unix epoch.
pub fn gen_file_attr(item: &TreeItem) -> Attr {
    let resource = &item.resource;
    let size = match resource.kind() {
        ResourceKind::Directory => 0,
        ResourceKind::Symlink => resource.target.len() as u64,
        ResourceKind::Regular | ResourceKind::Special => resource.size,
    };

    Attr {
        ino: item.inode,
        size,
        blksize: 1024,
        blocks: size.div_ceil(512),
        mode: resource.posix_mode(),
        atime: 0,
        mtime: 0,
        ctime: 0,
        atimensec: 0,
        mtimensec: 0,
        ctimensec: 0,
        // hardlinks share the resource.
        nlink: resource.path.len().max(1) as u32,
        uid: resource.uid as u32,
        gid: resource.gid as u32,
        rdev: 0,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: 0,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}
