#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use std::ffi::CString;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use fuse_backend_rs::api::filesystem::{Context, FileSystem};
use prost::Message;
use tempfile::TempDir;

use super::{fuse::FuseDaemon, DirEntry, LazyFs, Options, DEFAULT_CACHE_TIMEOUT};
use crate::manifest::{mode, Descriptor, ImageManifest, Manifest, Resource};
use crate::puller::{BlobCache, LocalPuller, MemoryPuller, Puller};
use crate::tree::ROOT_INODE;
use crate::{fixtures, Error};

/// Writes the example image to a temporary directory, and loads it through a
/// [BlobCache] in another one.
async fn load_example(ref_name: &str) -> (TempDir, Result<LazyFs<BlobCache<LocalPuller>>, Error>) {
    let tmpdir = TempDir::new().unwrap();
    let image = fixtures::write_example_image(&tmpdir.path().join("image"))
        .await
        .expect("must write image");
    let cache = BlobCache::new(tmpdir.path().join("cache"), LocalPuller::new())
        .await
        .expect("must create cache");

    let fs = LazyFs::load(cache, Options::new(image.location, ref_name)).await;
    (tmpdir, fs)
}

/// Stores an image manifest in memory, tagged as `latest`.
fn set_manifest(memory: &MemoryPuller, manifest: &ImageManifest) {
    let data = serde_json::to_vec(manifest).unwrap();
    let size = data.len() as u64;
    let mut index = fixtures::index_with_tags(&[("latest", memory.insert(data))]);
    index.manifests[0].size = size;
    memory.set_index(index);
}

/// Stores an image with the given layers in memory, tagged as `latest`.
fn set_layers(memory: &MemoryPuller, layers: &[Manifest]) {
    let descriptors = layers
        .iter()
        .map(|layer| {
            let data = layer.encode_to_vec();
            memory.insert(data.clone());
            fixtures::layer_descriptor(&data)
        })
        .collect();
    set_manifest(memory, &fixtures::image_manifest(descriptors));
}

async fn load_memory<P: Puller>(puller: P) -> LazyFs<P> {
    LazyFs::load(puller, Options::new("memory", "latest"))
        .await
        .expect("must load")
}

/// Returns the errno of a failed call.
fn errno<T>(r: io::Result<T>) -> Option<i32> {
    r.err().and_then(|e| e.raw_os_error())
}

#[tokio::test]
async fn example_attributes() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    let foo = fs.get_attr("/usr/bin/foo").expect("must exist");
    assert_eq!(libc::S_IFREG as u32 | 0o644, foo.mode);
    assert_eq!(fixtures::FOO_CONTENTS.len() as u64, foo.size);

    let usr_bin = fs.get_attr("/usr/bin").expect("must exist");
    assert_eq!(libc::S_IFDIR as u32 | 0o755, usr_bin.mode);

    let symlink = fs.get_attr("/bin/foo").expect("must exist");
    assert_eq!(libc::S_IFLNK as u32 | 0o777, symlink.mode);
    assert_eq!("/usr/bin/foo".len() as u64, symlink.size);

    // implicit directories show up as directories.
    let bin = fs.get_attr("/bin").expect("must exist");
    assert_eq!(libc::S_IFDIR as u32 | 0o755, bin.mode);

    let root = fs.get_attr("/").expect("must exist");
    assert_eq!(crate::tree::ROOT_INODE, root.ino);
    assert_eq!(root.ino, fs.get_attr("").unwrap().ino);
}

#[tokio::test]
async fn example_listing() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    let root = fs.open_dir("/").expect("must list");
    assert_eq!(
        vec!["bin", "usr"],
        root.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
    );
    assert!(root.iter().all(|e| e.file_type == libc::S_IFDIR as u32));

    assert_eq!(
        vec![DirEntry {
            name: "foo".to_string(),
            inode: fs.get_attr("/usr/bin/foo").unwrap().ino,
            file_type: libc::S_IFREG as u32,
        }],
        fs.open_dir("/usr/bin").expect("must list")
    );
    assert_eq!(
        libc::S_IFLNK as u32,
        fs.open_dir("/bin").expect("must list")[0].file_type
    );
}

#[tokio::test]
async fn example_readlink() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    assert_eq!("/usr/bin/foo", fs.readlink("/bin/foo").expect("must readlink"));
}

#[tokio::test]
async fn example_read() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    let fh = fs.open("/usr/bin/foo").await.expect("must open");
    assert_eq!(b"abcd".to_vec(), fs.read(fh, 0, 10).await.unwrap());
    assert_eq!(b"bc".to_vec(), fs.read(fh, 1, 2).await.unwrap());
    assert_eq!(b"cd".to_vec(), fs.read(fh, 2, 10).await.unwrap());
    assert!(fs.read(fh, 4, 10).await.unwrap().is_empty());
    assert!(fs.read(fh, 100, 10).await.unwrap().is_empty());
    fs.release(fh);

    // the handle is gone now.
    assert_eq!(Some(libc::EIO), errno(fs.read(fh, 0, 10).await));
}

#[tokio::test]
async fn resolve_reference() {
    let (_tmpdir, fs) = load_example("v1").await;
    let fs = fs.expect("must load");
    assert!(fs.get_attr("/usr/bin/foo").is_ok());

    let (_tmpdir, fs) = load_example("v2").await;
    assert!(matches!(
        fs.err().expect("must fail"),
        Error::UnknownReference(name) if name == "v2"
    ));
}

#[tokio::test]
async fn not_found() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    assert_eq!(Some(libc::ENOENT), errno(fs.get_attr("/nx")));
    assert_eq!(Some(libc::ENOENT), errno(fs.get_attr("/usr/bin/foo/nx")));
    assert_eq!(Some(libc::ENOENT), errno(fs.open_dir("/nx")));
    assert_eq!(Some(libc::ENOENT), errno(fs.readlink("/nx")));
    assert_eq!(Some(libc::ENOENT), errno(fs.open("/nx").await));

    // . and .. are never resolved.
    assert_eq!(Some(libc::ENOENT), errno(fs.get_attr("/usr/bin/.")));
    assert_eq!(Some(libc::ENOENT), errno(fs.get_attr("/usr/../bin")));
}

#[tokio::test]
async fn wrong_types() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");

    assert_eq!(Some(libc::EIO), errno(fs.readlink("/usr/bin/foo")));
    assert_eq!(Some(libc::EIO), errno(fs.open_dir("/usr/bin/foo")));
    assert_eq!(Some(libc::EIO), errno(fs.open("/usr/bin").await));
    assert_eq!(Some(libc::EIO), errno(fs.open("/bin/foo").await));
}

/// Lookups of missing names return a negative entry, so the kernel can
/// cache the miss.
#[tokio::test]
async fn lookup_negative_entry() {
    let (_tmpdir, fs) = load_example("latest").await;
    let fs = fs.expect("must load");
    let ctx = Context::default();

    let usr = FileSystem::lookup(&fs, &ctx, ROOT_INODE, &CString::new("usr").unwrap())
        .expect("must succeed");
    assert_eq!(fs.get_attr("/usr").unwrap().ino, usr.inode);

    let nx = FileSystem::lookup(&fs, &ctx, ROOT_INODE, &CString::new("nx").unwrap())
        .expect("must succeed");
    assert_eq!(0, nx.inode);
    assert_eq!(DEFAULT_CACHE_TIMEOUT, nx.entry_timeout);

    // a file has no children at all.
    let foo = fs.get_attr("/usr/bin/foo").unwrap().ino;
    assert_eq!(
        Some(libc::ENOENT),
        errno(FileSystem::lookup(&fs, &ctx, foo, &CString::new("nx").unwrap()))
    );
}

/// Descriptor sizes are checked, an absurd one fails the mount instead of
/// being allocated.
#[tokio::test]
async fn huge_descriptor_size() {
    let memory = MemoryPuller::default();
    set_layers(&memory, &[fixtures::example_layer()]);
    let mut index = memory.pull_index("memory").await.unwrap();
    index.manifests[0].size = u64::MAX;
    memory.set_index(index);

    assert!(matches!(
        LazyFs::load(memory, Options::new("memory", "latest"))
            .await
            .err()
            .expect("must fail"),
        Error::Malformed(_)
    ));
}

#[tokio::test]
async fn layer_size_mismatch() {
    let memory = MemoryPuller::default();
    let layer = fixtures::example_layer().encode_to_vec();
    memory.insert(layer.clone());

    for size in [0, layer.len() as u64 - 1, layer.len() as u64 + 1] {
        set_manifest(
            &memory,
            &fixtures::image_manifest(vec![Descriptor {
                size,
                ..fixtures::layer_descriptor(&layer)
            }]),
        );

        assert!(matches!(
            LazyFs::load(memory.clone(), Options::new("memory", "latest"))
                .await
                .err()
                .expect("must fail"),
            Error::Malformed(_)
        ));
    }
}

#[tokio::test]
async fn unsupported_media_type() {
    let memory = MemoryPuller::default();
    let layer = fixtures::example_layer().encode_to_vec();
    let layer_digest = memory.insert(layer.clone());

    set_manifest(
        &memory,
        &fixtures::image_manifest(vec![
            fixtures::layer_descriptor(&layer),
            Descriptor {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
                ..fixtures::layer_descriptor(&layer)
            },
        ]),
    );

    let err = LazyFs::load(memory.clone(), Options::new("memory", "latest"))
        .await
        .err()
        .expect("must fail");
    assert!(matches!(err, Error::UnsupportedMediaType(_)));
    assert_eq!(1, memory.pulls(&layer_digest));
}

#[tokio::test]
async fn malformed_layer() {
    let memory = MemoryPuller::default();
    set_layers(
        &memory,
        &[Manifest {
            resource: vec![fixtures::file(&["/etc/../passwd"], b"x")],
        }],
    );

    assert!(matches!(
        LazyFs::load(memory, Options::new("memory", "latest"))
            .await
            .err()
            .expect("must fail"),
        Error::DisallowedPathSegment(_)
    ));
}

#[tokio::test]
async fn open_without_digest() {
    let memory = MemoryPuller::default();
    set_layers(
        &memory,
        &[Manifest {
            resource: vec![Resource {
                path: vec!["/empty".to_string()],
                mode: 0o644,
                ..Default::default()
            }],
        }],
    );

    let fs = load_memory(memory).await;
    assert!(fs.get_attr("/empty").is_ok());
    assert_eq!(Some(libc::EIO), errno(fs.open("/empty").await));
}

#[tokio::test]
async fn open_missing_blob() {
    let memory = MemoryPuller::default();
    set_layers(
        &memory,
        &[Manifest {
            resource: vec![fixtures::file(&["/foo"], b"not stored")],
        }],
    );

    let fs = load_memory(memory).await;
    assert_eq!(Some(libc::EIO), errno(fs.open("/foo").await));
}

/// Content not matching its digest is never served.
#[tokio::test]
async fn open_corrupt_blob() {
    let tmpdir = TempDir::new().unwrap();
    let memory = MemoryPuller::default();
    memory.insert_unchecked(fixtures::FOO_DIGEST.clone(), b"dcba".to_vec());
    set_layers(&memory, &[fixtures::example_layer()]);

    let cache = BlobCache::new(tmpdir.path().to_path_buf(), memory)
        .await
        .unwrap();
    let fs = load_memory(cache).await;
    assert_eq!(Some(libc::EIO), errno(fs.open("/usr/bin/foo").await));
}

#[tokio::test]
async fn hardlinks_pulled_once() {
    let tmpdir = TempDir::new().unwrap();
    let memory = MemoryPuller::default();
    let digest = memory.insert(fixtures::BLOB_B.to_vec());
    set_layers(
        &memory,
        &[Manifest {
            resource: vec![fixtures::file(&["/a", "/b"], &fixtures::BLOB_B)],
        }],
    );

    let cache = BlobCache::new(tmpdir.path().to_path_buf(), memory.clone())
        .await
        .unwrap();
    let fs = load_memory(cache).await;

    let a = fs.get_attr("/a").unwrap();
    let b = fs.get_attr("/b").unwrap();
    assert_eq!(a.ino, b.ino);
    assert_eq!(2, a.nlink);

    let fh_a = fs.open("/a").await.expect("must open");
    let fh_b = fs.open("/b").await.expect("must open");
    assert_ne!(fh_a, fh_b);

    assert_eq!(
        &fixtures::BLOB_B[1000..1100],
        &fs.read(fh_a, 1000, 100).await.unwrap()[..]
    );
    assert_eq!(
        &fixtures::BLOB_B[..10],
        &fs.read(fh_b, 0, 10).await.unwrap()[..]
    );

    assert_eq!(1, memory.pulls(&digest));
}

#[tokio::test]
async fn layers_overlay() {
    let memory = MemoryPuller::default();
    memory.insert(b"old".to_vec());
    memory.insert(b"new".to_vec());

    let mut private = fixtures::dir("/etc/private");
    private.mode = mode::DIR | 0o700;
    set_layers(
        &memory,
        &[
            Manifest {
                resource: vec![
                    fixtures::file(&["/etc/motd"], b"old"),
                    fixtures::file(&["/etc/issue"], b"old"),
                ],
            },
            Manifest {
                resource: vec![fixtures::file(&["/etc/motd"], b"new"), private],
            },
        ],
    );

    let fs = load_memory(memory).await;

    let fh = fs.open("/etc/motd").await.unwrap();
    assert_eq!(b"new".to_vec(), fs.read(fh, 0, 100).await.unwrap());
    let fh = fs.open("/etc/issue").await.unwrap();
    assert_eq!(b"old".to_vec(), fs.read(fh, 0, 100).await.unwrap());

    assert_eq!(
        libc::S_IFDIR as u32 | 0o700,
        fs.get_attr("/etc/private").unwrap().mode
    );
    assert_eq!(
        vec!["issue", "motd", "private"],
        fs.open_dir("/etc")
            .unwrap()
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn unicode_and_setuid() {
    let memory = MemoryPuller::default();
    memory.insert(fixtures::FOO_CONTENTS.to_vec());
    let mut su = fixtures::file(&["/bin/sü"], fixtures::FOO_CONTENTS);
    su.mode = mode::SETUID | 0o755;
    su.uid = 1000;
    su.gid = 100;
    set_layers(&memory, &[Manifest { resource: vec![su] }]);

    let fs = load_memory(memory).await;
    let attr = fs.get_attr("/bin/sü").expect("must exist");
    assert_eq!(
        libc::S_IFREG as u32 | libc::S_ISUID as u32 | 0o755,
        attr.mode
    );
    assert_eq!(1000, attr.uid);
    assert_eq!(100, attr.gid);
}

/// Mounts the filesystem, or returns None if FUSE is unusable here.
fn do_mount<P>(fs: LazyFs<P>, mountpoint: &Path) -> Option<FuseDaemon>
where
    P: Puller + 'static,
{
    // https://plume.benboeckel.net/~/JustAnotherBlog/skipping-tests-in-rust
    if !Path::new("/dev/fuse").exists() {
        eprintln!("skipping test");
        return None;
    }

    match FuseDaemon::new(fs, mountpoint, 4, false) {
        Ok(fuse_daemon) => Some(fuse_daemon),
        Err(e) => {
            eprintln!("skipping test, unable to mount: {}", e);
            None
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount() {
    let mountpoint = TempDir::new().unwrap();
    let (_tmpdir, fs) = load_example("latest").await;
    let Some(fuse_daemon) = do_mount(fs.expect("must load"), mountpoint.path()) else {
        return;
    };

    fuse_daemon.unmount().expect("unmount");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_read() {
    let mountpoint = TempDir::new().unwrap();
    let (_tmpdir, fs) = load_example("latest").await;
    let Some(fuse_daemon) = do_mount(fs.expect("must load"), mountpoint.path()) else {
        return;
    };

    let p = mountpoint.path().join("usr/bin/foo");

    let data = tokio::fs::read(&p).await.expect("must succeed");
    assert_eq!(fixtures::FOO_CONTENTS, &data[..]);

    // peek at metadata. We use symlink_metadata to ensure we don't traverse a symlink by accident.
    let metadata = tokio::fs::symlink_metadata(&p).await.expect("must succeed");
    assert_eq!(0o644, metadata.mode() & 0o777);
    assert_eq!(fixtures::FOO_CONTENTS.len() as u64, metadata.len());
    assert_eq!(0, metadata.mtime());

    fuse_daemon.unmount().expect("unmount");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_symlink_and_listing() {
    let mountpoint = TempDir::new().unwrap();
    let (_tmpdir, fs) = load_example("latest").await;
    let Some(fuse_daemon) = do_mount(fs.expect("must load"), mountpoint.path()) else {
        return;
    };

    let target = tokio::fs::read_link(mountpoint.path().join("bin/foo"))
        .await
        .expect("must succeed");
    assert_eq!(Path::new("/usr/bin/foo"), target.as_path());

    let mut names = Vec::new();
    {
        // the directory has to be closed again before unmounting.
        let mut it = tokio::fs::read_dir(mountpoint.path())
            .await
            .expect("must succeed");
        while let Some(entry) = it.next_entry().await.expect("must succeed") {
            assert!(entry.file_type().await.unwrap().is_dir());
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    assert_eq!(vec!["bin", "usr"], names);

    let err = tokio::fs::metadata(mountpoint.path().join("nx"))
        .await
        .expect_err("must fail");
    assert_eq!(io::ErrorKind::NotFound, err.kind());

    fuse_daemon.unmount().expect("unmount");
}

/// Content pulled while mounted stays in the cache, a second mount over the
/// same cache doesn't need the image blobs anymore.
#[tokio::test]
async fn cache_outlives_mount() {
    let tmpdir = TempDir::new().unwrap();
    let memory = MemoryPuller::default();
    set_layers(&memory, &[fixtures::example_layer()]);
    memory.insert(fixtures::FOO_CONTENTS.to_vec());

    {
        let cache = BlobCache::new(tmpdir.path().to_path_buf(), memory.clone())
            .await
            .unwrap();
        let fs = load_memory(cache).await;
        let fh = fs.open("/usr/bin/foo").await.unwrap();
        fs.release(fh);
    }

    let cache = BlobCache::new(tmpdir.path().to_path_buf(), memory.clone())
        .await
        .unwrap();
    let fs = load_memory(cache).await;
    let fh = fs.open("/usr/bin/foo").await.unwrap();
    assert_eq!(
        fixtures::FOO_CONTENTS,
        &fs.read(fh, 0, 100).await.unwrap()[..]
    );

    assert_eq!(1, memory.pulls(&fixtures::FOO_DIGEST));
}
