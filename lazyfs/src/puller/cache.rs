use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::{BlobReader, Puller};
use crate::digests::Algorithm;
use crate::hashing_reader::HashingReader;
use crate::manifest::Index;
use crate::{image, Digest, Error};

/// The state of a digest in the cache. Digests we know nothing about are
/// absent from the map.
enum PullStatus {
    /// Someone is pulling this blob. The sender side is dropped when the
    /// pull finishes, successful or not.
    InFlight(watch::Receiver<()>),
    /// The blob is in the cache, and verified.
    Done,
}

/// Wraps another [Puller], and keeps a verified copy of every blob pulled
/// through it in a local directory.
///
/// Concurrent requests for the same digest only cause one request to the
/// wrapped puller, everybody else waits for it to finish.
/// Only blobs whose content matches their digest are ever served.
/// If a pull fails, the digest is forgotten, and the next request for it
/// will try again.
///
/// The cache directory uses the `blobs/<algorithm>/<hex>` layout, and a `tmp`
/// directory to stage blobs before they are verified. Entries left over by
/// an earlier process are verified again before they are used.
pub struct BlobCache<P> {
    cache_path: PathBuf,
    puller: P,

    pull_status: Mutex<HashMap<Digest, PullStatus>>,

    /// Number of bytes pulled from the wrapped puller so far.
    pulled_blob_bytes: AtomicU64,
}

/// Marks a digest as in-flight for as long as it's alive.
/// On drop, the digest is either marked as done (if [InFlightGuard::finish]
/// was called), or forgotten, and all waiters are woken up.
struct InFlightGuard<'a> {
    pull_status: &'a Mutex<HashMap<Digest, PullStatus>>,
    digest: Digest,
    done: bool,
    // dropped after [Drop::drop] ran, so waiters see the updated status.
    _tx: watch::Sender<()>,
}

impl InFlightGuard<'_> {
    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut pull_status = self.pull_status.lock();
        if self.done {
            pull_status.insert(self.digest.clone(), PullStatus::Done);
        } else {
            pull_status.remove(&self.digest);
        }
    }
}

impl<P> BlobCache<P>
where
    P: Puller,
{
    /// Creates a new cache in the given directory, creating it if needed.
    pub async fn new(cache_path: PathBuf, puller: P) -> Result<Self, Error> {
        tokio::fs::create_dir_all(cache_path.join(image::BLOBS_DIR)).await?;
        tokio::fs::create_dir_all(cache_path.join("tmp")).await?;

        Ok(Self {
            cache_path,
            puller,
            pull_status: Mutex::new(HashMap::new()),
            pulled_blob_bytes: AtomicU64::new(0),
        })
    }

    /// Returns the number of bytes pulled from the wrapped puller so far.
    pub fn pulled_bytes(&self) -> u64 {
        self.pulled_blob_bytes.load(Ordering::Relaxed)
    }

    /// Ensures the blob is in the cache, pulling it if needed, or waiting
    /// for someone else pulling it.
    async fn cache_blob_if_not_yet(&self, image: &str, digest: &Digest) -> Result<(), Error> {
        loop {
            let guard = {
                let mut pull_status = self.pull_status.lock();
                match pull_status.get(digest) {
                    Some(PullStatus::Done) => return Ok(()),
                    Some(PullStatus::InFlight(rx)) => Err(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        pull_status.insert(digest.clone(), PullStatus::InFlight(rx));
                        Ok(InFlightGuard {
                            pull_status: &self.pull_status,
                            digest: digest.clone(),
                            done: false,
                            _tx: tx,
                        })
                    }
                }
            };

            match guard {
                Ok(guard) => return self.cache_blob(image, digest, guard).await,
                Err(mut rx) => {
                    debug!(blob.digest=%digest, "waiting for in-flight pull");
                    // This only returns once the sender is dropped, as
                    // nothing is ever sent. Check the status again afterwards.
                    while rx.changed().await.is_ok() {}
                }
            }
        }
    }

    #[instrument(skip_all, fields(blob.digest=%digest), err)]
    async fn cache_blob(
        &self,
        image: &str,
        digest: &Digest,
        guard: InFlightGuard<'_>,
    ) -> Result<(), Error> {
        let algorithm = digest.known_algorithm().ok_or_else(|| {
            Error::Malformed(format!("unable to verify digest algorithm of {}", digest))
        })?;

        let dst_path = image::blob_path(&self.cache_path, digest);

        // There might be an entry from an earlier process.
        if tokio::fs::try_exists(&dst_path).await? {
            match verify_file(&dst_path, algorithm).await {
                Ok(actual) if actual == *digest => {
                    debug!("reusing existing cache entry");
                    guard.finish();
                    return Ok(());
                }
                Ok(actual) => {
                    warn!(actual=%actual, "ignoring corrupt cache entry");
                }
                Err(e) => {
                    warn!(err=%e, "unable to verify existing cache entry");
                }
            }
        }

        debug!("caching blob");
        let blob_reader = self.puller.pull_blob(image, digest).await?;

        let mut tmp = async_tempfile::TempFile::new_in(self.cache_path.join("tmp"))
            .await
            .map_err(tempfile_error)?;

        let (actual, copied) = match algorithm {
            Algorithm::Sha256 => copy_hashing::<_, _, Sha256>(blob_reader, &mut tmp, algorithm).await?,
            Algorithm::Sha512 => copy_hashing::<_, _, Sha512>(blob_reader, &mut tmp, algorithm).await?,
        };
        tmp.sync_all().await?;

        if actual != *digest {
            // tmp is removed when dropped.
            return Err(Error::DigestMismatch {
                expected: digest.clone(),
                actual,
            });
        }

        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(tmp.file_path(), &dst_path).await?;

        let total_copied = self.pulled_blob_bytes.fetch_add(copied, Ordering::Relaxed) + copied;
        info!(
            blob.size = copied,
            total_bytes = total_copied,
            "pulled blob, total blob bytes pulled in this session: {} B",
            total_copied
        );

        guard.finish();
        Ok(())
    }

    async fn open_cached_blob(&self, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        let file = image::open_blob(&self.cache_path, digest).await?;
        Ok(Box::new(file))
    }

    /// Forgets a digest marked as done, so it gets pulled again.
    fn forget(&self, digest: &Digest) {
        let mut pull_status = self.pull_status.lock();
        if let Some(PullStatus::Done) = pull_status.get(digest) {
            pull_status.remove(digest);
        }
    }
}

#[async_trait]
impl<P> Puller for BlobCache<P>
where
    P: Puller,
{
    async fn pull_index(&self, image: &str) -> Result<Index, Error> {
        self.puller.pull_index(image).await
    }

    #[instrument(skip(self, digest), fields(blob.digest=%digest), err)]
    async fn pull_blob(&self, image: &str, digest: &Digest) -> Result<Box<dyn BlobReader>, Error> {
        self.cache_blob_if_not_yet(image, digest).await?;

        match self.open_cached_blob(digest).await {
            Err(e) if e.is_not_found() => {
                // Somebody removed it from below our feet.
                warn!("cached blob vanished, pulling again");
                self.forget(digest);
                self.cache_blob_if_not_yet(image, digest).await?;
                self.open_cached_blob(digest).await
            }
            r => r,
        }
    }
}

/// Copies everything from r to w, returning the digest of what was copied,
/// and the number of bytes.
async fn copy_hashing<R, W, H>(
    r: R,
    w: &mut W,
    algorithm: Algorithm,
) -> Result<(Digest, u64), Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    H: digest::Digest + Unpin,
{
    let mut hr = HashingReader::<R, H>::from(r);
    tokio::io::copy(&mut hr, w).await?;
    let copied = hr.bytes_read();
    Ok((Digest::from_raw(algorithm, &hr.digest()), copied))
}

async fn verify_file(path: &Path, algorithm: Algorithm) -> Result<Digest, Error> {
    let f = tokio::fs::File::open(path).await?;
    let (digest, _) = match algorithm {
        Algorithm::Sha256 => copy_hashing::<_, _, Sha256>(f, &mut tokio::io::sink(), algorithm).await?,
        Algorithm::Sha512 => copy_hashing::<_, _, Sha512>(f, &mut tokio::io::sink(), algorithm).await?,
    };
    Ok(digest)
}

fn tempfile_error(e: async_tempfile::Error) -> Error {
    match e {
        async_tempfile::Error::Io(io_error) => Error::Io(io_error),
        async_tempfile::Error::InvalidFile => Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "invalid or missing file specified",
        )),
        async_tempfile::Error::InvalidDirectory => Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "invalid or missing directory specified",
        )),
    }
}
