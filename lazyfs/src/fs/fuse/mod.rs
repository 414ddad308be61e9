use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuse_backend_rs::api::{filesystem::FileSystem, server::Server};
use fuse_backend_rs::transport::{FuseChannel, FuseSession};
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{debug, error, info, instrument};

/// The name the filesystem shows up with in the mount table.
const FS_NAME: &str = "lazyfs";

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

fn fuse_error(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Handles requests from one channel of the session, until the session
/// is shut down.
struct Worker<FS>
where
    FS: FileSystem + Sync + Send,
{
    server: Arc<Server<Arc<FS>>>,
    channel: FuseChannel,
}

impl<FS> Worker<FS>
where
    FS: FileSystem + Sync + Send,
{
    fn run(&mut self) -> io::Result<()> {
        while let Some((reader, writer)) = self
            .channel
            .get_request()
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?
        {
            if let Err(e) = self
                .server
                .handle_message(reader, writer.into(), None, None)
            {
                match e {
                    // This indicates the session has been shut down.
                    fuse_backend_rs::Error::EncodeMessage(e) if e.raw_os_error() == Some(BADFD) => {
                        break;
                    }
                    error => {
                        error!(?error, "failed to handle fuse request");
                        continue;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Serves a [FileSystem] read-only at a mountpoint, with a pool of worker
/// threads, each blocking on its own channel of the session.
///
/// Dropping the last clone unmounts.
#[derive(Clone)]
pub struct FuseDaemon {
    mountpoint: PathBuf,
    session: Arc<Mutex<FuseSession>>,
    threads: Arc<ThreadPool>,
}

impl FuseDaemon {
    #[instrument(skip(fs, mountpoint), fields(mountpoint=?mountpoint), err)]
    pub fn new<FS, P>(
        fs: FS,
        mountpoint: P,
        num_threads: usize,
        allow_other: bool,
    ) -> Result<Self, io::Error>
    where
        FS: FileSystem + Sync + Send + 'static,
        P: AsRef<Path> + std::fmt::Debug,
    {
        let server = Arc::new(Server::new(Arc::new(fs)));

        let mut session =
            FuseSession::new(mountpoint.as_ref(), FS_NAME, "", true).map_err(fuse_error)?;

        #[cfg(target_os = "linux")]
        session.set_allow_other(allow_other);
        session.mount().map_err(fuse_error)?;

        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("fuse_server".to_string())
            .build();

        for _ in 0..num_threads {
            let mut worker = Worker {
                server: server.clone(),
                channel: session.new_channel().map_err(fuse_error)?,
            };

            threads.execute(move || {
                if let Err(error) = worker.run() {
                    error!(?error, "fuse worker failed");
                }
            });
        }

        info!(threads = num_threads, "mounted");

        Ok(FuseDaemon {
            mountpoint: mountpoint.as_ref().to_path_buf(),
            session: Arc::new(Mutex::new(session)),
            threads: Arc::new(threads),
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Waits for all threads to finish.
    #[instrument(skip_all)]
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Sends the unmount command, and waits for all threads to finish.
    ///
    /// Calling this more than once is fine. Pulls still in flight are not
    /// cancelled, they finish into the cache.
    #[instrument(skip_all, fields(mountpoint=?self.mountpoint), err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        self.session.lock().umount().map_err(fuse_error)?;

        self.wait();
        debug!("unmounted");
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        // other clones keep serving.
        if Arc::strong_count(&self.session) > 1 {
            return;
        }
        if let Err(error) = self.unmount() {
            error!(?error, "failed to unmount fuse filesystem")
        }
    }
}
