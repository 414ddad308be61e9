use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lazyfs::fs::{fuse::FuseDaemon, LazyFs, Options};
use lazyfs::puller::{BlobCache, LocalPuller};
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t=Level::INFO)]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mounts an image at the given mountpoint. Metadata is available right
    /// away, file contents are pulled when first opened.
    Mount {
        /// The image, a directory in the OCI image layout.
        #[clap(value_name = "IMAGE")]
        image: String,

        #[clap(value_name = "PATH")]
        mountpoint: PathBuf,

        /// The tag (aka reference name) to mount.
        #[arg(long, env = "LAZYFS_TAG", default_value = "latest")]
        tag: String,

        /// Where to keep pulled blobs. Can be reused across mounts.
        /// If unset, a temporary directory is used, and removed on exit.
        #[arg(long, env = "LAZYFS_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// How long (in seconds) the kernel may cache entries and attributes.
        #[arg(long, default_value_t = 180)]
        fuse_cache_timeout: u64,

        /// Number of FUSE threads to spawn.
        #[arg(long, env, default_value_t = default_threads())]
        threads: usize,

        #[arg(long, env, default_value_t = false)]
        /// Whether to configure the mountpoint with allow_other.
        /// Requires /etc/fuse.conf to contain the `user_allow_other`
        /// option, configured via `programs.fuse.userAllowOther` on NixOS.
        allow_other: bool,
    },
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|threads| threads.into())
        .unwrap_or(4)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let tracing_handle = lazyfs_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .enable_progressbar()
        .build()?;

    match cli.command {
        Commands::Mount {
            image,
            mountpoint,
            tag,
            cache_dir,
            fuse_cache_timeout,
            threads,
            allow_other,
        } => {
            // the temporary directory is removed when this is dropped, after unmounting.
            let mut ephemeral_cache_dir = None;
            let cache_dir = match cache_dir {
                Some(cache_dir) => cache_dir,
                None => {
                    let tmpdir = tempfile::Builder::new()
                        .prefix("lazyfs-blobcache")
                        .tempdir()?;
                    info!(cache_dir=?tmpdir.path(), "using ephemeral blob cache");
                    ephemeral_cache_dir.insert(tmpdir).path().to_path_buf()
                }
            };

            let puller = BlobCache::new(cache_dir, LocalPuller::new()).await?;

            let fuse_cache_timeout = Duration::from_secs(fuse_cache_timeout);
            let fs = LazyFs::load(
                puller,
                Options {
                    attr_timeout: fuse_cache_timeout,
                    entry_timeout: fuse_cache_timeout,
                    ..Options::new(image, tag)
                },
            )
            .await?;

            let fuse_daemon = tokio::task::spawn_blocking(move || {
                FuseDaemon::new(fs, &mountpoint, threads, allow_other)
            })
            .await??;

            writeln!(
                tracing_handle.get_stdout_writer(),
                "{}",
                fuse_daemon.mountpoint().display()
            )?;
            info!("serving, interrupt to unmount");

            // Wait for an interrupt, or for somebody else unmounting.
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    info!("interrupt received, unmounting…");
                }
                res = tokio::task::spawn_blocking({
                    let fuse_daemon = fuse_daemon.clone();
                    move || fuse_daemon.wait()
                }) => {
                    res?;
                    info!("unmounted externally");
                }
            }

            tokio::task::spawn_blocking(move || fuse_daemon.unmount()).await??;
            info!("unmount occured, terminating…");

            drop(ephemeral_cache_dir);
        }
    };
    Ok(())
}
