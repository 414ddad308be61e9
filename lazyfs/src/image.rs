//! Access to an image laid out on a local filesystem.
//!
//! The layout is the OCI image layout: an `index.json` at the root, and all
//! blobs in `blobs/<algorithm>/<hex>`. The blob cache uses the same
//! `blobs/<algorithm>/<hex>` layout below its cache directory.
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::manifest::Index;
use crate::{Digest, Error};

pub const INDEX_FILE: &str = "index.json";
pub const BLOBS_DIR: &str = "blobs";

/// Returns the path a blob with the given digest lives at, below root.
pub fn blob_path(root: &Path, digest: &Digest) -> PathBuf {
    root.join(BLOBS_DIR)
        .join(digest.algorithm())
        .join(digest.encoded())
}

/// Opens a blob for reading. A missing blob is an io error of kind
/// [std::io::ErrorKind::NotFound].
#[instrument(skip_all, err, fields(blob.digest=%digest))]
pub async fn open_blob(root: &Path, digest: &Digest) -> Result<tokio::fs::File, Error> {
    Ok(tokio::fs::File::open(blob_path(root, digest)).await?)
}

/// Reads and parses `index.json`.
#[instrument(skip_all, err, fields(image=?root))]
pub async fn read_index(root: &Path) -> Result<Index, Error> {
    let data = tokio::fs::read(root.join(INDEX_FILE)).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Writes a blob into the layout, returning its sha256 digest.
/// Used to assemble images, mostly in tests.
pub async fn write_blob(root: &Path, data: &[u8]) -> Result<Digest, Error> {
    let digest = Digest::sha256(data);
    let path = blob_path(root, &digest);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut f = tokio::fs::File::create(&path).await?;
    f.write_all(data).await?;
    f.flush().await?;
    Ok(digest)
}

/// Writes `index.json`.
pub async fn write_index(root: &Path, index: &Index) -> Result<(), Error> {
    tokio::fs::create_dir_all(root).await?;
    tokio::fs::write(root.join(INDEX_FILE), serde_json::to_vec(index)?).await?;
    Ok(())
}
