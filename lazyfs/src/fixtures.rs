use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;
use prost::Message;

use crate::manifest::{
    mode, Descriptor, ImageManifest, Index, Manifest, Resource, MEDIA_TYPE_CONTINUITY_MANIFEST,
    MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_INDEX, REF_NAME_ANNOTATION,
};
use crate::{image, Digest, Error};

pub const FOO_CONTENTS: &[u8] = b"abcd";

lazy_static! {
    pub static ref FOO_DIGEST: Digest = Digest::sha256(FOO_CONTENTS);

    // 2 bytes
    pub static ref BLOB_A: Vec<u8> = vec![0x00, 0x01];

    // 1MB
    pub static ref BLOB_B: Vec<u8> = (0..255).collect::<Vec<u8>>().repeat(4 * 1024);
}

/// A directory resource at path, mode 0755.
pub fn dir(path: &str) -> Resource {
    Resource {
        path: vec![path.to_string()],
        mode: mode::DIR | 0o755,
        ..Default::default()
    }
}

/// A symlink resource at path, pointing to target.
pub fn symlink(path: &str, target: &str) -> Resource {
    Resource {
        path: vec![path.to_string()],
        mode: mode::SYMLINK | 0o777,
        target: target.to_string(),
        ..Default::default()
    }
}

/// A regular file resource, mode 0644, available at all of the paths.
pub fn file(paths: &[&str], contents: &[u8]) -> Resource {
    Resource {
        path: paths.iter().map(|p| p.to_string()).collect(),
        mode: 0o644,
        size: contents.len() as u64,
        digest: vec![Digest::sha256(contents).to_string()],
        ..Default::default()
    }
}

/// A descriptor of an image manifest, tagged with ref_name.
pub fn manifest_descriptor(ref_name: &str, digest: Digest, size: u64) -> Descriptor {
    Descriptor {
        media_type: MEDIA_TYPE_IMAGE_MANIFEST.to_string(),
        digest,
        size,
        urls: vec![],
        annotations: HashMap::from([(REF_NAME_ANNOTATION.to_string(), ref_name.to_string())]),
    }
}

/// An index with one manifest descriptor per (ref_name, digest) pair.
pub fn index_with_tags(tags: &[(&str, Digest)]) -> Index {
    Index {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_INDEX.to_string()),
        manifests: tags
            .iter()
            .map(|(ref_name, digest)| manifest_descriptor(ref_name, digest.clone(), 0))
            .collect(),
        annotations: HashMap::new(),
    }
}

/// A descriptor for a layer manifest with the given contents.
pub fn layer_descriptor(data: &[u8]) -> Descriptor {
    Descriptor {
        media_type: MEDIA_TYPE_CONTINUITY_MANIFEST.to_string(),
        digest: Digest::sha256(data),
        size: data.len() as u64,
        urls: vec![],
        annotations: HashMap::new(),
    }
}

/// Assembles an image manifest out of the given layer descriptors.
pub fn image_manifest(layers: Vec<Descriptor>) -> ImageManifest {
    ImageManifest {
        schema_version: 2,
        media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
        config: Descriptor {
            media_type: MEDIA_TYPE_IMAGE_CONFIG.to_string(),
            digest: Digest::sha256(b"{}"),
            size: 2,
            urls: vec![],
            annotations: HashMap::new(),
        },
        layers,
        annotations: HashMap::new(),
    }
}

/// The layer of the example image:
///
/// ```text
/// /usr/bin      directory
/// /usr/bin/foo  regular file, contents "abcd"
/// /bin/foo      symlink to /usr/bin/foo
/// ```
pub fn example_layer() -> Manifest {
    Manifest {
        resource: vec![
            dir("/usr/bin"),
            file(&["/usr/bin/foo"], FOO_CONTENTS),
            symlink("/bin/foo", "/usr/bin/foo"),
        ],
    }
}

/// An image written by [write_example_image].
pub struct ExampleImage {
    /// The location to pass to a [crate::puller::LocalPuller].
    pub location: String,
    /// The image manifest tagged as `v1` and `latest`.
    pub manifest_digest: Digest,
}

/// Writes an image in the OCI image layout to root, consisting of
/// [example_layer], tagged as both `v1` and `latest`.
pub async fn write_example_image(root: &Path) -> Result<ExampleImage, Error> {
    write_image(root, &[example_layer()], &[FOO_CONTENTS], &["v1", "latest"]).await
}

/// Writes an image with the given layers and content blobs to root, tagging
/// its manifest with all of the ref_names.
pub async fn write_image(
    root: &Path,
    layers: &[Manifest],
    blobs: &[&[u8]],
    ref_names: &[&str],
) -> Result<ExampleImage, Error> {
    for blob in blobs {
        image::write_blob(root, blob).await?;
    }

    let mut layer_descriptors = Vec::with_capacity(layers.len());
    for layer in layers {
        let data = layer.encode_to_vec();
        image::write_blob(root, &data).await?;
        layer_descriptors.push(layer_descriptor(&data));
    }

    let manifest_data = serde_json::to_vec(&image_manifest(layer_descriptors))?;
    let manifest_digest = image::write_blob(root, &manifest_data).await?;

    let tags: Vec<_> = ref_names
        .iter()
        .map(|ref_name| (*ref_name, manifest_digest.clone()))
        .collect();
    let mut index = index_with_tags(&tags);
    for desc in index.manifests.iter_mut() {
        desc.size = manifest_data.len() as u64;
    }
    image::write_index(root, &index).await?;

    Ok(ExampleImage {
        location: root.to_string_lossy().into_owned(),
        manifest_digest,
    })
}
