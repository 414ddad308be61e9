//! Typed representations of the documents an image consists of.
//!
//! The index and the image manifest are the JSON documents of the OCI image
//! layout. Each layer blob is a continuity manifest (v0, protobuf), listing
//! the [Resource]s of that layer.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Digest, Error};

/// The annotation used to tag manifests in an [Index] with a reference name.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// The only layer media type we know how to mount.
pub const MEDIA_TYPE_CONTINUITY_MANIFEST: &str = "application/vnd.continuity.manifest.v0+pb";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Returns the reference name this descriptor is tagged with, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(REF_NAME_ANNOTATION).map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Index {
    /// Looks up the manifest descriptor tagged with the given reference name.
    /// The first match wins.
    pub fn resolve(&self, ref_name: &str) -> Result<&Descriptor, Error> {
        self.manifests
            .iter()
            .find(|d| d.ref_name() == Some(ref_name))
            .ok_or_else(|| Error::UnknownReference(ref_name.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// A layer manifest, listing all resources of one layer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Manifest {
    #[prost(message, repeated, tag = "1")]
    pub resource: Vec<Resource>,
}

/// One filesystem entry.
/// Multiple paths mean the entry is hardlinked.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Resource {
    #[prost(string, repeated, tag = "1")]
    pub path: Vec<String>,
    #[prost(int64, tag = "2")]
    pub uid: i64,
    #[prost(int64, tag = "3")]
    pub gid: i64,
    #[prost(string, tag = "4")]
    pub user: String,
    #[prost(string, tag = "5")]
    pub group: String,
    #[prost(uint32, tag = "6")]
    pub mode: u32,
    #[prost(uint64, tag = "7")]
    pub size: u64,
    /// Content digests, only set for regular files. The first one is
    /// authoritative.
    #[prost(string, repeated, tag = "8")]
    pub digest: Vec<String>,
    /// Symlink target, only set for symlinks.
    #[prost(string, tag = "9")]
    pub target: String,
    #[prost(uint64, tag = "10")]
    pub major: u64,
    #[prost(uint64, tag = "11")]
    pub minor: u64,
    #[prost(message, repeated, tag = "12")]
    pub xattr: Vec<XAttr>,
    #[prost(message, repeated, tag = "13")]
    pub ads: Vec<AdsEntry>,
}

/// Extended attributes are parsed, but not exposed.
#[derive(Clone, PartialEq, prost::Message)]
pub struct XAttr {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Alternate data streams are parsed, but not exposed.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AdsEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(string, tag = "3")]
    pub digest: String,
}

/// Bits of [Resource::mode].
/// The permission bits live at the bottom, type bits at the top.
pub mod mode {
    pub const DIR: u32 = 1 << 31;
    pub const APPEND: u32 = 1 << 30;
    pub const EXCLUSIVE: u32 = 1 << 29;
    pub const TEMPORARY: u32 = 1 << 28;
    pub const SYMLINK: u32 = 1 << 27;
    pub const DEVICE: u32 = 1 << 26;
    pub const NAMED_PIPE: u32 = 1 << 25;
    pub const SOCKET: u32 = 1 << 24;
    pub const SETUID: u32 = 1 << 23;
    pub const SETGID: u32 = 1 << 22;
    pub const CHAR_DEVICE: u32 = 1 << 21;
    pub const STICKY: u32 = 1 << 20;
    pub const IRREGULAR: u32 = 1 << 19;

    pub const PERM: u32 = 0o777;

    /// Type bits we refuse to present.
    pub const SPECIAL: u32 = DEVICE | NAMED_PIPE | SOCKET | CHAR_DEVICE | IRREGULAR;
}

/// The kind of a [Resource], derived from its mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Directory,
    Symlink,
    Regular,
    Special,
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        if self.mode & mode::DIR != 0 {
            ResourceKind::Directory
        } else if self.mode & mode::SYMLINK != 0 {
            ResourceKind::Symlink
        } else if self.mode & mode::SPECIAL != 0 {
            ResourceKind::Special
        } else {
            ResourceKind::Regular
        }
    }

    /// Translates the mode to a POSIX `st_mode`.
    #[allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS
    pub fn posix_mode(&self) -> u32 {
        let mut m = self.mode & mode::PERM;
        if self.mode & mode::SETUID != 0 {
            m |= libc::S_ISUID as u32;
        }
        if self.mode & mode::SETGID != 0 {
            m |= libc::S_ISGID as u32;
        }
        if self.mode & mode::STICKY != 0 {
            m |= libc::S_ISVTX as u32;
        }
        m | match self.kind() {
            ResourceKind::Directory => libc::S_IFDIR as u32,
            ResourceKind::Symlink => libc::S_IFLNK as u32,
            ResourceKind::Regular | ResourceKind::Special => libc::S_IFREG as u32,
        }
    }

    /// Returns the authoritative content digest, if any.
    pub fn content_digest(&self) -> Result<Option<Digest>, Error> {
        match self.digest.first() {
            None => Ok(None),
            Some(d) => Ok(Some(d.parse()?)),
        }
    }
}

/// Parses a layer manifest blob, after checking its media type.
pub fn parse_layer(desc: &Descriptor, data: &[u8]) -> Result<Manifest, Error> {
    if desc.media_type != MEDIA_TYPE_CONTINUITY_MANIFEST {
        return Err(Error::UnsupportedMediaType(desc.media_type.clone()));
    }
    Ok(<Manifest as prost::Message>::decode(data)?)
}
