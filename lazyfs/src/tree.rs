//! A path-indexed tree, and the tree of an image built from its layers.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::manifest::{mode, Manifest, Resource, ResourceKind};
use crate::Error;

/// The inode of the root directory.
pub const ROOT_INODE: u64 = 1;

/// A node in a [Tree]. Children are keyed by their basename.
#[derive(Debug)]
pub struct TreeNode<T> {
    children: BTreeMap<String, TreeNode<T>>,
    payload: Option<T>,
}

impl<T> Default for TreeNode<T> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            payload: None,
        }
    }
}

impl<T> TreeNode<T> {
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    /// Iterates over all children, ordered by name.
    pub fn children(&self) -> impl Iterator<Item = (&str, &TreeNode<T>)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn child(&self, name: &str) -> Option<&TreeNode<T>> {
        self.children.get(name)
    }
}

/// Splits a path at sep, skipping empty segments and rejecting `.` and `..`.
fn segments(sep: char, path: &str) -> impl Iterator<Item = Result<&str, Error>> {
    path.split(sep).filter(|s| !s.is_empty()).map(|s| {
        if s == "." || s == ".." {
            Err(Error::DisallowedPathSegment(s.to_string()))
        } else {
            Ok(s)
        }
    })
}

/// A tree of nodes, addressed by paths split at a separator.
/// Empty path segments are skipped, so `""`, `"/"` and `"//"` all address the
/// root, and `"/usr//bin/"` is the same as `"usr/bin"`.
/// `.` and `..` are never allowed.
#[derive(Debug)]
pub struct Tree<T> {
    root: TreeNode<T>,
    sep: char,
}

impl<T> Tree<T> {
    pub fn new(sep: char) -> Self {
        Self {
            root: TreeNode::default(),
            sep,
        }
    }

    /// Whether the path addresses the root node.
    pub fn is_root_path(&self, path: &str) -> bool {
        segments(self.sep, path).next().is_none()
    }

    /// Stores x at path, creating intermediate nodes as needed.
    /// Something already stored at that path is replaced.
    pub fn insert(&mut self, path: &str, x: T) -> Result<(), Error> {
        // validate all segments before touching the tree.
        let parts = segments(self.sep, path).collect::<Result<Vec<_>, _>>()?;

        let mut n = &mut self.root;
        for s in parts {
            n = n.children.entry(s.to_string()).or_default();
        }
        n.payload = Some(x);
        Ok(())
    }

    /// Returns the node at path, if any.
    pub fn lookup(&self, path: &str) -> Result<Option<&TreeNode<T>>, Error> {
        let mut n = &self.root;
        for s in segments(self.sep, path) {
            match n.children.get(s?) {
                Some(nn) => n = nn,
                None => return Ok(None),
            }
        }
        Ok(Some(n))
    }

    /// Calls f for every node (parents before children), passing the full path
    /// of the node, joined with the separator.
    fn walk_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(&str, &mut TreeNode<T>),
    {
        fn walk<T, F>(sep: char, path: &mut String, n: &mut TreeNode<T>, f: &mut F)
        where
            F: FnMut(&str, &mut TreeNode<T>),
        {
            if path.is_empty() {
                f(&sep.to_string(), n);
            } else {
                f(path, n);
            }
            for (name, child) in n.children.iter_mut() {
                let len = path.len();
                path.push(sep);
                path.push_str(name);
                walk(sep, path, child, f);
                path.truncate(len);
            }
        }

        walk(self.sep, &mut String::new(), &mut self.root, &mut f);
    }
}

/// Binds a path to the [Resource] owning it.
/// All paths of the same resource share the inode.
#[derive(Clone, Debug)]
pub struct TreeItem {
    pub resource: Arc<Resource>,
    pub inode: u64,
}

/// The filesystem tree of an image: all resources of all layers, overlaid
/// in order, with an inode assigned to every node.
#[derive(Debug)]
pub struct ImageTree {
    tree: Tree<TreeItem>,

    /// One path for every inode, used to resolve inode-based requests.
    paths: HashMap<u64, String>,
}

/// The resource used for directories not described by any layer.
fn implicit_directory() -> Resource {
    Resource {
        mode: mode::DIR | 0o755,
        ..Default::default()
    }
}

impl ImageTree {
    /// Builds the tree from the layer manifests, in order. Later layers win.
    pub fn from_layers<I>(layers: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Manifest>,
    {
        let mut tree = Tree::new('/');
        tree.insert(
            "/",
            TreeItem {
                resource: Arc::new(implicit_directory()),
                inode: ROOT_INODE,
            },
        )?;

        let mut next_inode = ROOT_INODE + 1;

        for (i, layer) in layers.into_iter().enumerate() {
            debug!(layer = i, resources = layer.resource.len(), "inserting layer");
            for resource in layer.resource {
                if resource.path.is_empty() {
                    return Err(Error::Malformed("resource without path".to_string()));
                }

                match resource.kind() {
                    ResourceKind::Directory if !resource.digest.is_empty() => {
                        return Err(Error::Malformed(format!(
                            "directory {:?} with digests",
                            resource.path
                        )));
                    }
                    ResourceKind::Special => {
                        warn!(path = ?resource.path, mode = resource.mode, "skipping special file");
                        continue;
                    }
                    _ => {}
                }

                let inode = if resource.path.iter().any(|p| tree.is_root_path(p)) {
                    ROOT_INODE
                } else {
                    let inode = next_inode;
                    next_inode += 1;
                    inode
                };

                let resource = Arc::new(resource);
                for path in &resource.path {
                    tree.insert(
                        path,
                        TreeItem {
                            resource: resource.clone(),
                            inode,
                        },
                    )?;
                }
            }
        }

        // Give every directory only existing as parent its own inode, and
        // remember a path for every inode.
        let implicit = Arc::new(implicit_directory());
        let mut paths = HashMap::new();
        tree.walk_mut(|path, n| {
            let item = n.payload.get_or_insert_with(|| {
                let inode = next_inode;
                next_inode += 1;
                TreeItem {
                    resource: implicit.clone(),
                    inode,
                }
            });
            paths.entry(item.inode).or_insert_with(|| path.to_string());
        });

        Ok(Self { tree, paths })
    }

    pub fn lookup(&self, path: &str) -> Result<Option<&TreeNode<TreeItem>>, Error> {
        self.tree.lookup(path)
    }

    /// Returns a path of the given inode, and its node.
    pub fn lookup_inode(&self, inode: u64) -> Option<(&str, &TreeNode<TreeItem>)> {
        let path = self.paths.get(&inode)?;
        // every path in self.paths was taken from the tree.
        let node = self.tree.lookup(path).ok().flatten()?;
        Some((path.as_str(), node))
    }
}
