//! The virtual namespace.
//!
//! A [`VirtualTree`] is the single source of truth for "what does virtual path
//! P resolve to". Children are keyed by their case-folded name in a
//! `BTreeMap`, which keeps sibling names unique under case-insensitive
//! comparison and makes every traversal order deterministic.

pub mod dump;

use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, VfsError};
use crate::types::{LinkFlags, VirtualPath};

/// Kind of a virtual node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

/// Whether a lookup comes from a read-style or a create-style operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    /// Opening, querying or enumerating an existing entry
    Read,
    /// Creating a new file or directory
    Create,
}

/// One path component in the overlay namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualNode {
    name: String,
    kind: NodeKind,
    link_target: Option<PathBuf>,
    flags: LinkFlags,
    children: BTreeMap<String, VirtualNode>,
    create_target: Option<PathBuf>,
}

impl VirtualNode {
    fn new(name: &str, kind: NodeKind, link_target: Option<PathBuf>, flags: LinkFlags) -> Self {
        Self {
            name: name.to_string(),
            kind,
            link_target,
            flags,
            children: BTreeMap::new(),
            create_target: None,
        }
    }

    fn implicit_directory(name: &str) -> Self {
        Self::new(name, NodeKind::Directory, None, LinkFlags::empty())
    }

    /// Display name (original spelling).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Real path this node resolves to; `None` for a purely virtual directory.
    pub fn link_target(&self) -> Option<&Path> {
        self.link_target.as_deref()
    }

    /// Flags of the link operation that produced this node.
    pub fn flags(&self) -> LinkFlags {
        self.flags
    }

    /// Create-target set on exactly this node.
    pub fn create_target(&self) -> Option<&Path> {
        self.create_target.as_deref()
    }

    /// Children in folded-name order.
    pub fn children(&self) -> impl Iterator<Item = &VirtualNode> {
        self.children.values()
    }

    /// Looks up a direct child by name (case-insensitive).
    pub fn child(&self, name: &str) -> Option<&VirtualNode> {
        self.children.get(&crate::types::fold_name(name))
    }

    fn count(&self) -> usize {
        1 + self.children.values().map(VirtualNode::count).sum::<usize>()
    }

    fn links_within(&self, root: &Path) -> bool {
        self.link_target
            .as_deref()
            .map(|target| target.starts_with(root))
            .unwrap_or(false)
    }

    fn make_implicit(&mut self) {
        self.link_target = None;
        self.flags = LinkFlags::empty();
    }

    /// Drops descendants linking inside `root`; returns how many were dropped.
    fn prune_within(&mut self, root: &Path) -> usize {
        let mut removed = 0;
        self.children.retain(|_, child| {
            removed += child.prune_within(root);
            if !child.links_within(root) {
                return true;
            }
            if child.children.is_empty() {
                removed += 1;
                false
            } else {
                child.make_implicit();
                true
            }
        });
        removed
    }
}

/// Owned snapshot of a node, handed out across the instance lock.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKind,
    pub link_target: Option<PathBuf>,
    pub flags: LinkFlags,
    pub create_target: Option<PathBuf>,
    pub child_count: usize,
}

impl From<&VirtualNode> for NodeInfo {
    fn from(node: &VirtualNode) -> Self {
        Self {
            name: node.name.clone(),
            kind: node.kind,
            link_target: node.link_target.clone(),
            flags: node.flags,
            create_target: node.create_target.clone(),
            child_count: node.children.len(),
        }
    }
}

/// The hierarchical namespace of virtual nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualTree {
    root: VirtualNode,
}

impl Default for VirtualTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualTree {
    /// Creates a tree holding only the root directory.
    pub fn new() -> Self {
        Self {
            root: VirtualNode::implicit_directory(""),
        }
    }

    pub fn root(&self) -> &VirtualNode {
        &self.root
    }

    /// Resets the tree to an empty root.
    pub fn clear(&mut self) {
        self.root = VirtualNode::implicit_directory("");
    }

    /// Returns true if nothing but the root exists.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && self.root.create_target.is_none()
    }

    /// Total number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.root.count()
    }

    /// Finds the node at `path` in O(depth).
    pub fn lookup(&self, path: &VirtualPath) -> Option<&VirtualNode> {
        let mut node = &self.root;
        for key in path.keys() {
            node = node.children.get(key)?;
        }
        Some(node)
    }

    fn lookup_mut(&mut self, path: &VirtualPath) -> Option<&mut VirtualNode> {
        let mut node = &mut self.root;
        for key in path.keys() {
            node = node.children.get_mut(key)?;
        }
        Some(node)
    }

    /// Returns true if a directory node exists at `path`.
    pub fn directory_exists(&self, path: &VirtualPath) -> bool {
        self.lookup(path).map(VirtualNode::is_directory).unwrap_or(false)
    }

    /// Checks that every existing ancestor of `path` is a directory, so a
    /// node can be placed at `path` without failing halfway.
    pub fn check_hostable(&self, path: &VirtualPath) -> Result<()> {
        let mut node = &self.root;
        let segments = path.segments();
        for (depth, segment) in segments.iter().enumerate().take(segments.len().saturating_sub(1)) {
            match node.children.get(segment.key()) {
                Some(child) if child.is_directory() => node = child,
                Some(_) => {
                    return Err(VfsError::NotADirectory {
                        path: VirtualPath::root().join_segments(&segments[..=depth]).to_string(),
                    })
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn ensure_directory(&mut self, path: &VirtualPath) -> Result<&mut VirtualNode> {
        let mut node = &mut self.root;
        for (depth, segment) in path.segments().iter().enumerate() {
            let child = node
                .children
                .entry(segment.key().to_string())
                .or_insert_with(|| VirtualNode::implicit_directory(segment.name()));
            if !child.is_directory() {
                return Err(VfsError::NotADirectory {
                    path: VirtualPath::root()
                        .join_segments(&path.segments()[..=depth])
                        .to_string(),
                });
            }
            node = child;
        }
        Ok(node)
    }

    /// Places a node at `path`, creating implicit parent directories.
    ///
    /// A directory linked onto an existing directory keeps its children (this
    /// is what layers successive directory links); anything else replaces the
    /// existing node.
    ///
    /// # Returns
    /// `true` if an existing node was replaced or merged
    pub fn link(
        &mut self,
        path: &VirtualPath,
        kind: NodeKind,
        link_target: Option<PathBuf>,
        flags: LinkFlags,
    ) -> Result<bool> {
        let (parent_path, segment) = match (path.parent(), path.segments().last()) {
            (Some(parent), Some(segment)) => (parent, segment.clone()),
            _ => {
                return Err(VfsError::invalid_parameters(
                    "the virtual root cannot be linked",
                ))
            }
        };

        let parent = self.ensure_directory(&parent_path)?;
        match parent.children.entry(segment.key().to_string()) {
            Entry::Occupied(mut occupied) => {
                let node = occupied.get_mut();
                if node.is_directory() && kind == NodeKind::Directory {
                    node.name = segment.name().to_string();
                    node.link_target = link_target;
                    node.flags = flags;
                } else {
                    *node = VirtualNode::new(segment.name(), kind, link_target, flags);
                }
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(VirtualNode::new(segment.name(), kind, link_target, flags));
                Ok(false)
            }
        }
    }

    /// Creates an implicit directory (no link target) at `path` if missing.
    pub fn ensure_virtual_directory(&mut self, path: &VirtualPath) -> Result<()> {
        self.ensure_directory(path).map(|_| ())
    }

    /// Removes the node at `path` together with its subtree.
    pub fn remove(&mut self, path: &VirtualPath) -> Option<VirtualNode> {
        let parent = self.lookup_mut(&path.parent()?)?;
        let key = path.segments().last()?.key();
        parent.children.remove(key)
    }

    /// Removes the node at `path` and every descendant linking inside `root`.
    ///
    /// Nodes that still hold children from other links stay as implicit
    /// directories, the node at `path` included.
    ///
    /// # Returns
    /// Number of nodes removed
    pub fn prune(&mut self, path: &VirtualPath, root: &Path) -> usize {
        let (Some(parent_path), Some(segment)) = (path.parent(), path.segments().last()) else {
            return 0;
        };
        let key = segment.key().to_string();
        let Some(parent) = self.lookup_mut(&parent_path) else {
            return 0;
        };
        let Some(node) = parent.children.get_mut(&key) else {
            return 0;
        };

        let removed = node.prune_within(root);
        if node.children.is_empty() {
            parent.children.remove(&key);
            removed + 1
        } else {
            node.make_implicit();
            removed
        }
    }

    /// Sets the create-target of the directory at `path`, replacing any
    /// previous create-target on that exact node.
    pub fn set_create_target(&mut self, path: &VirtualPath, target: PathBuf) -> Result<()> {
        match self.lookup_mut(path) {
            Some(node) if node.is_directory() => {
                node.create_target = Some(target);
                Ok(())
            }
            Some(_) => Err(VfsError::NotADirectory {
                path: path.to_string(),
            }),
            None => Err(VfsError::PathNotFound {
                path: path.to_string(),
            }),
        }
    }

    /// Finds the innermost create-target that applies to `path`.
    ///
    /// # Returns
    /// The depth of the node owning the create-target and the target itself
    pub fn create_target_for(&self, path: &VirtualPath) -> Option<(usize, &Path)> {
        let mut node = &self.root;
        let mut best = node.create_target.as_deref().map(|target| (0, target));
        for (depth, key) in path.keys().enumerate() {
            match node.children.get(key) {
                Some(child) => {
                    node = child;
                    if let Some(target) = node.create_target.as_deref() {
                        best = Some((depth + 1, target));
                    }
                }
                None => break,
            }
        }
        best
    }

    /// Real path a create-style operation on `path` is redirected to.
    pub fn redirect_create(&self, path: &VirtualPath) -> Option<PathBuf> {
        let (depth, target) = self.create_target_for(path)?;
        let mut redirected = target.to_path_buf();
        for segment in &path.segments()[depth..] {
            redirected.push(segment.name());
        }
        Some(redirected)
    }

    /// Resolves a virtual path for a hooked filesystem call.
    ///
    /// Read-style operations get the node's direct link target. Create-style
    /// operations on an existing linked entry also get its link target;
    /// otherwise they are redirected through the innermost create-target.
    pub fn resolve(&self, path: &VirtualPath, intent: AccessIntent) -> Option<PathBuf> {
        let linked = self
            .lookup(path)
            .and_then(|node| node.link_target.clone());
        match intent {
            AccessIntent::Read => linked,
            AccessIntent::Create => linked.or_else(|| self.redirect_create(path)),
        }
    }

    /// Snapshots the children of the directory at `path`.
    pub fn list_directory(&self, path: &VirtualPath) -> Option<Vec<NodeInfo>> {
        let node = self.lookup(path)?;
        if !node.is_directory() {
            return None;
        }
        Some(node.children.values().map(NodeInfo::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vp(path: &str) -> VirtualPath {
        VirtualPath::parse(path).unwrap()
    }

    #[test]
    fn test_link_creates_implicit_parents() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/a/b/c.txt"), NodeKind::File, Some("src/c.txt".into()), LinkFlags::empty())
            .unwrap();

        let a = tree.lookup(&vp("/A")).unwrap();
        assert!(a.is_directory());
        assert!(a.link_target().is_none());
        assert_eq!(
            tree.resolve(&vp("/a/B/C.TXT"), AccessIntent::Read),
            Some(PathBuf::from("src/c.txt"))
        );
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn test_sibling_names_unique_case_insensitive() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/Data.txt"), NodeKind::File, Some("one".into()), LinkFlags::empty())
            .unwrap();
        let replaced = tree
            .link(&vp("/DATA.TXT"), NodeKind::File, Some("two".into()), LinkFlags::empty())
            .unwrap();

        assert!(replaced);
        assert_eq!(tree.root().children().count(), 1);
        assert_eq!(tree.lookup(&vp("/data.txt")).unwrap().name(), "DATA.TXT");
    }

    #[test]
    fn test_directory_link_merges_children() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/mods"), NodeKind::Directory, Some("A".into()), LinkFlags::empty())
            .unwrap();
        tree.link(&vp("/mods/x"), NodeKind::File, Some("A/x".into()), LinkFlags::empty())
            .unwrap();
        tree.link(&vp("/mods"), NodeKind::Directory, Some("B".into()), LinkFlags::RECURSIVE)
            .unwrap();

        let mods = tree.lookup(&vp("/mods")).unwrap();
        assert_eq!(mods.link_target(), Some(Path::new("B")));
        assert!(mods.child("x").is_some());
    }

    #[test]
    fn test_file_has_no_children() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/f"), NodeKind::File, Some("f".into()), LinkFlags::empty())
            .unwrap();
        assert!(matches!(
            tree.check_hostable(&vp("/f/inner")),
            Err(VfsError::NotADirectory { .. })
        ));
        assert!(tree
            .link(&vp("/f/inner"), NodeKind::File, None, LinkFlags::empty())
            .is_err());
        assert!(tree.lookup(&vp("/f")).unwrap().children().next().is_none());
    }

    #[test]
    fn test_root_cannot_be_linked() {
        let mut tree = VirtualTree::new();
        assert!(tree
            .link(&VirtualPath::root(), NodeKind::Directory, Some("x".into()), LinkFlags::empty())
            .is_err());
    }

    #[test]
    fn test_create_target_innermost_wins() {
        let mut tree = VirtualTree::new();
        tree.ensure_virtual_directory(&vp("/a/b")).unwrap();
        tree.set_create_target(&vp("/a"), PathBuf::from("X")).unwrap();
        tree.set_create_target(&vp("/a/b"), PathBuf::from("Y")).unwrap();

        assert_eq!(tree.create_target_for(&vp("/a/b/c")).unwrap().1, Path::new("Y"));
        assert_eq!(tree.create_target_for(&vp("/a/d")).unwrap().1, Path::new("X"));
        assert!(tree.create_target_for(&vp("/z")).is_none());

        assert_eq!(
            tree.resolve(&vp("/a/b/c"), AccessIntent::Create),
            Some(PathBuf::from("Y").join("c"))
        );
        assert_eq!(
            tree.resolve(&vp("/a/d/e.txt"), AccessIntent::Create),
            Some(PathBuf::from("X").join("d").join("e.txt"))
        );
        assert_eq!(tree.resolve(&vp("/a/d"), AccessIntent::Read), None);
    }

    #[test]
    fn test_create_target_replaces_on_same_node() {
        let mut tree = VirtualTree::new();
        tree.ensure_virtual_directory(&vp("/a")).unwrap();
        tree.set_create_target(&vp("/a"), PathBuf::from("X")).unwrap();
        tree.set_create_target(&vp("/a"), PathBuf::from("Z")).unwrap();
        assert_eq!(tree.create_target_for(&vp("/a/q")).unwrap().1, Path::new("Z"));
        assert!(tree.set_create_target(&vp("/missing"), PathBuf::from("Q")).is_err());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/a/b"), NodeKind::File, Some("b".into()), LinkFlags::empty())
            .unwrap();
        assert!(tree.remove(&vp("/a/b")).is_some());
        assert!(tree.lookup(&vp("/a/b")).is_none());
        assert!(tree.remove(&vp("/a/b")).is_none());

        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree, VirtualTree::new());
    }

    #[test]
    fn test_prune_keeps_foreign_children() {
        let mut tree = VirtualTree::new();
        let flags = LinkFlags::RECURSIVE;
        tree.link(&vp("/mnt/sub"), NodeKind::Directory, Some("A/sub".into()), flags)
            .unwrap();
        tree.link(&vp("/mnt/sub/own.txt"), NodeKind::File, Some("A/sub/own.txt".into()), flags)
            .unwrap();
        tree.link(&vp("/mnt/sub/deep"), NodeKind::Directory, Some("A/sub/deep".into()), flags)
            .unwrap();
        tree.link(&vp("/mnt/sub/deep/extra.txt"), NodeKind::File, Some("B/extra.txt".into()), flags)
            .unwrap();

        assert_eq!(tree.prune(&vp("/mnt/sub"), Path::new("A/sub")), 1);
        let sub = tree.lookup(&vp("/mnt/sub")).unwrap();
        assert!(sub.link_target().is_none());
        assert!(sub.child("own.txt").is_none());
        let deep = sub.child("deep").unwrap();
        assert!(deep.link_target().is_none());
        assert!(deep.child("extra.txt").is_some());

        tree.link(&vp("/mnt/gone"), NodeKind::File, Some("A/gone".into()), flags)
            .unwrap();
        assert_eq!(tree.prune(&vp("/mnt/gone"), Path::new("A/gone")), 1);
        assert!(tree.lookup(&vp("/mnt/gone")).is_none());
        assert_eq!(tree.prune(&vp("/mnt/gone"), Path::new("A/gone")), 0);
    }

    #[test]
    fn test_list_directory() {
        let mut tree = VirtualTree::new();
        tree.link(&vp("/d/b.txt"), NodeKind::File, Some("b".into()), LinkFlags::empty())
            .unwrap();
        tree.link(&vp("/d/A.txt"), NodeKind::File, Some("a".into()), LinkFlags::empty())
            .unwrap();

        let names: Vec<String> = tree
            .list_directory(&vp("/d"))
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, vec!["A.txt", "b.txt"]);
        assert!(tree.list_directory(&vp("/d/b.txt")).is_none());
    }
}
