// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The Merkle model for directories.
//!
//! A `DigestTrie` is a tree of named children, canonically ordered by name. Its identity is the
//! digest of its canonical REAPI `Directory` serialization, so on-disk data, in-memory data and
//! on-wire data all share one canonicalization. Digests are computed once, bottom-up, when a
//! trie is constructed: everything above a node can assume its digest is already settled.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Display};
use std::hash::{self, Hash};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Serialize;

use grpc_util::prost::MessageExt;
use hashing::{Digest, EMPTY_DIGEST};
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use protos::require_digest;

use crate::{LinkDepth, PathStat, RelativePath, MAX_LINK_DEPTH};

pub static EMPTY_DIGEST_TREE: Lazy<DigestTrie> =
    Lazy::new(|| DigestTrie::from_children(BTreeMap::new()));
pub static EMPTY_DIRECTORY_DIGEST: Lazy<DirectoryDigest> = Lazy::new(|| DirectoryDigest {
    digest: EMPTY_DIGEST,
    tree: Some(EMPTY_DIGEST_TREE.clone()),
});

#[derive(Clone, Copy)]
pub enum SymlinkBehavior {
    /// Surface symlinks as themselves.
    Aware,
    /// Resolve symlinks to their targets within the tree.
    Oblivious,
}

///
/// One path component.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Name(Arc<str>);

impl Name {
    pub fn new(name: &str) -> Result<Name, String> {
        if name.is_empty() || name.contains('/') {
            return Err(format!("Not a valid path component: {name:?}"));
        }
        Ok(Name(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for Name {
    fn as_ref(&self) -> &Path {
        Path::new(&*self.0)
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.write_str(&self.0)
    }
}

///
/// The stored form of a child: file and symlink leaves inline, subdirectories as nested tries.
///
#[derive(Clone, Debug)]
enum ChildEntry {
    File { digest: Digest, is_executable: bool },
    Symlink { target: PathBuf },
    Directory(DigestTrie),
}

///
/// A canonically-ordered Merkle tree of named children, with its digest computed at
/// construction.
///
#[derive(Clone)]
pub struct DigestTrie(Arc<TrieNode>);

struct TrieNode {
    children: BTreeMap<Name, ChildEntry>,
    digest: Digest,
}

impl Debug for DigestTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestTrie")
            .field("digest", &self.0.digest)
            .field("children", &self.0.children.len())
            .finish()
    }
}

///
/// A Digest for a directory, optionally with its content held as a DigestTrie.
///
/// When the `tree` is absent, the digest refers to content which must already be persisted in a
/// Store (locally or remotely); when present, it acts as a cache of the content, which may or
/// may not have been persisted yet. Equality and hashing are by digest alone.
///
#[derive(Clone, Serialize)]
pub struct DirectoryDigest {
    // NB: Private so that a caller cannot forget to consider whether the tree has been
    // persisted before shipping the bare digest somewhere.
    digest: Digest,
    #[serde(skip_serializing)]
    pub tree: Option<DigestTrie>,
}

impl workunit_store::DirectoryDigest for DirectoryDigest {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Eq for DirectoryDigest {}

impl PartialEq for DirectoryDigest {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Hash for DirectoryDigest {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl Debug for DirectoryDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = if self.tree.is_some() {
            "in-memory"
        } else {
            "persisted"
        };
        write!(f, "DirectoryDigest({:?}, {tree})", self.digest)
    }
}

impl DirectoryDigest {
    ///
    /// Pair a Digest with the DigestTrie it identifies, asserting their consistency.
    ///
    pub fn new(digest: Digest, tree: DigestTrie) -> Self {
        debug_assert!(
            digest == tree.compute_root_digest(),
            "{digest:?} does not identify the given tree ({:?})",
            tree.compute_root_digest(),
        );
        Self {
            digest,
            tree: Some(tree),
        }
    }

    ///
    /// Wrap a Digest which is known to be persisted in a Store. Prefer carrying a full
    /// DirectoryDigest wherever possible: this constructor forces consumers to reload content.
    ///
    pub fn from_persisted_digest(digest: Digest) -> Self {
        Self { digest, tree: None }
    }

    pub fn as_digest(&self) -> Digest {
        self.digest
    }

    ///
    /// The digests reachable from this DirectoryDigest: just the root when the content is not
    /// in memory.
    ///
    pub fn digests(&self) -> Vec<Digest> {
        match &self.tree {
            None => vec![self.digest],
            Some(tree) => {
                let mut digests = vec![self.digest];
                tree.collect_digests(&mut digests);
                digests
            }
        }
    }
}

impl From<DigestTrie> for DirectoryDigest {
    fn from(tree: DigestTrie) -> Self {
        Self {
            digest: tree.compute_root_digest(),
            tree: Some(tree),
        }
    }
}

//
// Views: the entry types handed out by `entries`, `walk` and `entry`. They are assembled on
// demand from the stored representation.
//

#[derive(Clone, Debug)]
pub enum Entry {
    Directory(Directory),
    File(File),
    Symlink(Symlink),
}

impl Entry {
    fn new(name: &Name, child: &ChildEntry) -> Entry {
        match child {
            ChildEntry::File {
                digest,
                is_executable,
            } => Entry::File(File {
                name: name.clone(),
                digest: *digest,
                is_executable: *is_executable,
            }),
            ChildEntry::Symlink { target } => Entry::Symlink(Symlink {
                name: name.clone(),
                target: target.clone(),
            }),
            ChildEntry::Directory(trie) => Entry::Directory(Directory {
                name: name.clone(),
                trie: trie.clone(),
            }),
        }
    }

    pub fn name(&self) -> &Name {
        match self {
            Entry::Directory(d) => &d.name,
            Entry::File(f) => &f.name,
            Entry::Symlink(s) => &s.name,
        }
    }

    pub fn digest(&self) -> Digest {
        match self {
            Entry::Directory(d) => d.digest(),
            Entry::File(f) => f.digest,
            Entry::Symlink(_) => EMPTY_DIGEST,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Directory {
    name: Name,
    trie: DigestTrie,
}

impl Directory {
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn digest(&self) -> Digest {
        self.trie.compute_root_digest()
    }

    pub fn tree(&self) -> &DigestTrie {
        &self.trie
    }
}

#[derive(Clone, Debug)]
pub struct File {
    name: Name,
    digest: Digest,
    is_executable: bool,
}

impl File {
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn is_executable(&self) -> bool {
        self.is_executable
    }
}

#[derive(Clone, Debug)]
pub struct Symlink {
    name: Name,
    target: PathBuf,
}

impl Symlink {
    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

///
/// A borrowed path plus its filesystem type: the input to trie construction.
///
pub enum TypedPath<'a> {
    File { path: &'a Path, is_executable: bool },
    Link { path: &'a Path, target: &'a Path },
    Dir(&'a Path),
}

impl<'a> std::ops::Deref for TypedPath<'a> {
    type Target = Path;

    fn deref(&self) -> &Path {
        match self {
            TypedPath::File { path, .. } => path,
            TypedPath::Link { path, .. } => path,
            TypedPath::Dir(d) => d,
        }
    }
}

impl<'a> From<&'a PathStat> for TypedPath<'a> {
    fn from(p: &'a PathStat) -> Self {
        match p {
            PathStat::File { path, stat } => TypedPath::File {
                path,
                is_executable: stat.is_executable,
            },
            PathStat::Link { path, stat } => TypedPath::Link {
                path,
                target: &stat.target,
            },
            PathStat::Dir { path, .. } => TypedPath::Dir(path),
        }
    }
}

///
/// The mutable structure into which paths are inserted before a trie is frozen (and its digests
/// computed).
///
enum BuilderNode {
    File { digest: Digest, is_executable: bool },
    Symlink { target: PathBuf },
    Directory(BTreeMap<String, BuilderNode>),
}

impl BuilderNode {
    fn insert(
        children: &mut BTreeMap<String, BuilderNode>,
        path: &Path,
        node: BuilderNode,
    ) -> Result<(), String> {
        let mut components = path
            .components()
            .map(|component| match component {
                Component::Normal(name) => name
                    .to_str()
                    .map(str::to_owned)
                    .ok_or_else(|| format!("{name:?} is not representable in UTF8")),
                other => Err(format!("Unsupported component in {path:?}: {other:?}")),
            })
            .collect::<Result<Vec<String>, String>>()?;
        let Some(leaf_name) = components.pop() else {
            return Err(format!("Cannot insert an empty path: {path:?}"));
        };

        let mut current = children;
        for component in components {
            let child = current
                .entry(component)
                .or_insert_with(|| BuilderNode::Directory(BTreeMap::new()));
            match child {
                BuilderNode::Directory(grandchildren) => current = grandchildren,
                _ => {
                    return Err(format!(
                        "Cannot insert {path:?}: a parent component is not a directory."
                    ));
                }
            }
        }

        match (current.entry(leaf_name), node) {
            // A directory which already exists (e.g. because a file beneath it was inserted
            // first) satisfies a Dir insertion.
            (std::collections::btree_map::Entry::Occupied(entry), BuilderNode::Directory(_))
                if matches!(entry.get(), BuilderNode::Directory(_)) => {}
            (std::collections::btree_map::Entry::Occupied(_), _) => {
                return Err(format!(
                    "Snapshots must be constructed from unique paths: {path:?} was duplicated."
                ));
            }
            (std::collections::btree_map::Entry::Vacant(entry), node) => {
                entry.insert(node);
            }
        }
        Ok(())
    }

    fn freeze(children: BTreeMap<String, BuilderNode>) -> Result<DigestTrie, String> {
        let mut frozen = BTreeMap::new();
        for (name, child) in children {
            let name = Name::new(&name)?;
            let child = match child {
                BuilderNode::File {
                    digest,
                    is_executable,
                } => ChildEntry::File {
                    digest,
                    is_executable,
                },
                BuilderNode::Symlink { target } => ChildEntry::Symlink { target },
                BuilderNode::Directory(grandchildren) => {
                    ChildEntry::Directory(Self::freeze(grandchildren)?)
                }
            };
            frozen.insert(name, child);
        }
        Ok(DigestTrie::from_children(frozen))
    }
}

impl DigestTrie {
    fn from_children(children: BTreeMap<Name, ChildEntry>) -> DigestTrie {
        let digest = if children.is_empty() {
            EMPTY_DIGEST
        } else {
            Digest::of_bytes(&serialize_children(&children).to_bytes())
        };
        DigestTrie(Arc::new(TrieNode { children, digest }))
    }

    ///
    /// Build a trie from the given paths (which must be unique) and the digests of their file
    /// contents.
    ///
    pub fn from_unique_paths(
        path_stats: Vec<TypedPath>,
        file_digests: &HashMap<PathBuf, Digest>,
    ) -> Result<DigestTrie, String> {
        let mut builder = BTreeMap::new();
        for typed_path in &path_stats {
            let node = match typed_path {
                TypedPath::File {
                    path,
                    is_executable,
                } => {
                    let digest = file_digests.get(*path).ok_or_else(|| {
                        format!("No digest was captured for the file {path:?}.")
                    })?;
                    BuilderNode::File {
                        digest: *digest,
                        is_executable: *is_executable,
                    }
                }
                TypedPath::Link { target, .. } => BuilderNode::Symlink {
                    target: target.to_path_buf(),
                },
                TypedPath::Dir(_) => BuilderNode::Directory(BTreeMap::new()),
            };
            BuilderNode::insert(&mut builder, typed_path, node)?;
        }
        BuilderNode::freeze(builder)
    }

    ///
    /// Reassemble a trie from a root `Directory` proto and the transitive child protos, keyed
    /// by their digests.
    ///
    pub fn from_remexec_directories(
        root: &remexec::Directory,
        children_by_digest: &HashMap<Digest, remexec::Directory>,
    ) -> Result<DigestTrie, String> {
        let mut children = BTreeMap::new();
        for file_node in &root.files {
            children.insert(
                Name::new(&file_node.name)?,
                ChildEntry::File {
                    digest: require_digest(file_node.digest.as_ref())?,
                    is_executable: file_node.is_executable,
                },
            );
        }
        for symlink_node in &root.symlinks {
            children.insert(
                Name::new(&symlink_node.name)?,
                ChildEntry::Symlink {
                    target: PathBuf::from(&symlink_node.target),
                },
            );
        }
        for dir_node in &root.directories {
            let digest = require_digest(dir_node.digest.as_ref())?;
            let child = children_by_digest.get(&digest).ok_or_else(|| {
                format!(
                    "The child directory {} ({digest:?}) was not present.",
                    dir_node.name
                )
            })?;
            children.insert(
                Name::new(&dir_node.name)?,
                ChildEntry::Directory(Self::from_remexec_directories(child, children_by_digest)?),
            );
        }
        Ok(Self::from_children(children))
    }

    ///
    /// Reassemble a trie from a REAPI `Tree` message.
    ///
    pub fn from_remexec_tree(tree: &remexec::Tree) -> Result<DigestTrie, String> {
        let root = tree
            .root
            .as_ref()
            .ok_or_else(|| "Corrupt Tree: no root.".to_owned())?;
        let children_by_digest = tree
            .children
            .iter()
            .map(|child| (Digest::of_bytes(&child.to_bytes()), child.clone()))
            .collect::<HashMap<_, _>>();
        Self::from_remexec_directories(root, &children_by_digest)
    }

    pub fn as_remexec_directory(&self) -> remexec::Directory {
        serialize_children(&self.0.children)
    }

    pub fn compute_root_digest(&self) -> Digest {
        self.0.digest
    }

    ///
    /// The immediate children of this trie, as views.
    ///
    pub fn entries(&self) -> Vec<Entry> {
        self.0
            .children
            .iter()
            .map(|(name, child)| Entry::new(name, child))
            .collect()
    }

    ///
    /// All digests reachable from (and including) this trie.
    ///
    pub fn digests(&self) -> Vec<Digest> {
        let mut digests = vec![self.0.digest];
        self.collect_digests(&mut digests);
        digests
    }

    fn collect_digests(&self, digests: &mut Vec<Digest>) {
        for child in self.0.children.values() {
            match child {
                ChildEntry::File { digest, .. } => digests.push(*digest),
                ChildEntry::Symlink { .. } => {}
                ChildEntry::Directory(trie) => {
                    digests.push(trie.0.digest);
                    trie.collect_digests(digests);
                }
            }
        }
    }

    ///
    /// The transitive `(digest, Directory proto)` pairs of this trie, including the root.
    ///
    pub fn collect_directories(&self) -> Vec<(Digest, remexec::Directory)> {
        let mut result = vec![(self.0.digest, self.as_remexec_directory())];
        for child in self.0.children.values() {
            if let ChildEntry::Directory(trie) = child {
                result.extend(trie.collect_directories());
            }
        }
        result
    }

    pub fn files(&self, symlink_behavior: SymlinkBehavior) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.walk(symlink_behavior, &mut |path, entry| {
            if let Entry::File(_) = entry {
                files.push(path.to_owned())
            }
        });
        files
    }

    pub fn directories(&self, symlink_behavior: SymlinkBehavior) -> Vec<PathBuf> {
        let mut directories = Vec::new();
        self.walk(symlink_behavior, &mut |path, entry| {
            if let Entry::Directory(_) = entry {
                directories.push(path.to_owned())
            }
        });
        directories
    }

    pub fn symlinks(&self) -> Vec<PathBuf> {
        let mut symlinks = Vec::new();
        self.walk(SymlinkBehavior::Aware, &mut |path, entry| {
            if let Entry::Symlink(_) = entry {
                symlinks.push(path.to_owned())
            }
        });
        symlinks
    }

    ///
    /// Visit every entry in the tree with its path, in canonical (depth-first, name) order.
    ///
    /// With `SymlinkBehavior::Oblivious`, symlinks are resolved within the tree: dead or
    /// overly-deep links are skipped, and `f` never observes a Symlink entry.
    ///
    pub fn walk(&self, symlink_behavior: SymlinkBehavior, f: &mut impl FnMut(&Path, &Entry)) {
        self.walk_helper(self, &PathBuf::new(), symlink_behavior, 0, f);
    }

    fn walk_helper(
        &self,
        root: &DigestTrie,
        prefix: &Path,
        symlink_behavior: SymlinkBehavior,
        link_depth: LinkDepth,
        f: &mut impl FnMut(&Path, &Entry),
    ) {
        for (name, child) in &self.0.children {
            let path = prefix.join(name.as_str());
            let mut entry = Entry::new(name, child);

            if let (SymlinkBehavior::Oblivious, Entry::Symlink(symlink)) =
                (symlink_behavior, &entry)
            {
                if link_depth >= MAX_LINK_DEPTH {
                    log::warn!("Exceeded the maximum link depth at {path:?}: halting traversal.");
                    return;
                }
                let Ok(destination) = RelativePath::new(prefix.join(symlink.target())) else {
                    continue;
                };
                match root.entry_at(destination.as_ref(), link_depth + 1) {
                    Ok(Some(resolved)) => entry = resolved,
                    _ => continue,
                }
            }

            f(&path, &entry);
            if let Entry::Directory(d) = &entry {
                d.trie
                    .walk_helper(root, &path, symlink_behavior, link_depth, f);
            }
        }
    }

    ///
    /// Locate the entry at the given relative path, following symlinks within the tree.
    ///
    /// Returns Ok(None) if the path does not exist, and Err if it is structurally invalid (a
    /// file used as a directory, or a symlink chain that is too deep).
    ///
    pub fn entry(&self, path: &Path) -> Result<Option<Entry>, String> {
        self.entry_at(path, 0)
    }

    fn entry_at(&self, path: &Path, link_depth: LinkDepth) -> Result<Option<Entry>, String> {
        if link_depth >= MAX_LINK_DEPTH {
            return Err(format!("Too many levels of symlinks while resolving {path:?}."));
        }

        let mut trie = self;
        let mut components = path
            .components()
            .filter(|component| !matches!(component, Component::CurDir))
            .peekable();

        while let Some(component) = components.next() {
            let Component::Normal(name) = component else {
                return Err(format!("Unsupported component in {path:?}: {component:?}"));
            };
            let name = name
                .to_str()
                .ok_or_else(|| format!("{name:?} is not representable in UTF8"))?;
            let Some((stored_name, child)) = trie.0.children.get_key_value(name) else {
                return Ok(None);
            };

            if components.peek().is_none() {
                return Ok(Some(Entry::new(stored_name, child)));
            }

            match child {
                ChildEntry::Directory(child_trie) => trie = child_trie,
                ChildEntry::Symlink { target } => {
                    // Rewrite the path with the link's target substituted for its name, and
                    // restart from the root.
                    let mut rewritten = PathBuf::new();
                    for consumed in path.components().take_while(|c| c != &component) {
                        rewritten.push(consumed);
                    }
                    rewritten.push(target);
                    for remaining in components {
                        rewritten.push(remaining);
                    }
                    let rewritten = RelativePath::new(rewritten)?;
                    return self.entry_at(rewritten.as_ref(), link_depth + 1);
                }
                ChildEntry::File { .. } => {
                    return Err(format!("{path:?} uses a file as a directory."));
                }
            }
        }

        Err(format!("Cannot resolve the empty path: {path:?}"))
    }

    ///
    /// Nest this trie under the given prefix, one directory per component.
    ///
    pub fn add_prefix(self, prefix: &RelativePath) -> Result<DigestTrie, String> {
        let mut trie = self;
        for component in prefix.components().rev() {
            let Component::Normal(name) = component else {
                return Err(format!("Prefix {prefix} contained a non-normal component."));
            };
            let name = Name::new(
                name.to_str()
                    .ok_or_else(|| format!("{name:?} is not representable in UTF8"))?,
            )?;
            let mut children = BTreeMap::new();
            children.insert(name, ChildEntry::Directory(trie));
            trie = DigestTrie::from_children(children);
        }
        Ok(trie)
    }

    ///
    /// Merge the given tries into one, failing if same-named leaves collide with differing
    /// content.
    ///
    pub fn merge(tries: Vec<DigestTrie>) -> Result<DigestTrie, String> {
        Self::merge_helper(&PathBuf::new(), tries)
    }

    fn merge_helper(parent_path: &Path, tries: Vec<DigestTrie>) -> Result<DigestTrie, String> {
        if tries.len() == 1 {
            return Ok(tries.into_iter().next().unwrap());
        }

        // Group each name's occurrences across all inputs.
        let mut grouped: BTreeMap<Name, Vec<ChildEntry>> = BTreeMap::new();
        for trie in &tries {
            for (name, child) in &trie.0.children {
                grouped
                    .entry(name.clone())
                    .or_default()
                    .push(child.clone());
            }
        }

        let mut children = BTreeMap::new();
        for (name, mut group) in grouped {
            let merged = if group.len() == 1 {
                group.pop().unwrap()
            } else if group
                .iter()
                .all(|child| child_digest_key(child) == child_digest_key(&group[0]))
            {
                // Identical occurrences collapse.
                group.pop().unwrap()
            } else {
                // Only directories can be merged structurally.
                let child_tries = group
                    .into_iter()
                    .map(|child| match child {
                        ChildEntry::Directory(trie) => Ok(trie),
                        _ => Err(format!(
                            "Cannot merge the colliding entries at {:?}.",
                            parent_path.join(name.as_str())
                        )),
                    })
                    .collect::<Result<Vec<_>, String>>()?;
                ChildEntry::Directory(Self::merge_helper(
                    &parent_path.join(name.as_str()),
                    child_tries,
                )?)
            };
            children.insert(name, merged);
        }

        Ok(Self::from_children(children))
    }
}

///
/// A comparison key for deciding whether two occurrences of a name are the same entry.
///
fn child_digest_key(child: &ChildEntry) -> (u8, Digest, bool, Option<&Path>) {
    match child {
        ChildEntry::File {
            digest,
            is_executable,
        } => (0, *digest, *is_executable, None),
        ChildEntry::Symlink { target } => (1, EMPTY_DIGEST, false, Some(target)),
        ChildEntry::Directory(trie) => (2, trie.0.digest, false, None),
    }
}

///
/// Render the canonical `Directory` proto for a set of children.
///
fn serialize_children(children: &BTreeMap<Name, ChildEntry>) -> remexec::Directory {
    let mut directory = remexec::Directory::default();
    for (name, child) in children {
        match child {
            ChildEntry::File {
                digest,
                is_executable,
            } => directory.files.push(remexec::FileNode {
                name: name.as_str().to_owned(),
                digest: Some(digest.into()),
                is_executable: *is_executable,
                ..remexec::FileNode::default()
            }),
            ChildEntry::Symlink { target } => directory.symlinks.push(remexec::SymlinkNode {
                name: name.as_str().to_owned(),
                target: target.to_string_lossy().into_owned(),
                ..remexec::SymlinkNode::default()
            }),
            ChildEntry::Directory(trie) => directory.directories.push(remexec::DirectoryNode {
                name: name.as_str().to_owned(),
                digest: Some(trie.0.digest.into()),
            }),
        }
    }
    directory
}
