//! Generic uniform-depth experiment trees.
//!
//! Every intermediate and final result of an experiment lives in an
//! [`ExperimentTree`] keyed `method -> configuration -> realization`. Parallel
//! trees (completions, models, signals, predictions, per-metric scores) share
//! the same key paths, so a path addresses one cell across all of them.
//!
//! Traversal is depth-first and keeps insertion order. Leaf-hood is decided by
//! the declared depth together with a caller-supplied predicate: a node at leaf
//! depth that is not a leaf, or whose value the predicate rejects, is a
//! [`VimputeError::StructuralMismatch`] rather than something to recurse into.

use crate::error::{Result, VimputeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Depth of every experiment tree: method, configuration, realization.
pub const EXPERIMENT_DEPTH: usize = 3;

/// One key in a tree path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TreeKey {
    Name(String),
    Index(usize),
}

impl TreeKey {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            Self::Index(_) => None,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Self::Index(i) => Some(*i),
            Self::Name(_) => None,
        }
    }
}

impl fmt::Display for TreeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(n) => write!(f, "{n}"),
            Self::Index(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for TreeKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<usize> for TreeKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

/// Ordered chain of keys from the root to a node.
pub type KeyPath = Vec<TreeKey>;

/// Key path for an experiment cell.
pub fn experiment_path(method: &str, configuration: usize, realization: usize) -> KeyPath {
    vec![
        TreeKey::name(method),
        TreeKey::Index(configuration),
        TreeKey::Index(realization),
    ]
}

/// Render a path as `a/b/c` for messages.
pub fn display_path(path: &[TreeKey]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("/")
}

/// Leaf predicate accepting every value.
pub fn any_leaf<T>(_: &T) -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node<T> {
    Leaf(T),
    Branch(Vec<(TreeKey, Node<T>)>),
}

/// A flattened leaf: one key column per level plus the value.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatRow<T> {
    pub keys: KeyPath,
    pub value: T,
}

/// Nested mapping of uniform, declared depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentTree<T> {
    depth: usize,
    children: Vec<(TreeKey, Node<T>)>,
}

fn mismatch(message: String) -> VimputeError {
    VimputeError::StructuralMismatch(message)
}

impl<T> ExperimentTree<T> {
    /// An empty tree whose leaves sit `depth` levels below the root.
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            children: Vec::new(),
        }
    }

    /// An empty `method -> configuration -> realization` tree.
    pub fn experiment() -> Self {
        Self::new(EXPERIMENT_DEPTH)
    }

    /// Build a tree from `(path, value)` pairs, reassembling by key.
    pub fn from_leaves(
        depth: usize,
        leaves: impl IntoIterator<Item = (KeyPath, T)>,
    ) -> Result<Self> {
        let mut tree = Self::new(depth);
        for (path, value) in leaves {
            tree.insert(&path, value)?;
        }
        Ok(tree)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Top-level keys in insertion order.
    pub fn top_keys(&self) -> Vec<&TreeKey> {
        self.children.iter().map(|(k, _)| k).collect()
    }

    /// Insert a leaf. Intermediate branches are created on demand; the path must
    /// have exactly `depth` keys and must not already hold a leaf.
    pub fn insert(&mut self, path: &[TreeKey], value: T) -> Result<()> {
        if path.len() != self.depth {
            return Err(mismatch(format!(
                "path '{}' has {} keys, tree depth is {}",
                display_path(path),
                path.len(),
                self.depth
            )));
        }
        let Some((last, prefix)) = path.split_last() else {
            return Err(mismatch("cannot insert into a depth-0 tree".to_string()));
        };

        let mut level = &mut self.children;
        for key in prefix {
            let pos = match level.iter().position(|(k, _)| k == key) {
                Some(pos) => pos,
                None => {
                    level.push((key.clone(), Node::Branch(Vec::new())));
                    level.len() - 1
                }
            };
            level = match &mut level[pos].1 {
                Node::Branch(children) => children,
                Node::Leaf(_) => {
                    return Err(mismatch(format!(
                        "leaf found above declared depth on path '{}'",
                        display_path(path)
                    )));
                }
            };
        }

        if level.iter().any(|(k, _)| k == last) {
            return Err(mismatch(format!(
                "duplicate leaf at '{}'",
                display_path(path)
            )));
        }
        level.push((last.clone(), Node::Leaf(value)));
        Ok(())
    }

    /// Look up the leaf at `path`.
    pub fn get(&self, path: &[TreeKey]) -> Option<&T> {
        let (last, prefix) = path.split_last()?;
        let mut level = &self.children;
        for key in prefix {
            level = match level.iter().find(|(k, _)| k == key).map(|(_, n)| n)? {
                Node::Branch(children) => children,
                Node::Leaf(_) => return None,
            };
        }
        match level.iter().find(|(k, _)| k == last).map(|(_, n)| n)? {
            Node::Leaf(value) => Some(value),
            Node::Branch(_) => None,
        }
    }

    /// Depth-first map over every leaf, with the key path of each leaf.
    pub fn try_map_leaves_with_path<U, P, F>(
        &self,
        is_leaf: P,
        mut f: F,
    ) -> Result<ExperimentTree<U>>
    where
        P: Fn(&T) -> bool,
        F: FnMut(&[TreeKey], &T) -> Result<U>,
    {
        let mut path = Vec::with_capacity(self.depth);
        let children = map_level(&self.children, self.depth, &mut path, &is_leaf, &mut f)?;
        Ok(ExperimentTree {
            depth: self.depth,
            children,
        })
    }

    /// Depth-first map over every leaf, passing the key path.
    pub fn map_leaves_with_path<U, P, F>(&self, is_leaf: P, mut f: F) -> Result<ExperimentTree<U>>
    where
        P: Fn(&T) -> bool,
        F: FnMut(&[TreeKey], &T) -> U,
    {
        self.try_map_leaves_with_path(is_leaf, |path, value| Ok(f(path, value)))
    }

    /// Depth-first map over every leaf, producing an isomorphic tree.
    pub fn map_leaves<U, P, F>(&self, is_leaf: P, mut f: F) -> Result<ExperimentTree<U>>
    where
        P: Fn(&T) -> bool,
        F: FnMut(&T) -> U,
    {
        self.try_map_leaves_with_path(is_leaf, |_, value| Ok(f(value)))
    }

    /// Apply `f` once per last-level branch to its ordered leaf children,
    /// without recursing further. The result is one level shallower.
    pub fn map_branches<U, F>(&self, mut f: F) -> Result<ExperimentTree<U>>
    where
        F: FnMut(&[TreeKey], &[(&TreeKey, &T)]) -> U,
    {
        if self.depth < 2 {
            return Err(mismatch(format!(
                "cannot collapse branches of a depth-{} tree",
                self.depth
            )));
        }
        let mut path = Vec::with_capacity(self.depth);
        let children = collapse_level(&self.children, self.depth, &mut path, &mut f)?;
        Ok(ExperimentTree {
            depth: self.depth - 1,
            children,
        })
    }

    /// Every leaf with its path, depth-first in insertion order.
    pub fn leaves(&self) -> Result<Vec<(KeyPath, &T)>> {
        let mut out = Vec::new();
        let mut path = Vec::with_capacity(self.depth);
        collect_level(&self.children, self.depth, &mut path, &mut out)?;
        Ok(out)
    }

    /// Leaves whose path starts with `prefix`. Only the subtree under
    /// `prefix` is walked.
    pub fn leaves_under(&self, prefix: &[TreeKey]) -> Result<Vec<(KeyPath, &T)>> {
        if prefix.len() >= self.depth {
            return Ok(self
                .get(prefix)
                .map(|value| vec![(prefix.to_vec(), value)])
                .unwrap_or_default());
        }
        let mut level = &self.children;
        for (depth, key) in prefix.iter().enumerate() {
            level = match level.iter().find(|(k, _)| k == key).map(|(_, n)| n) {
                Some(Node::Branch(children)) => children,
                Some(Node::Leaf(_)) => {
                    return Err(mismatch(format!(
                        "leaf at '{}' sits above declared depth",
                        display_path(&prefix[..=depth])
                    )));
                }
                None => return Ok(Vec::new()),
            };
        }
        let mut out = Vec::new();
        let mut path = prefix.to_vec();
        collect_level(level, self.depth - prefix.len(), &mut path, &mut out)?;
        Ok(out)
    }

    pub fn leaf_count(&self) -> Result<usize> {
        Ok(self.leaves()?.len())
    }

    /// The parallel tree of key paths.
    pub fn path_tree(&self) -> Result<ExperimentTree<KeyPath>> {
        self.map_leaves_with_path(any_leaf, |path, _| path.to_vec())
    }
}

/// Walk two parallel trees in lockstep. Key sets must match at every level;
/// iteration follows the order of `a`.
pub fn zip_with<A, B, U, F>(
    a: &ExperimentTree<A>,
    b: &ExperimentTree<B>,
    mut f: F,
) -> Result<ExperimentTree<U>>
where
    F: FnMut(&[TreeKey], &A, &B) -> Result<U>,
{
    if a.depth != b.depth {
        return Err(mismatch(format!(
            "parallel trees have depths {} and {}",
            a.depth, b.depth
        )));
    }
    let mut path = Vec::with_capacity(a.depth);
    let children = zip_level(&a.children, &b.children, a.depth, &mut path, &mut f)?;
    Ok(ExperimentTree {
        depth: a.depth,
        children,
    })
}

/// Zip a value tree with its path tree into one row per leaf.
pub fn flatten<T: Clone>(
    values: &ExperimentTree<T>,
    paths: &ExperimentTree<KeyPath>,
) -> Result<Vec<FlatRow<T>>> {
    let zipped = zip_with(values, paths, |actual, value, recorded| {
        if actual != recorded.as_slice() {
            return Err(mismatch(format!(
                "path tree records '{}' at '{}'",
                display_path(recorded),
                display_path(actual)
            )));
        }
        Ok(FlatRow {
            keys: recorded.clone(),
            value: value.clone(),
        })
    })?;
    Ok(zipped
        .leaves()?
        .into_iter()
        .map(|(_, row)| row.clone())
        .collect())
}

fn map_level<T, U, P, F>(
    children: &[(TreeKey, Node<T>)],
    remaining: usize,
    path: &mut KeyPath,
    is_leaf: &P,
    f: &mut F,
) -> Result<Vec<(TreeKey, Node<U>)>>
where
    P: Fn(&T) -> bool,
    F: FnMut(&[TreeKey], &T) -> Result<U>,
{
    let mut out = Vec::with_capacity(children.len());
    for (key, node) in children {
        path.push(key.clone());
        let mapped = match node {
            Node::Leaf(value) if remaining == 1 => {
                if !is_leaf(value) {
                    return Err(mismatch(format!(
                        "value at '{}' rejected by leaf predicate",
                        display_path(path)
                    )));
                }
                Node::Leaf(f(path, value)?)
            }
            Node::Branch(_) if remaining == 1 => {
                return Err(mismatch(format!(
                    "nesting continues below declared leaf depth at '{}'",
                    display_path(path)
                )));
            }
            Node::Leaf(_) => {
                return Err(mismatch(format!(
                    "leaf at '{}' sits above declared depth",
                    display_path(path)
                )));
            }
            Node::Branch(grand) => Node::Branch(map_level(grand, remaining - 1, path, is_leaf, f)?),
        };
        path.pop();
        out.push((key.clone(), mapped));
    }
    Ok(out)
}

fn collapse_level<T, U, F>(
    children: &[(TreeKey, Node<T>)],
    remaining: usize,
    path: &mut KeyPath,
    f: &mut F,
) -> Result<Vec<(TreeKey, Node<U>)>>
where
    F: FnMut(&[TreeKey], &[(&TreeKey, &T)]) -> U,
{
    let mut out = Vec::with_capacity(children.len());
    for (key, node) in children {
        path.push(key.clone());
        let collapsed = match node {
            Node::Branch(grand) if remaining == 2 => {
                let mut leaves = Vec::with_capacity(grand.len());
                for (leaf_key, leaf) in grand {
                    match leaf {
                        Node::Leaf(value) => leaves.push((leaf_key, value)),
                        Node::Branch(_) => {
                            return Err(mismatch(format!(
                                "nesting continues below declared leaf depth at '{}/{}'",
                                display_path(path),
                                leaf_key
                            )));
                        }
                    }
                }
                Node::Leaf(f(path, &leaves))
            }
            Node::Branch(grand) => Node::Branch(collapse_level(grand, remaining - 1, path, f)?),
            Node::Leaf(_) => {
                return Err(mismatch(format!(
                    "leaf at '{}' sits above declared depth",
                    display_path(path)
                )));
            }
        };
        path.pop();
        out.push((key.clone(), collapsed));
    }
    Ok(out)
}

fn collect_level<'a, T>(
    children: &'a [(TreeKey, Node<T>)],
    remaining: usize,
    path: &mut KeyPath,
    out: &mut Vec<(KeyPath, &'a T)>,
) -> Result<()> {
    for (key, node) in children {
        path.push(key.clone());
        match node {
            Node::Leaf(value) if remaining == 1 => out.push((path.clone(), value)),
            Node::Branch(grand) if remaining > 1 => collect_level(grand, remaining - 1, path, out)?,
            _ => {
                return Err(mismatch(format!(
                    "node at '{}' does not match declared depth",
                    display_path(path)
                )));
            }
        }
        path.pop();
    }
    Ok(())
}

fn zip_level<A, B, U, F>(
    a: &[(TreeKey, Node<A>)],
    b: &[(TreeKey, Node<B>)],
    remaining: usize,
    path: &mut KeyPath,
    f: &mut F,
) -> Result<Vec<(TreeKey, Node<U>)>>
where
    F: FnMut(&[TreeKey], &A, &B) -> Result<U>,
{
    if a.len() != b.len() {
        return Err(mismatch(format!(
            "parallel branches under '{}' have {} and {} children",
            display_path(path),
            a.len(),
            b.len()
        )));
    }

    let mut out = Vec::with_capacity(a.len());
    for (key, node_a) in a {
        path.push(key.clone());
        let Some((_, node_b)) = b.iter().find(|(k, _)| k == key) else {
            return Err(mismatch(format!(
                "branch '{}' missing from parallel tree",
                display_path(path)
            )));
        };
        let zipped = match (node_a, node_b) {
            (Node::Leaf(va), Node::Leaf(vb)) if remaining == 1 => Node::Leaf(f(path, va, vb)?),
            (Node::Branch(ga), Node::Branch(gb)) if remaining > 1 => {
                Node::Branch(zip_level(ga, gb, remaining - 1, path, f)?)
            }
            _ => {
                return Err(mismatch(format!(
                    "parallel trees disagree on node kind at '{}'",
                    display_path(path)
                )));
            }
        };
        path.pop();
        out.push((key.clone(), zipped));
    }
    Ok(out)
}
