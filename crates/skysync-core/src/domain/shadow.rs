//! LocalNode shadow tree
//!
//! The shadow tree is the persistent in-memory mirror of a synced subtree.
//! Each [`LocalNode`] pairs one local filesystem entry with its cloud
//! counterpart by identity (handle), not by path; every action the
//! reconciler emits refers to a [`NodeId`], never a raw path.
//!
//! Nodes live in an arena owned by the [`ShadowTree`]; cross-references
//! are indices whose lifetime is bounded by the arena, which keeps the
//! cyclic parent/child/handle references safe without interior mutability.
//!
//! ## Invariants
//!
//! - (I1) Every node except the root has a parent, and that parent is a
//!   folder.
//! - (I2) `children` is keyed by cloud-canonical name; names are unique
//!   among siblings.
//! - (I3) If a node is paired with a cloud handle, their names agree
//!   after canonicalization (enforced by the reconciler; checked here).
//! - (I4) A node's `local_name` is unique among its siblings.
//!
//! A violation is fatal for the owning sync: [`ShadowTree::check_invariants`]
//! reports it and the engine disables the sync rather than limping on.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::fingerprint::Fingerprint;
use super::newtypes::NodeHandle;

// ============================================================================
// NodeId / NodeKind
// ============================================================================

/// Index of a node within its owning [`ShadowTree`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Kind of a synced entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Regular file
    File,
    /// Directory
    Folder,
}

// ============================================================================
// LocalNode
// ============================================================================

/// One live entry of the synced subtree: the meeting point of a local
/// filesystem path and a cloud handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNode {
    kind: NodeKind,
    /// Cloud-canonical name
    name: String,
    /// Filesystem-canonical name (may differ via `%xx` escaping)
    local_name: String,
    parent: Option<NodeId>,
    /// Children keyed by cloud-canonical name
    children: HashMap<String, NodeId>,
    /// Content identity; folders have none
    fingerprint: Option<Fingerprint>,
    /// Paired cloud node, if any
    remote: Option<NodeHandle>,
    /// Tombstone kept until both sides have observed the removal
    deleted: bool,
}

impl LocalNode {
    /// Kind of this entry
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// True for folders
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder)
    }

    /// Cloud-canonical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-canonical name
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Owning node, `None` for the root
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children keyed by cloud-canonical name
    pub fn children(&self) -> &HashMap<String, NodeId> {
        &self.children
    }

    /// Content identity, if computed
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    /// Paired cloud handle, if any
    pub fn remote(&self) -> Option<NodeHandle> {
        self.remote
    }

    /// True once the entry is tombstoned
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Sets the content identity
    pub fn set_fingerprint(&mut self, fp: Fingerprint) {
        self.fingerprint = Some(fp);
    }

    /// Clears the content identity
    pub fn clear_fingerprint(&mut self) {
        self.fingerprint = None;
    }
}

// ============================================================================
// ShadowTree
// ============================================================================

/// Arena-backed shadow tree for one sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTree {
    slots: Vec<Option<LocalNode>>,
    free: Vec<usize>,
    root: NodeId,
    /// Secondary index: cloud handle -> node
    by_handle: HashMap<NodeHandle, NodeId>,
}

impl ShadowTree {
    /// Creates a tree whose root folder pairs the sync root with the
    /// cloud subtree root.
    #[must_use]
    pub fn new(root_handle: NodeHandle) -> Self {
        let root_node = LocalNode {
            kind: NodeKind::Folder,
            name: String::new(),
            local_name: String::new(),
            parent: None,
            children: HashMap::new(),
            fingerprint: None,
            remote: Some(root_handle),
            deleted: false,
        };
        let mut by_handle = HashMap::new();
        by_handle.insert(root_handle, NodeId(0));
        Self {
            slots: vec![Some(root_node)],
            free: Vec::new(),
            root: NodeId(0),
            by_handle,
        }
    }

    /// The root node id
    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of live nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// True when only the root exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Borrows a node
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&LocalNode> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Mutably borrows a node
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut LocalNode> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn expect_node(&self, id: NodeId) -> Result<&LocalNode, DomainError> {
        self.node(id)
            .ok_or_else(|| DomainError::NodeNotFound(id.to_string()))
    }

    /// Adds a child under `parent`.
    ///
    /// # Errors
    /// - `NodeNotFound` if the parent is gone
    /// - `InvalidState` if the parent is a file (I1)
    /// - `DuplicateName` if a sibling already has `name` (I2) or
    ///   `local_name` (I4)
    pub fn add_child(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        name: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Result<NodeId, DomainError> {
        let name = name.into();
        let local_name = local_name.into();

        let parent_node = self.expect_node(parent)?;
        if !parent_node.is_folder() {
            return Err(DomainError::InvalidState {
                from: "File".to_string(),
                to: "parent".to_string(),
            });
        }
        if parent_node.children.contains_key(&name) {
            return Err(DomainError::DuplicateName(name));
        }
        if parent_node
            .children
            .values()
            .filter_map(|&c| self.node(c))
            .any(|c| c.local_name == local_name)
        {
            return Err(DomainError::DuplicateName(local_name));
        }

        let node = LocalNode {
            kind,
            name: name.clone(),
            local_name,
            parent: Some(parent),
            children: HashMap::new(),
            fingerprint: None,
            remote: None,
            deleted: false,
        };

        let id = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        };

        if let Some(p) = self.node_mut(parent) {
            p.children.insert(name, id);
        }
        Ok(id)
    }

    /// Pairs a node with a cloud handle, keeping the handle index current.
    ///
    /// # Errors
    /// `NodeNotFound` if the node is gone.
    pub fn set_remote(&mut self, id: NodeId, handle: NodeHandle) -> Result<(), DomainError> {
        let old = {
            let node = self
                .node_mut(id)
                .ok_or_else(|| DomainError::NodeNotFound(id.to_string()))?;
            std::mem::replace(&mut node.remote, Some(handle))
        };
        if let Some(old) = old {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, id);
        Ok(())
    }

    /// Unpairs a node from its cloud handle.
    pub fn clear_remote(&mut self, id: NodeId) {
        if let Some(node) = self.node_mut(id) {
            if let Some(old) = node.remote.take() {
                self.by_handle.remove(&old);
            }
        }
    }

    /// Node paired with `handle`, if any
    #[must_use]
    pub fn by_handle(&self, handle: NodeHandle) -> Option<NodeId> {
        self.by_handle.get(&handle).copied()
    }

    /// Child of `parent` with the given cloud-canonical name
    #[must_use]
    pub fn lookup_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent)?.children.get(name).copied()
    }

    /// Child of `parent` with the given filesystem name
    #[must_use]
    pub fn lookup_child_local(&self, parent: NodeId, local_name: &str) -> Option<NodeId> {
        self.node(parent)?
            .children
            .values()
            .copied()
            .find(|&c| self.node(c).map(|n| n.local_name == local_name).unwrap_or(false))
    }

    /// Renames a node (both name forms), re-keying the parent map.
    ///
    /// # Errors
    /// `NodeNotFound` / `DuplicateName` as in [`Self::add_child`].
    pub fn rename(
        &mut self,
        id: NodeId,
        new_name: impl Into<String>,
        new_local_name: impl Into<String>,
    ) -> Result<(), DomainError> {
        let new_name = new_name.into();
        let new_local_name = new_local_name.into();

        let (parent, old_name) = {
            let node = self.expect_node(id)?;
            (node.parent, node.name.clone())
        };

        if let Some(parent) = parent {
            let parent_node = self.expect_node(parent)?;
            if let Some(&existing) = parent_node.children.get(&new_name) {
                if existing != id {
                    return Err(DomainError::DuplicateName(new_name));
                }
            }
            if parent_node
                .children
                .values()
                .filter_map(|&c| self.node(c))
                .any(|c| c.local_name == new_local_name && c.name != old_name)
            {
                return Err(DomainError::DuplicateName(new_local_name));
            }
            if let Some(p) = self.node_mut(parent) {
                p.children.remove(&old_name);
                p.children.insert(new_name.clone(), id);
            }
        }

        if let Some(node) = self.node_mut(id) {
            node.name = new_name;
            node.local_name = new_local_name;
        }
        Ok(())
    }

    /// Moves a node under a new parent, keeping its names.
    ///
    /// # Errors
    /// - `NodeNotFound` / `DuplicateName` as in [`Self::add_child`]
    /// - `InvalidState` when the move would create a cycle or the root is
    ///   being moved
    pub fn move_node(&mut self, id: NodeId, new_parent: NodeId) -> Result<(), DomainError> {
        if id == self.root {
            return Err(DomainError::InvalidState {
                from: "root".to_string(),
                to: "child".to_string(),
            });
        }

        // Walking up from the target must not pass through the moved node
        let mut cursor = Some(new_parent);
        while let Some(c) = cursor {
            if c == id {
                return Err(DomainError::InvalidState {
                    from: "ancestor".to_string(),
                    to: "descendant".to_string(),
                });
            }
            cursor = self.expect_node(c)?.parent;
        }

        let (old_parent, name, local_name) = {
            let node = self.expect_node(id)?;
            (node.parent, node.name.clone(), node.local_name.clone())
        };

        let target = self.expect_node(new_parent)?;
        if !target.is_folder() {
            return Err(DomainError::InvalidState {
                from: "File".to_string(),
                to: "parent".to_string(),
            });
        }
        // A same-parent move (pure rename follow-up) collides only with
        // siblings other than the node itself
        if let Some(&existing) = target.children.get(&name) {
            if existing != id {
                return Err(DomainError::DuplicateName(name));
            }
        }
        if target
            .children
            .values()
            .filter(|&&c| c != id)
            .filter_map(|&c| self.node(c))
            .any(|c| c.local_name == local_name)
        {
            return Err(DomainError::DuplicateName(local_name));
        }

        if let Some(old_parent) = old_parent {
            if let Some(p) = self.node_mut(old_parent) {
                p.children.remove(&name);
            }
        }
        if let Some(p) = self.node_mut(new_parent) {
            p.children.insert(name, id);
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = Some(new_parent);
        }
        Ok(())
    }

    /// Marks a node deleted. The tombstone persists until both sides have
    /// observed the removal, at which point [`Self::reap`] frees it.
    pub fn tombstone(&mut self, id: NodeId) {
        if let Some(node) = self.node_mut(id) {
            node.deleted = true;
        }
    }

    /// Frees a tombstoned leaf, unlinking it from its parent and the
    /// handle index.
    ///
    /// # Errors
    /// `InvalidState` unless the node is tombstoned and childless.
    pub fn reap(&mut self, id: NodeId) -> Result<(), DomainError> {
        let node = self.expect_node(id)?;
        if !node.deleted || !node.children.is_empty() {
            return Err(DomainError::InvalidState {
                from: "live".to_string(),
                to: "reaped".to_string(),
            });
        }
        let parent = node.parent;
        let name = node.name.clone();
        let remote = node.remote;

        if let Some(parent) = parent {
            if let Some(p) = self.node_mut(parent) {
                p.children.remove(&name);
            }
        }
        if let Some(handle) = remote {
            self.by_handle.remove(&handle);
        }
        self.slots[id.0] = None;
        self.free.push(id.0);
        Ok(())
    }

    /// Local (filesystem) path of a node relative to the sync root
    #[must_use]
    pub fn local_rel_path(&self, id: NodeId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            match self.node(c) {
                Some(node) if c != self.root => {
                    parts.push(node.local_name.clone());
                    cursor = node.parent;
                }
                _ => break,
            }
        }
        parts.iter().rev().collect()
    }

    /// Cloud-canonical path of a node relative to the sync root
    #[must_use]
    pub fn cloud_rel_path(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            match self.node(c) {
                Some(node) if c != self.root => {
                    parts.push(node.name.clone());
                    cursor = node.parent;
                }
                _ => break,
            }
        }
        parts.reverse();
        parts.join("/")
    }

    /// Depth-first (parents before children) order of all live node ids
    #[must_use]
    pub fn walk_dfs(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node(id) {
                out.push(id);
                // Deterministic order keeps test output stable
                let mut kids: Vec<_> = node.children.values().copied().collect();
                kids.sort_by_key(|k| self.node(*k).map(|n| n.name.clone()).unwrap_or_default());
                for kid in kids.into_iter().rev() {
                    stack.push(kid);
                }
            }
        }
        out
    }

    /// Verifies invariants I1, I2, and I4 over the whole tree.
    ///
    /// I3 (paired names agree after canonicalization) needs the cloud
    /// mirror and is checked by the reconciler.
    ///
    /// # Errors
    /// `DomainError::Inconsistency` naming the first violation found.
    pub fn check_invariants(&self) -> Result<(), DomainError> {
        for id in self.walk_dfs() {
            let node = self.expect_node(id)?;

            if id != self.root {
                let parent = node.parent.ok_or_else(|| {
                    DomainError::Inconsistency(format!("{id} has no parent"))
                })?;
                let parent_node = self.expect_node(parent)?;
                if !parent_node.is_folder() {
                    return Err(DomainError::Inconsistency(format!(
                        "{id} parented by a file"
                    )));
                }
                if parent_node.children.get(node.name()) != Some(&id) {
                    return Err(DomainError::Inconsistency(format!(
                        "{id} not keyed by its name under its parent"
                    )));
                }
            }

            let mut seen_local = HashMap::new();
            for (name, &child) in &node.children {
                let child_node = self.expect_node(child)?;
                if child_node.name != *name {
                    return Err(DomainError::Inconsistency(format!(
                        "{child} keyed as {name:?} but named {:?}",
                        child_node.name
                    )));
                }
                if let Some(other) = seen_local.insert(child_node.local_name.clone(), child) {
                    return Err(DomainError::Inconsistency(format!(
                        "{child} and {other} share local name {:?}",
                        child_node.local_name
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
