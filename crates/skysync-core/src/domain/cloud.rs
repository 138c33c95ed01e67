//! In-memory mirror of the remote tree
//!
//! The engine keeps a [`CloudTree`] per account: the set of cloud nodes it
//! currently believes exist, keyed by immutable handle. The remote delta
//! consumer mutates this mirror; the reconciler only ever reads it.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::fingerprint::Fingerprint;
use super::newtypes::NodeHandle;
use super::shadow::NodeKind;

/// Attribute key carrying the restore-from-rubbish back-reference:
/// the base64 handle of the node's parent before it was rubbished.
pub const RESTORE_ATTR: &str = "rr";

// ============================================================================
// CloudNode
// ============================================================================

/// One node of the remote tree, as mirrored locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudNode {
    /// Immutable server-assigned identity
    pub handle: NodeHandle,
    /// Containing folder; `None` for roots (cloud drive root, rubbish)
    pub parent: Option<NodeHandle>,
    /// File or folder
    pub kind: NodeKind,
    /// Cloud-canonical name
    pub name: String,
    /// Content identity; folders have none
    pub fingerprint: Option<Fingerprint>,
    /// Free-form node attributes, including [`RESTORE_ATTR`]
    pub attrs: BTreeMap<String, String>,
}

impl CloudNode {
    /// Creates a file node
    #[must_use]
    pub fn file(
        handle: NodeHandle,
        parent: NodeHandle,
        name: impl Into<String>,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            handle,
            parent: Some(parent),
            kind: NodeKind::File,
            name: name.into(),
            fingerprint: Some(fingerprint),
            attrs: BTreeMap::new(),
        }
    }

    /// Creates a folder node
    #[must_use]
    pub fn folder(handle: NodeHandle, parent: Option<NodeHandle>, name: impl Into<String>) -> Self {
        Self {
            handle,
            parent,
            kind: NodeKind::Folder,
            name: name.into(),
            fingerprint: None,
            attrs: BTreeMap::new(),
        }
    }

    /// True for folders
    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder)
    }

    /// Stamps the restore back-reference with the original parent handle
    pub fn set_restore_ref(&mut self, original_parent: NodeHandle) {
        self.attrs
            .insert(RESTORE_ATTR.to_string(), original_parent.to_base64());
    }

    /// Reads the restore back-reference, if stamped
    #[must_use]
    pub fn restore_ref(&self) -> Option<NodeHandle> {
        self.attrs
            .get(RESTORE_ATTR)
            .and_then(|v| NodeHandle::from_base64(v).ok())
    }

    /// Clears the restore back-reference
    pub fn clear_restore_ref(&mut self) {
        self.attrs.remove(RESTORE_ATTR);
    }
}

// ============================================================================
// CloudTree
// ============================================================================

/// The mirrored remote tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloudTree {
    nodes: HashMap<NodeHandle, CloudNode>,
}

impl CloudTree {
    /// Creates an empty mirror
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mirrored nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing is mirrored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Borrows a node
    #[must_use]
    pub fn node(&self, handle: NodeHandle) -> Option<&CloudNode> {
        self.nodes.get(&handle)
    }

    /// Mutably borrows a node
    pub fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut CloudNode> {
        self.nodes.get_mut(&handle)
    }

    /// Inserts or replaces a node
    pub fn upsert(&mut self, node: CloudNode) {
        self.nodes.insert(node.handle, node);
    }

    /// Removes a node and its entire subtree, returning the removed handles.
    pub fn remove_subtree(&mut self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut removed = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            stack.extend(self.children(h).into_iter().map(|c| c.handle));
            if self.nodes.remove(&h).is_some() {
                removed.push(h);
            }
        }
        removed
    }

    /// Reparents and renames a node.
    ///
    /// # Errors
    /// `NodeNotFound` if the node is unknown.
    pub fn move_node(
        &mut self,
        handle: NodeHandle,
        new_parent: NodeHandle,
        new_name: impl Into<String>,
    ) -> Result<(), DomainError> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| DomainError::NodeNotFound(handle.to_string()))?;
        node.parent = Some(new_parent);
        node.name = new_name.into();
        Ok(())
    }

    /// Merges attribute updates into a node.
    ///
    /// # Errors
    /// `NodeNotFound` if the node is unknown.
    pub fn set_attrs(
        &mut self,
        handle: NodeHandle,
        attrs: BTreeMap<String, String>,
    ) -> Result<(), DomainError> {
        let node = self
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| DomainError::NodeNotFound(handle.to_string()))?;
        for (k, v) in attrs {
            node.attrs.insert(k, v);
        }
        Ok(())
    }

    /// Children of a folder (linear scan; the mirror is read-mostly)
    #[must_use]
    pub fn children(&self, parent: NodeHandle) -> Vec<&CloudNode> {
        self.nodes
            .values()
            .filter(|n| n.parent == Some(parent))
            .collect()
    }

    /// Child of `parent` with the given cloud name
    #[must_use]
    pub fn lookup(&self, parent: NodeHandle, name: &str) -> Option<&CloudNode> {
        self.nodes
            .values()
            .find(|n| n.parent == Some(parent) && n.name == name)
    }

    /// True when `node` is a descendant of (or equal to) `ancestor`.
    #[must_use]
    pub fn is_under(&self, node: NodeHandle, ancestor: NodeHandle) -> bool {
        let mut cursor = Some(node);
        while let Some(h) = cursor {
            if h == ancestor {
                return true;
            }
            cursor = self.nodes.get(&h).and_then(|n| n.parent);
        }
        false
    }

    /// Cloud path of a node relative to `root` (empty string for the root
    /// itself), or `None` when the node is not under `root`.
    #[must_use]
    pub fn rel_path(&self, node: NodeHandle, root: NodeHandle) -> Option<String> {
        let mut parts = Vec::new();
        let mut cursor = node;
        while cursor != root {
            let n = self.nodes.get(&cursor)?;
            parts.push(n.name.clone());
            cursor = n.parent?;
        }
        parts.reverse();
        Some(parts.join("/"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn h(raw: u64) -> NodeHandle {
        NodeHandle::from_raw(raw)
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes(&[byte; 64], Utc::now())
    }

    fn sample_tree() -> CloudTree {
        let mut t = CloudTree::new();
        t.upsert(CloudNode::folder(h(1), None, "root"));
        t.upsert(CloudNode::folder(h(2), Some(h(1)), "d"));
        t.upsert(CloudNode::file(h(3), h(2), "f", fp(1)));
        t
    }

    #[test]
    fn test_upsert_and_lookup() {
        let t = sample_tree();
        assert_eq!(t.len(), 3);
        assert_eq!(t.lookup(h(1), "d").unwrap().handle, h(2));
        assert_eq!(t.lookup(h(2), "f").unwrap().handle, h(3));
        assert!(t.lookup(h(1), "missing").is_none());
    }

    #[test]
    fn test_children() {
        let t = sample_tree();
        let kids = t.children(h(1));
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].name, "d");
    }

    #[test]
    fn test_remove_subtree() {
        let mut t = sample_tree();
        let removed = t.remove_subtree(h(2));
        assert_eq!(removed.len(), 2);
        assert!(t.node(h(2)).is_none());
        assert!(t.node(h(3)).is_none());
        assert!(t.node(h(1)).is_some());
    }

    #[test]
    fn test_move_node() {
        let mut t = sample_tree();
        t.upsert(CloudNode::folder(h(4), Some(h(1)), "e"));
        t.move_node(h(3), h(4), "renamed").unwrap();

        let moved = t.node(h(3)).unwrap();
        assert_eq!(moved.parent, Some(h(4)));
        assert_eq!(moved.name, "renamed");
        assert!(t.lookup(h(2), "f").is_none());
    }

    #[test]
    fn test_is_under_and_rel_path() {
        let t = sample_tree();
        assert!(t.is_under(h(3), h(1)));
        assert!(t.is_under(h(3), h(2)));
        assert!(!t.is_under(h(2), h(3)));

        assert_eq!(t.rel_path(h(3), h(1)).unwrap(), "d/f");
        assert_eq!(t.rel_path(h(1), h(1)).unwrap(), "");
        assert_eq!(t.rel_path(h(1), h(3)), None);
    }

    #[test]
    fn test_restore_ref_roundtrip() {
        let mut node = CloudNode::file(h(3), h(2), "f", fp(1));
        assert!(node.restore_ref().is_none());

        node.set_restore_ref(h(2));
        assert_eq!(node.restore_ref(), Some(h(2)));
        assert!(node.attrs.contains_key(RESTORE_ATTR));

        node.clear_restore_ref();
        assert!(node.restore_ref().is_none());
    }

    #[test]
    fn test_set_attrs_merges() {
        let mut t = sample_tree();
        let mut attrs = BTreeMap::new();
        attrs.insert("label".to_string(), "red".to_string());
        t.set_attrs(h(3), attrs).unwrap();
        assert_eq!(t.node(h(3)).unwrap().attrs.get("label").unwrap(), "red");
        assert!(t.set_attrs(h(99), BTreeMap::new()).is_err());
    }
}
