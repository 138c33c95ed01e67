//! Remote delta consumer
//!
//! Applies server-pushed tree mutations to the in-memory [`CloudTree`]
//! mirror. Batches apply atomically with respect to the reconciler (a
//! whole [`DeltaBatch`] is consumed inside the reconciler task before any
//! decision runs) and in server-assigned order; out-of-order batches are
//! rejected so a dropped message surfaces as an error instead of silent
//! divergence.

use std::collections::HashSet;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use skysync_core::domain::{CloudTree, NodeHandle};
use skysync_core::ports::{DeltaBatch, RemoteDelta};

/// Applies delta batches to the cloud mirror and tracks sequence order.
#[derive(Debug, Default)]
pub struct DeltaConsumer {
    last_seq: Option<u64>,
}

/// What a batch touched, for shadow-tree re-examination
#[derive(Debug, Default)]
pub struct AppliedBatch {
    /// Handles whose node changed (added, moved, attrs)
    pub touched: HashSet<NodeHandle>,
    /// Handles removed from the tree (including subtree members)
    pub removed: HashSet<NodeHandle>,
    /// True when the batch was caused by another client
    pub foreign: bool,
}

impl DeltaConsumer {
    /// Creates a consumer with no sequence history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one batch to `tree`, returning the affected handle sets.
    ///
    /// # Errors
    /// Fails when the batch arrives out of order; the caller must treat
    /// this as mirror loss and refetch the remote tree.
    pub fn apply(&mut self, tree: &mut CloudTree, batch: DeltaBatch) -> Result<AppliedBatch> {
        if let Some(last) = self.last_seq {
            if batch.seq <= last {
                debug!(seq = batch.seq, last, "Stale delta batch skipped");
                return Ok(AppliedBatch {
                    foreign: batch.foreign,
                    ..AppliedBatch::default()
                });
            }
            if batch.seq != last + 1 {
                bail!("Delta gap: expected {}, got {}", last + 1, batch.seq);
            }
        }
        self.last_seq = Some(batch.seq);

        let mut applied = AppliedBatch {
            foreign: batch.foreign,
            ..AppliedBatch::default()
        };

        for delta in batch.deltas {
            match delta {
                RemoteDelta::Added(node) => {
                    applied.touched.insert(node.handle);
                    debug!(handle = %node.handle, name = %node.name, "Delta: node added");
                    tree.upsert(node);
                }
                RemoteDelta::Removed(handle) => {
                    let removed = tree.remove_subtree(handle);
                    if removed.is_empty() {
                        warn!(handle = %handle, "Delta removes unknown node");
                    }
                    debug!(handle = %handle, count = removed.len(), "Delta: subtree removed");
                    applied.removed.extend(removed);
                }
                RemoteDelta::Moved {
                    handle,
                    new_parent,
                    new_name,
                } => {
                    if tree.move_node(handle, new_parent, new_name).is_err() {
                        warn!(handle = %handle, "Delta moves unknown node");
                    } else {
                        debug!(handle = %handle, parent = %new_parent, "Delta: node moved");
                        applied.touched.insert(handle);
                    }
                }
                RemoteDelta::AttrsChanged { handle, attrs } => {
                    if tree.set_attrs(handle, attrs).is_err() {
                        warn!(handle = %handle, "Delta updates attrs of unknown node");
                    } else {
                        applied.touched.insert(handle);
                    }
                }
            }
        }

        Ok(applied)
    }

    /// Resets sequence tracking after a full `fetch_nodes` reload.
    pub fn reset(&mut self, seq: Option<u64>) {
        self.last_seq = seq;
    }
}

// ============================================================================
// Unit tests
// ============================================================================
